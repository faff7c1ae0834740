//! # rakewire-protocol
//!
//! Wire envelope for the Rakewire realtime layer.
//!
//! Dashboards and the server exchange JSON text frames tagged by `type`:
//!
//! - `subscribe` / `unsubscribe` - Channel membership
//! - `message` - Client broadcast to a channel
//! - `heartbeat` - Application keepalive
//! - `subscribed` / `update` / `error` - Server replies and pushed events
//!
//! ## Example
//!
//! ```rust
//! use rakewire_protocol::{codec, ClientFrame};
//!
//! let frame = codec::decode_client(r#"{"type":"subscribe","channel":"tracking"}"#).unwrap();
//! assert_eq!(frame, ClientFrame::subscribe("tracking"));
//! ```

pub mod close;
pub mod codec;
pub mod frames;

pub use close::CloseReason;
pub use codec::{decode_client, decode_server, encode_client, encode_server, ProtocolError};
pub use frames::{ClientFrame, FrameType, ServerFrame};
