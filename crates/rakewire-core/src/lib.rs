//! # rakewire-core
//!
//! Connection state and message fan-out for the Rakewire realtime layer.
//!
//! This crate provides the building blocks the server wires to sockets:
//!
//! - **Auth** - Handshake authentication and the identity it yields
//! - **Registry** - Every live connection, indexed by id and by user
//! - **Directory** - Channel membership and access policy
//! - **Broadcaster** - Fault-isolated publish to channels and users
//! - **Liveness** - Heartbeat sweeps that reclaim dead connections
//! - **Hub** - Client frame handling on top of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Handshake  │────▶│  Registry   │────▶│  Directory  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        ▲       ▲               ▲
//!                        │       │               │
//!              ┌─────────────┐ ┌─────────────┐   │
//!              │  Liveness   │ │ Broadcaster │───┘
//!              └─────────────┘ └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use rakewire_core::{outbound_channel, AllowAll, Hub, HubConfig, Identity};
//! use std::sync::Arc;
//!
//! let (hub, _monitor) = Hub::new(HubConfig::default(), Arc::new(AllowAll));
//! let (tx, mut rx) = outbound_channel(16);
//! let id = hub.connect(Identity::anonymous(), tx).unwrap();
//!
//! hub.handle_text(&id, r#"{"type":"subscribe","channel":"tracking"}"#);
//! assert!(rx.try_recv().is_ok());
//! assert_eq!(hub.stats().connection_count, 1);
//! ```

pub mod auth;
pub mod broadcaster;
pub mod connection;
pub mod directory;
pub mod hub;
pub mod identity;
pub mod liveness;
pub mod policy;
pub mod registry;
pub mod telemetry;

pub use auth::{
    AuthError, AuthValidator, Claims, ConnectionAuthenticator, Handshake, JwtValidator,
    PrincipalStore,
};
pub use broadcaster::{Broadcaster, DeliveryReport};
pub use connection::{
    outbound_channel, ConnectionHandle, ConnectionId, ConnectionState, DeliveryFailure, Outbound,
    OutboundReceiver, OutboundSender, DEFAULT_OUTBOUND_CAPACITY,
};
pub use directory::{ChannelDirectory, DirectoryConfig, DirectoryError, SubscribeOutcome};
pub use hub::{Hub, HubConfig, HubStats};
pub use identity::{Identity, Role, UserId};
pub use liveness::{LivenessMonitor, SweepReport, DEFAULT_HEARTBEAT_INTERVAL};
pub use policy::{AllowAll, AuthorizationPolicy, RolePolicy};
pub use registry::{ConnectionRegistry, RegistryError};
