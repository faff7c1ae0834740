//! # rakewire-client
//!
//! Reconnecting client for Rakewire dashboards.
//!
//! - **WebSocket** - The realtime session, authenticated with a bearer token
//! - **Backoff** - Bounded retry schedule after an unexpected disconnect
//! - **Polling** - REST fallback once realtime delivery is given up
//!
//! Subscriptions survive reconnects: the client re-issues every channel it
//! was asked for as soon as a new session is up.
//!
//! ```rust,ignore
//! use rakewire_client::{ClientConfig, ReconnectionClient, WebSocketConnector};
//! use std::sync::Arc;
//!
//! let connector = WebSocketConnector::new("ws://localhost:8080/ws").with_token(token);
//! let (client, mut events, _task) =
//!     ReconnectionClient::spawn(ClientConfig::default(), Arc::new(connector), None);
//!
//! client.subscribe("tracking")?;
//! while let Some(event) = events.recv().await {
//!     // Update the dashboard
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod fallback;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use client::{ClientConfig, ClientEvent, ClientHandle, ReconnectionClient};
pub use fallback::{Poller, DEFAULT_POLL_INTERVAL};
pub use traits::{ClientError, Connector, FrameSink, FrameStream, Session};

#[cfg(feature = "polling")]
pub use fallback::HttpPoller;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
