//! # rakewire-server
//!
//! WebSocket server for the Rakewire realtime layer.
//!
//! The binary wires a [`rakewire_core::Hub`] to axum: every upgrade is
//! authenticated once, registered, and then served by a single task that
//! drains the connection's outbound queue and feeds inbound frames to the
//! hub. `/stats` and `/health` sit next to the WebSocket endpoint.
//!
//! Backend producers publish through the hub's broadcaster:
//!
//! ```rust,ignore
//! let server = Server::new(Config::load()?)?;
//! let broadcaster = server.state().hub.broadcaster().clone();
//! broadcaster.publish_update("tracking", json!({"rakeId": "R-12", "lat": 23.1, "lng": 85.3}))?;
//! ```

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::{Config, ConfigError};
pub use handlers::{run_server, AppState, Server};
