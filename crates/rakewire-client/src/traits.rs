//! Transport abstraction traits for the client.
//!
//! The reconnecting client only ever talks to a [`Connector`], so the
//! WebSocket implementation can be swapped for an in-memory one in tests.

use async_trait::async_trait;
use rakewire_protocol::close::AUTH_FAILED;
use rakewire_protocol::{ClientFrame, ProtocolError, ServerFrame};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not establish the connection.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Server refused the handshake credentials.
    #[error("Unauthorized")]
    Unauthorized,

    /// Server closed the connection with a close frame.
    #[error("Closed by server: {code} {reason}")]
    Closed { code: u16, reason: String },

    /// Connection ended without a close frame.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Polling request failed.
    #[error("Poll failed: {0}")]
    PollFailed(String),

    /// Client task has stopped.
    #[error("Client shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether retrying with the same credentials is pointless.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ClientError::Unauthorized => true,
            ClientError::Closed { code, .. } => *code == AUTH_FAILED,
            _ => false,
        }
    }
}

/// Write half of an established session.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame.
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), ClientError>;

    /// Close the session gracefully.
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Read half of an established session.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next server frame.
    ///
    /// A close from the server is reported as [`ClientError::Closed`]; a
    /// frame that does not decode as [`ClientError::Protocol`], after which
    /// the stream is still usable.
    async fn recv(&mut self) -> Result<ServerFrame, ClientError>;
}

/// An established session, split into halves.
pub struct Session {
    /// Outgoing frames.
    pub sink: Box<dyn FrameSink>,
    /// Incoming frames.
    pub stream: Box<dyn FrameStream>,
}

/// Opens sessions to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session.
    async fn connect(&self) -> Result<Session, ClientError>;

    /// Transport name for logs.
    fn name(&self) -> &'static str;
}
