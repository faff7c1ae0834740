//! WebSocket close codes used by Rakewire.

use std::fmt;

/// Normal closure.
pub const NORMAL: u16 = 1000;

/// Server is going away or the peer stopped answering heartbeats.
pub const GOING_AWAY: u16 = 1001;

/// Handshake credential was rejected.
pub const AUTH_FAILED: u16 = 1008;

/// Server at capacity, or the peer could not keep up with its queue.
pub const TRY_AGAIN_LATER: u16 = 1013;

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Peer closed, or the server closed without a specific cause.
    Normal,
    /// Handshake credential rejected.
    AuthFailed,
    /// No pong within a heartbeat cycle.
    LivenessTimeout,
    /// Outbound queue full or gone.
    SlowConsumer,
    /// Registry is at `max_connections`.
    AtCapacity,
    /// Process is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Close code sent on the wire.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => NORMAL,
            CloseReason::AuthFailed => AUTH_FAILED,
            CloseReason::LivenessTimeout | CloseReason::Shutdown => GOING_AWAY,
            CloseReason::SlowConsumer | CloseReason::AtCapacity => TRY_AGAIN_LATER,
        }
    }

    /// Close reason text sent on the wire.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::Normal => "Normal closure",
            CloseReason::AuthFailed => "Authentication failed",
            CloseReason::LivenessTimeout => "Heartbeat timeout",
            CloseReason::SlowConsumer => "Connection too slow",
            CloseReason::AtCapacity => "Server at capacity",
            CloseReason::Shutdown => "Server shutting down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
