//! Per-connection bookkeeping.
//!
//! A [`ConnectionHandle`] exists from successful handshake until the
//! connection is closed. Everything written to the socket goes through its
//! bounded outbound queue, drained by the connection's own task, so a slow
//! peer can never stall a publisher.
//!
//! State machine: a socket is pending authentication until it is registered
//! (no handle exists yet), then `Active` and `AwaitingPong` alternate with the
//! heartbeat cycle until it becomes `Closed`.

use crate::identity::Identity;
use rakewire_protocol::{codec, CloseReason, ServerFrame};
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Work item for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded JSON text frame, shared across a fan-out.
    Frame(Arc<str>),
    /// Transport-level ping.
    Ping,
    /// Close the socket with the given reason.
    Close(CloseReason),
}

/// Sending half of an outbound queue.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Receiving half of an outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

/// Create a bounded outbound queue.
#[must_use]
pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// A write to one connection could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// Connection closed or its writer is gone.
    #[error("connection closed")]
    Closed,

    /// Outbound queue is full; the write was dropped.
    #[error("outbound queue full")]
    QueueFull,

    /// Frame could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Observable lifecycle state of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Answered the last ping (or sent traffic) this cycle.
    Active,
    /// Pinged, no answer yet.
    AwaitingPong,
    /// Removed from the registry. Terminal.
    Closed,
}

/// Registry entry for one authenticated connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    outbound: OutboundSender,
    alive: AtomicBool,
    closed: AtomicBool,
    flagged: AtomicBool,
    created_at: Instant,
}

impl ConnectionHandle {
    /// Create a handle. New connections start alive.
    #[must_use]
    pub fn new(id: ConnectionId, identity: Identity, outbound: OutboundSender) -> Self {
        Self {
            id,
            identity,
            outbound,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            flagged: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the authenticated identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// When the connection was admitted.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.alive.load(Ordering::SeqCst) {
            ConnectionState::Active
        } else {
            ConnectionState::AwaitingPong
        }
    }

    /// Record a sign of life (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Start a heartbeat cycle: clear the alive flag and return its previous
    /// value.
    pub fn begin_cycle(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the writer side of the outbound queue has gone away.
    #[must_use]
    pub fn writer_gone(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queue a pre-encoded frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryFailure::Closed`] for a closed connection and
    /// [`DeliveryFailure::QueueFull`] when the write was dropped.
    pub fn deliver(&self, payload: Arc<str>) -> Result<(), DeliveryFailure> {
        self.enqueue(Outbound::Frame(payload))
    }

    /// Encode and queue a frame addressed to this connection only.
    ///
    /// # Errors
    ///
    /// See [`ConnectionHandle::deliver`].
    pub fn send_frame(&self, frame: &ServerFrame) -> Result<(), DeliveryFailure> {
        let text = codec::encode_server(frame).map_err(|e| DeliveryFailure::Encode(e.to_string()))?;
        self.deliver(Arc::from(text))
    }

    /// Queue a transport ping.
    ///
    /// # Errors
    ///
    /// See [`ConnectionHandle::deliver`].
    pub fn ping(&self) -> Result<(), DeliveryFailure> {
        self.enqueue(Outbound::Ping)
    }

    fn enqueue(&self, item: Outbound) -> Result<(), DeliveryFailure> {
        if self.is_closed() {
            return Err(DeliveryFailure::Closed);
        }
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::QueueFull,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// Mark closed and ask the writer to close the socket.
    ///
    /// Returns `false` if the connection was already closed. The close item
    /// is best-effort: dropping the last handle also ends the writer.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.outbound.try_send(Outbound::Close(reason));
        true
    }

    /// Flag for an out-of-cycle liveness check. Returns `true` only for the
    /// first flag since the last check.
    pub(crate) fn flag(&self) -> bool {
        !self.flagged.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_flag(&self) {
        self.flagged.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (ConnectionHandle, OutboundReceiver) {
        let (tx, rx) = outbound_channel(capacity);
        (
            ConnectionHandle::new(ConnectionId::generate(), Identity::anonymous(), tx),
            rx,
        )
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_state_transitions() {
        let (conn, _rx) = handle(4);
        assert_eq!(conn.state(), ConnectionState::Active);

        assert!(conn.begin_cycle());
        assert_eq!(conn.state(), ConnectionState::AwaitingPong);

        conn.mark_alive();
        assert_eq!(conn.state(), ConnectionState::Active);

        assert!(conn.close(CloseReason::Normal));
        assert!(!conn.close(CloseReason::Normal));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_full_queue_drops_write() {
        let (conn, mut rx) = handle(1);
        conn.deliver(Arc::from("a")).unwrap();
        assert_eq!(conn.deliver(Arc::from("b")), Err(DeliveryFailure::QueueFull));

        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(Arc::from("a")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_connection_rejects_writes() {
        let (conn, mut rx) = handle(4);
        conn.close(CloseReason::LivenessTimeout);
        assert_eq!(conn.deliver(Arc::from("late")), Err(DeliveryFailure::Closed));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(CloseReason::LivenessTimeout)
        );
    }

    #[test]
    fn test_dropped_writer_reports_closed() {
        let (conn, rx) = handle(4);
        drop(rx);
        assert!(conn.writer_gone());
        assert_eq!(conn.ping(), Err(DeliveryFailure::Closed));
    }

    #[test]
    fn test_flag_once() {
        let (conn, _rx) = handle(4);
        assert!(conn.flag());
        assert!(!conn.flag());
        conn.clear_flag();
        assert!(conn.flag());
    }
}
