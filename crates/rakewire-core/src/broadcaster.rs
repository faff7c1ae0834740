//! Fan-out of server frames to channel members and users.
//!
//! A publish encodes its frame once and queues the same text on every
//! recipient without waiting. A recipient whose queue is full or whose writer
//! is gone is skipped and reported to the liveness monitor; the remaining
//! recipients are unaffected, and membership is never changed here.
//!
//! Each connection has one FIFO queue, so frames from one publisher to a
//! channel arrive in the order they were published. Frames from concurrent
//! publishers may interleave differently at different recipients; there is
//! no order across publishers or across channels.

use crate::connection::{ConnectionHandle, ConnectionId, DeliveryFailure};
use crate::identity::UserId;
use crate::registry::ConnectionRegistry;
use crate::telemetry;
use rakewire_protocol::{codec, ProtocolError, ServerFrame};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    /// Members at the time of the publish.
    pub recipients: usize,
    /// Writes queued.
    pub delivered: usize,
    /// Writes dropped.
    pub failed: usize,
}

/// Publishes frames to channels and users.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    suspects: mpsc::UnboundedSender<ConnectionId>,
}

impl Broadcaster {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry>,
        suspects: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self { registry, suspects }
    }

    /// Deliver `frame` to every current member of `channel`.
    ///
    /// Publishing to a channel with no members is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the frame cannot be encoded.
    pub fn publish(&self, channel: &str, frame: &ServerFrame) -> Result<DeliveryReport, ProtocolError> {
        let payload: Arc<str> = Arc::from(codec::encode_server(frame)?);

        // Membership snapshot; the directory lock is not held while writing.
        let members = self.registry.directory().members(channel);
        let mut report = DeliveryReport {
            recipients: members.len(),
            ..DeliveryReport::default()
        };

        for id in &members {
            let Some(handle) = self.registry.get(id) else {
                continue;
            };
            if self.deliver(&handle, Arc::clone(&payload)) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        telemetry::record_fanout(report.delivered);
        trace!(
            channel = %channel,
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            "Published"
        );

        Ok(report)
    }

    /// Publish a backend event as an `update` frame.
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::publish`].
    pub fn publish_update(&self, channel: &str, data: Value) -> Result<DeliveryReport, ProtocolError> {
        self.publish(channel, &ServerFrame::update(channel, data))
    }

    /// Deliver `frame` to every live connection of a user.
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::publish`].
    pub fn send_to_user(&self, user_id: &UserId, frame: &ServerFrame) -> Result<DeliveryReport, ProtocolError> {
        let payload: Arc<str> = Arc::from(codec::encode_server(frame)?);
        let connections = self.registry.by_identity(user_id);

        let mut report = DeliveryReport {
            recipients: connections.len(),
            ..DeliveryReport::default()
        };
        for handle in &connections {
            if self.deliver(handle, Arc::clone(&payload)) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        trace!(user = %user_id, delivered = report.delivered, "Sent to user");
        Ok(report)
    }

    fn deliver(&self, handle: &ConnectionHandle, payload: Arc<str>) -> bool {
        match handle.deliver(payload) {
            Ok(()) => true,
            // Removed between snapshot and write.
            Err(DeliveryFailure::Closed) if handle.is_closed() => false,
            Err(failure) => {
                warn!(connection = %handle.id(), error = %failure, "Delivery failed");
                telemetry::record_delivery_failure(match failure {
                    DeliveryFailure::QueueFull => "queue_full",
                    DeliveryFailure::Closed => "closed",
                    DeliveryFailure::Encode(_) => "encode",
                });
                if handle.flag() {
                    // Monitor gone means shutdown; nothing left to reclaim.
                    let _ = self.suspects.send(handle.id().clone());
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{outbound_channel, Outbound, OutboundReceiver};
    use crate::directory::{ChannelDirectory, DirectoryConfig};
    use crate::identity::{Identity, Role};
    use crate::policy::AllowAll;
    use serde_json::json;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        broadcaster: Broadcaster,
        suspects: mpsc::UnboundedReceiver<ConnectionId>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(ChannelDirectory::new(
            DirectoryConfig::default(),
            Arc::new(AllowAll),
        ));
        let registry = Arc::new(ConnectionRegistry::new(directory, 0));
        let (tx, suspects) = mpsc::unbounded_channel();
        Fixture {
            broadcaster: Broadcaster::new(Arc::clone(&registry), tx),
            registry,
            suspects,
        }
    }

    fn join(
        registry: &ConnectionRegistry,
        user: &str,
        capacity: usize,
        channel: Option<&str>,
    ) -> (Arc<ConnectionHandle>, OutboundReceiver) {
        let (tx, mut rx) = outbound_channel(capacity);
        let handle = registry.register(Identity::new(user, Role::User), tx).unwrap();
        if let Some(channel) = channel {
            registry.directory().subscribe(&handle, channel).unwrap();
            // Discard the acknowledgement.
            rx.try_recv().unwrap();
        }
        (handle, rx)
    }

    fn frame_text(rx: &mut OutboundReceiver) -> Arc<str> {
        match rx.try_recv().unwrap() {
            Outbound::Frame(text) => text,
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_publish_reaches_members_only() {
        let f = fixture();
        let (_a, mut rx_a) = join(&f.registry, "a", 8, Some("tracking"));
        let (_b, mut rx_b) = join(&f.registry, "b", 8, Some("alerts"));

        let report = f
            .broadcaster
            .publish_update("tracking", json!({"lat": 52.1, "lng": 4.3}))
            .unwrap();
        assert_eq!(
            report,
            DeliveryReport {
                recipients: 1,
                delivered: 1,
                failed: 0
            }
        );

        let received: Value = serde_json::from_str(&frame_text(&mut rx_a)).unwrap();
        assert_eq!(
            received,
            json!({"type": "update", "channel": "tracking", "data": {"lat": 52.1, "lng": 4.3}})
        );
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_publish_to_empty_channel() {
        let f = fixture();
        let report = f.broadcaster.publish_update("nobody", json!(1)).unwrap();
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn test_one_encoding_shared_by_all_recipients() {
        let f = fixture();
        let (_a, mut rx_a) = join(&f.registry, "a", 8, Some("tracking"));
        let (_b, mut rx_b) = join(&f.registry, "b", 8, Some("tracking"));

        f.broadcaster.publish_update("tracking", json!("x")).unwrap();
        assert!(Arc::ptr_eq(&frame_text(&mut rx_a), &frame_text(&mut rx_b)));
    }

    #[test]
    fn test_full_queue_is_isolated() {
        let mut f = fixture();
        let (slow, _rx_slow) = join(&f.registry, "slow", 1, Some("tracking"));
        let (_fast, mut rx_fast) = join(&f.registry, "fast", 8, Some("tracking"));

        // Fill the slow queue.
        slow.deliver(Arc::from("backlog")).unwrap();

        let report = f.broadcaster.publish_update("tracking", json!(1)).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(rx_fast.try_recv().is_ok());

        // Reported once even if it keeps failing.
        f.broadcaster.publish_update("tracking", json!(2)).unwrap();
        assert_eq!(f.suspects.try_recv().unwrap(), *slow.id());
        assert!(f.suspects.try_recv().is_err());

        // Membership untouched by the failure.
        assert_eq!(f.registry.directory().subscriber_count("tracking"), 2);
    }

    #[test]
    fn test_dropped_receiver_does_not_abort_fanout() {
        let mut f = fixture();
        let (_gone, rx_gone) = join(&f.registry, "gone", 8, Some("tracking"));
        let (_live, mut rx_live) = join(&f.registry, "live", 8, Some("tracking"));
        drop(rx_gone);

        let report = f.broadcaster.publish_update("tracking", json!(1)).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(rx_live.try_recv().is_ok());
        assert!(f.suspects.try_recv().is_ok());
    }

    #[test]
    fn test_per_publisher_order() {
        let f = fixture();
        let (_a, mut rx) = join(&f.registry, "a", 64, Some("tracking"));

        for i in 0..10 {
            f.broadcaster.publish_update("tracking", json!(i)).unwrap();
        }
        for i in 0..10 {
            let frame = codec::decode_server(&frame_text(&mut rx)).unwrap();
            assert_eq!(frame, ServerFrame::update("tracking", json!(i)));
        }
    }

    #[test]
    fn test_send_to_user_reaches_every_device() {
        let f = fixture();
        let (_phone, mut rx_phone) = join(&f.registry, "u-1", 8, None);
        let (_laptop, mut rx_laptop) = join(&f.registry, "u-1", 8, None);
        let (_other, mut rx_other) = join(&f.registry, "u-2", 8, None);

        let frame = ServerFrame::direct_update(json!({"notice": "shift starts"}));
        let report = f.broadcaster.send_to_user(&UserId::new("u-1"), &frame).unwrap();
        assert_eq!(report.delivered, 2);

        assert!(rx_phone.try_recv().is_ok());
        assert!(rx_laptop.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[test]
    fn test_send_to_unknown_user() {
        let f = fixture();
        let report = f
            .broadcaster
            .send_to_user(&UserId::new("nobody"), &ServerFrame::heartbeat(None))
            .unwrap();
        assert_eq!(report.recipients, 0);
    }

    #[test]
    fn test_concurrent_publishers_keep_own_order() {
        let f = fixture();
        let (_a, mut rx_a) = join(&f.registry, "a", 1024, Some("tracking"));
        let (_b, mut rx_b) = join(&f.registry, "b", 1024, Some("tracking"));

        std::thread::scope(|s| {
            for publisher in 0..2 {
                let broadcaster = &f.broadcaster;
                s.spawn(move || {
                    for seq in 0..200 {
                        broadcaster
                            .publish_update("tracking", json!({"publisher": publisher, "seq": seq}))
                            .unwrap();
                    }
                });
            }
        });

        for rx in [&mut rx_a, &mut rx_b] {
            let mut next = [0u64; 2];
            while let Ok(Outbound::Frame(text)) = rx.try_recv() {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                let publisher = frame["data"]["publisher"].as_u64().unwrap() as usize;
                assert_eq!(frame["data"]["seq"].as_u64().unwrap(), next[publisher]);
                next[publisher] += 1;
            }
            // Only per-publisher order is guaranteed, not the interleaving.
            assert_eq!(next, [200, 200]);
        }
    }
}
