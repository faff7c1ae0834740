//! The hub ties the registry, directory, broadcaster and liveness monitor
//! together and interprets client frames.

use crate::broadcaster::Broadcaster;
use crate::connection::{ConnectionHandle, ConnectionId, OutboundSender};
use crate::directory::{ChannelDirectory, DirectoryConfig};
use crate::identity::Identity;
use crate::liveness::{LivenessMonitor, DEFAULT_HEARTBEAT_INTERVAL};
use crate::policy::AuthorizationPolicy;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::telemetry;
use rakewire_protocol::codec::{self, MAX_FRAME_SIZE};
use rakewire_protocol::{ClientFrame, CloseReason, ServerFrame};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Channel limits.
    pub directory: DirectoryConfig,
    /// Maximum live connections, 0 for unlimited.
    pub max_connections: usize,
    /// Heartbeat interval; `None` disables sweeps.
    pub heartbeat_interval: Option<Duration>,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            max_connections: 10_000,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Live connections.
    pub connection_count: usize,
    /// Members of each existing channel.
    pub per_channel_subscriber_count: BTreeMap<String, usize>,
}

/// Realtime hub.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    max_frame_size: usize,
}

impl Hub {
    /// Create a hub and the liveness monitor that must be run next to it.
    #[must_use]
    pub fn new(config: HubConfig, policy: Arc<dyn AuthorizationPolicy>) -> (Self, LivenessMonitor) {
        let directory = Arc::new(ChannelDirectory::new(config.directory, policy));
        let registry = Arc::new(ConnectionRegistry::new(directory, config.max_connections));
        let (suspects_tx, suspects_rx) = mpsc::unbounded_channel();

        let hub = Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry), suspects_tx),
            registry: Arc::clone(&registry),
            max_frame_size: config.max_frame_size,
        };
        let monitor = LivenessMonitor::new(registry, config.heartbeat_interval, suspects_rx);

        (hub, monitor)
    }

    /// Admit an authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] at the connection limit.
    pub fn connect(
        &self,
        identity: Identity,
        outbound: OutboundSender,
    ) -> Result<ConnectionId, RegistryError> {
        let handle = self.registry.register(identity, outbound)?;
        Ok(handle.id().clone())
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        self.registry.remove(id, reason).is_some()
    }

    /// Record a pong.
    pub fn mark_alive(&self, id: &ConnectionId) {
        if let Some(handle) = self.registry.get(id) {
            handle.mark_alive();
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Undecodable input is answered with an error frame; the connection
    /// stays open.
    pub fn handle_text(&self, id: &ConnectionId, text: &str) {
        let Some(handle) = self.registry.get(id) else {
            return;
        };
        handle.mark_alive();
        telemetry::record_message("inbound", text.len());

        match codec::decode_client_with_limit(text, self.max_frame_size) {
            Ok(frame) => self.dispatch(&handle, frame),
            Err(e) => {
                debug!(connection = %id, error = %e, "Rejected client frame");
                telemetry::record_error("protocol");
                reply(&handle, &ServerFrame::error(e.client_message()));
            }
        }
    }

    /// Handle one decoded client frame.
    pub fn handle_frame(&self, id: &ConnectionId, frame: ClientFrame) {
        if let Some(handle) = self.registry.get(id) {
            handle.mark_alive();
            self.dispatch(&handle, frame);
        }
    }

    fn dispatch(&self, handle: &ConnectionHandle, frame: ClientFrame) {
        trace!(connection = %handle.id(), frame_type = %frame.frame_type(), "Client frame");

        match &frame {
            ClientFrame::Subscribe { .. } => {
                let names = frame.channel_names();
                if names.is_empty() {
                    reply(handle, &ServerFrame::error("Invalid channel"));
                }
                for name in names {
                    // Refusals are answered by the directory.
                    if let Err(e) = self.directory().subscribe(handle, name) {
                        debug!(connection = %handle.id(), channel = %name, error = %e, "Subscribe refused");
                    }
                }
            }
            ClientFrame::Unsubscribe { .. } => {
                for name in frame.channel_names() {
                    self.directory().unsubscribe(handle.id(), name);
                }
            }
            ClientFrame::Message { channel, data } => {
                let Some(channel) = channel
                    .as_deref()
                    .filter(|c| self.directory().is_subscribed(handle.id(), c))
                else {
                    reply(handle, &ServerFrame::error("Invalid channel"));
                    return;
                };
                let relayed = ServerFrame::Message {
                    channel: channel.to_string(),
                    data: data.clone(),
                    sender: Some(handle.identity().user_id.to_string()),
                };
                if let Err(e) = self.broadcaster.publish(channel, &relayed) {
                    debug!(connection = %handle.id(), error = %e, "Relay failed");
                }
            }
            ClientFrame::Heartbeat { timestamp } => {
                reply(handle, &ServerFrame::heartbeat(*timestamp));
            }
        }
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        self.registry.close_all(CloseReason::Shutdown);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.registry.len(),
            per_channel_subscriber_count: self.directory().channel_counts(),
        }
    }

    /// Broadcaster for event sources.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Channel directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        self.registry.directory()
    }
}

fn reply(handle: &ConnectionHandle, frame: &ServerFrame) {
    if let Err(e) = handle.send_frame(frame) {
        debug!(connection = %handle.id(), error = %e, "Reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{outbound_channel, Outbound, OutboundReceiver};
    use crate::identity::{Role, UserId};
    use crate::policy::{AllowAll, RolePolicy};
    use serde_json::{json, Value};

    fn open_hub() -> Hub {
        Hub::new(HubConfig::default(), Arc::new(AllowAll)).0
    }

    fn connect(hub: &Hub, user: &str, role: Role) -> (ConnectionId, OutboundReceiver) {
        let (tx, rx) = outbound_channel(64);
        let id = hub.connect(Identity::new(user, role), tx).unwrap();
        (id, rx)
    }

    fn frames(rx: &mut OutboundReceiver) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_tracking_update_delivered_verbatim() {
        let hub = open_hub();
        let (id, mut rx) = connect(&hub, "dispatcher", Role::User);

        hub.handle_text(&id, r#"{"type":"subscribe","channel":"tracking"}"#);
        assert_eq!(frames(&mut rx), vec![json!({"type": "subscribed", "channel": "tracking"})]);

        let data = json!({"driverId": "d-17", "lat": 52.37, "lng": 4.89, "heading": 90});
        hub.broadcaster().publish_update("tracking", data.clone()).unwrap();

        assert_eq!(
            frames(&mut rx),
            vec![json!({"type": "update", "channel": "tracking", "data": data})]
        );
    }

    #[test]
    fn test_restricted_channel_denied_without_state_change() {
        let policy = RolePolicy::new().restrict("ops-internal", [Role::Admin]);
        let hub = Hub::new(HubConfig::default(), Arc::new(policy)).0;
        let (id, mut rx) = connect(&hub, "u-1", Role::User);

        let before = hub.stats();
        hub.handle_frame(&id, ClientFrame::subscribe("ops-internal"));

        assert_eq!(
            frames(&mut rx),
            vec![json!({"type": "error", "message": "Access denied to channel: ops-internal"})]
        );
        assert_eq!(hub.stats(), before);

        hub.broadcaster().publish_update("ops-internal", json!("secret")).unwrap();
        assert!(frames(&mut rx).is_empty());
    }

    #[test]
    fn test_subscribe_many_channels() {
        let hub = open_hub();
        let (id, mut rx) = connect(&hub, "u-1", Role::User);

        hub.handle_text(
            &id,
            r#"{"type":"subscribe","channels":["tracking","alerts","tracking"]}"#,
        );
        assert_eq!(frames(&mut rx).len(), 2);
        assert_eq!(hub.directory().subscriptions(&id), vec!["alerts", "tracking"]);

        hub.handle_text(&id, r#"{"type":"unsubscribe","channels":["alerts"]}"#);
        assert!(frames(&mut rx).is_empty());
        assert_eq!(hub.directory().subscriptions(&id), vec!["tracking"]);
    }

    #[test]
    fn test_protocol_errors_keep_connection() {
        let hub = open_hub();
        let (id, mut rx) = connect(&hub, "u-1", Role::User);

        hub.handle_text(&id, r#"{"type":"teleport"}"#);
        hub.handle_text(&id, "not json");
        hub.handle_text(&id, &format!(r#"{{"type":"heartbeat","pad":"{}"}}"#, "x".repeat(MAX_FRAME_SIZE)));

        assert_eq!(
            frames(&mut rx),
            vec![
                json!({"type": "error", "message": "Unknown message type"}),
                json!({"type": "error", "message": "Invalid message format"}),
                json!({"type": "error", "message": "Message too large"}),
            ]
        );
        assert_eq!(hub.stats().connection_count, 1);
    }

    #[test]
    fn test_heartbeat_echoes_timestamp() {
        let hub = open_hub();
        let (id, mut rx) = connect(&hub, "u-1", Role::User);

        hub.handle_text(&id, r#"{"type":"heartbeat","timestamp":1700000000000}"#);
        assert_eq!(
            frames(&mut rx),
            vec![json!({"type": "heartbeat", "timestamp": 1_700_000_000_000u64})]
        );
    }

    #[test]
    fn test_message_relay_requires_membership() {
        let hub = open_hub();
        let (alice, mut rx_alice) = connect(&hub, "alice", Role::User);
        let (bob, mut rx_bob) = connect(&hub, "bob", Role::User);

        hub.handle_frame(&alice, ClientFrame::subscribe("room"));
        hub.handle_frame(&bob, ClientFrame::subscribe("room"));
        frames(&mut rx_alice);
        frames(&mut rx_bob);

        hub.handle_frame(&alice, ClientFrame::message("room", json!({"text": "hi"})));
        let expected = json!({"type": "message", "channel": "room", "data": {"text": "hi"}, "sender": "alice"});
        assert_eq!(frames(&mut rx_bob), vec![expected.clone()]);
        assert_eq!(frames(&mut rx_alice), vec![expected]);

        hub.handle_frame(&alice, ClientFrame::message("elsewhere", json!(1)));
        assert_eq!(
            frames(&mut rx_alice),
            vec![json!({"type": "error", "message": "Invalid channel"})]
        );
        assert!(frames(&mut rx_bob).is_empty());
    }

    #[test]
    fn test_fanout_isolates_unreachable_subscribers() {
        let hub = open_hub();
        let mut live = Vec::new();
        let mut dropped = 0;

        for i in 0..1000 {
            let (tx, rx) = outbound_channel(4);
            let id = hub.connect(Identity::new(format!("u-{i}"), Role::User), tx).unwrap();
            hub.handle_frame(&id, ClientFrame::subscribe("fleet"));
            if i % 10 == 0 {
                drop(rx);
                dropped += 1;
            } else {
                live.push(rx);
            }
        }

        let report = hub.broadcaster().publish_update("fleet", json!({"seq": 1})).unwrap();
        assert_eq!(report.recipients, 1000);
        assert_eq!(report.failed, dropped);
        assert_eq!(report.delivered, 1000 - dropped);

        for rx in &mut live {
            let got = frames(rx);
            assert_eq!(got.last(), Some(&json!({"type": "update", "channel": "fleet", "data": {"seq": 1}})));
        }

        // Only the liveness monitor reclaims; membership is untouched here.
        assert_eq!(hub.directory().subscriber_count("fleet"), 1000);
        assert!(hub.directory().is_consistent());
    }

    #[test]
    fn test_disconnect_updates_stats() {
        let hub = open_hub();
        let (a, _rx_a) = connect(&hub, "a", Role::User);
        let (b, _rx_b) = connect(&hub, "b", Role::User);
        hub.handle_frame(&a, ClientFrame::subscribe("tracking"));
        hub.handle_frame(&b, ClientFrame::subscribe("tracking"));

        assert_eq!(hub.stats().per_channel_subscriber_count.get("tracking"), Some(&2));

        assert!(hub.disconnect(&a, CloseReason::Normal));
        assert!(!hub.disconnect(&a, CloseReason::Normal));

        let stats = hub.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.per_channel_subscriber_count.get("tracking"), Some(&1));
    }

    #[test]
    fn test_stats_serialization() {
        let hub = open_hub();
        let (a, _rx) = connect(&hub, "a", Role::User);
        hub.handle_frame(&a, ClientFrame::subscribe("tracking"));

        let value = serde_json::to_value(hub.stats()).unwrap();
        assert_eq!(
            value,
            json!({"connectionCount": 1, "perChannelSubscriberCount": {"tracking": 1}})
        );
    }

    #[test]
    fn test_send_to_user_after_disconnect() {
        let hub = open_hub();
        let (phone, _rx_phone) = connect(&hub, "u-1", Role::User);
        let (_laptop, mut rx_laptop) = connect(&hub, "u-1", Role::User);

        hub.disconnect(&phone, CloseReason::Normal);
        let report = hub
            .broadcaster()
            .send_to_user(&UserId::new("u-1"), &ServerFrame::direct_update(json!("hello")))
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(frames(&mut rx_laptop), vec![json!({"type": "update", "data": "hello"})]);
    }

    #[test]
    fn test_capacity_rejection() {
        let config = HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        };
        let hub = Hub::new(config, Arc::new(AllowAll)).0;
        let _first = connect(&hub, "a", Role::User);

        let (tx, _rx) = outbound_channel(4);
        assert!(hub.connect(Identity::anonymous(), tx).is_err());
    }

    #[test]
    fn test_racing_lifecycle_keeps_index_consistent() {
        let hub = open_hub();
        let (reap_tx, reap_rx) = std::sync::mpsc::channel::<ConnectionId>();

        std::thread::scope(|s| {
            let hub = &hub;

            // Removals race the subscribes and publishes of the workers.
            s.spawn(move || {
                for id in reap_rx {
                    hub.disconnect(&id, CloseReason::Normal);
                }
            });

            for worker in 0..8 {
                let reap_tx = reap_tx.clone();
                s.spawn(move || {
                    for i in 0..1000 {
                        let (tx, mut rx) = outbound_channel(8);
                        let id = hub
                            .connect(Identity::new(format!("u-{worker}"), Role::User), tx)
                            .unwrap();
                        hub.handle_frame(&id, ClientFrame::subscribe(format!("rake-{}", i % 4)));
                        reap_tx.send(id.clone()).unwrap();
                        hub.handle_frame(&id, ClientFrame::subscribe(format!("yard-{}", i % 3)));
                        hub.broadcaster()
                            .publish_update(&format!("rake-{}", (i + worker) % 4), json!(i))
                            .unwrap();
                        if i % 2 == 0 {
                            hub.disconnect(&id, CloseReason::Normal);
                        }
                        while rx.try_recv().is_ok() {}
                    }
                });
            }
            drop(reap_tx);
        });

        assert!(hub.directory().is_consistent());
        assert_eq!(hub.stats(), HubStats::default());
        assert!(hub.registry().is_empty());
    }
}
