//! Channel membership.
//!
//! The directory owns the bidirectional index between channels and
//! connections. Both directions live under one lock, so a reader can never
//! see a connection listed in a channel it is not subscribed to, or the
//! reverse. Channels exist only while they have members.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::policy::AuthorizationPolicy;
use crate::telemetry;
use parking_lot::RwLock;
use rakewire_protocol::ServerFrame;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Validate a channel name.
///
/// Names are opaque: any non-empty printable ASCII string up to
/// [`MAX_CHANNEL_NAME_LENGTH`] bytes.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Directory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Authorization policy refused the channel.
    #[error("Access denied to channel: {0}")]
    AccessDenied(String),

    /// Maximum subscriptions per connection reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,

    /// Connection was removed while the request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Directory limits.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            max_channels: 10_000,
            max_subscriptions_per_connection: 100,
        }
    }
}

/// Result of an accepted subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Membership was added.
    Subscribed,
    /// Connection was already a member.
    AlreadySubscribed,
}

#[derive(Debug, Default)]
struct MembershipIndex {
    /// Channel name -> member connections.
    channels: HashMap<String, HashSet<ConnectionId>>,
    /// Connection -> subscribed channel names. Only non-empty sets are kept.
    subscriptions: HashMap<ConnectionId, HashSet<String>>,
}

impl MembershipIndex {
    fn remove_member(&mut self, channel: &str, connection_id: &str) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(connection_id);
            if members.is_empty() {
                self.channels.remove(channel);
                debug!(channel = %channel, "Deleted empty channel");
            }
        }
    }
}

/// Channel directory.
pub struct ChannelDirectory {
    index: RwLock<MembershipIndex>,
    policy: Arc<dyn AuthorizationPolicy>,
    config: DirectoryConfig,
}

impl ChannelDirectory {
    /// Create a directory that authorizes subscriptions with `policy`.
    #[must_use]
    pub fn new(config: DirectoryConfig, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Self {
            index: RwLock::new(MembershipIndex::default()),
            policy,
            config,
        }
    }

    /// Subscribe a connection to a channel and reply to it.
    ///
    /// On success the connection receives `subscribed`; on any refusal it
    /// receives an `error` frame and nothing is mutated. Subscribing twice is
    /// accepted and acknowledged again.
    ///
    /// # Errors
    ///
    /// Returns the reason the subscription was refused.
    pub fn subscribe(
        &self,
        connection: &ConnectionHandle,
        channel: &str,
    ) -> Result<SubscribeOutcome, DirectoryError> {
        let result = self.try_subscribe(connection, channel);

        let reply = match &result {
            Ok(_) => ServerFrame::subscribed(channel),
            Err(DirectoryError::AccessDenied(name)) => ServerFrame::access_denied(name),
            Err(e) => ServerFrame::error(e.to_string()),
        };
        if let Err(e) = connection.send_frame(&reply) {
            debug!(connection = %connection.id(), channel = %channel, error = %e, "Subscribe reply dropped");
        }

        result
    }

    fn try_subscribe(
        &self,
        connection: &ConnectionHandle,
        channel: &str,
    ) -> Result<SubscribeOutcome, DirectoryError> {
        validate_channel_name(channel).map_err(DirectoryError::InvalidChannel)?;

        if !self.policy.can_access_channel(connection.identity(), channel) {
            warn!(
                connection = %connection.id(),
                user = %connection.identity().user_id,
                channel = %channel,
                "Channel access denied"
            );
            telemetry::record_access_denied();
            return Err(DirectoryError::AccessDenied(channel.to_string()));
        }

        let mut guard = self.index.write();
        let index = &mut *guard;

        // Removal marks the handle closed before taking this lock.
        if connection.is_closed() {
            return Err(DirectoryError::ConnectionClosed);
        }

        let current = index
            .subscriptions
            .get(connection.id().as_str())
            .map_or(0, HashSet::len);
        if index
            .subscriptions
            .get(connection.id().as_str())
            .is_some_and(|subs| subs.contains(channel))
        {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        if current >= self.config.max_subscriptions_per_connection {
            return Err(DirectoryError::MaxSubscriptionsReached);
        }
        if !index.channels.contains_key(channel) && index.channels.len() >= self.config.max_channels {
            return Err(DirectoryError::MaxChannelsReached);
        }

        let members = index.channels.entry(channel.to_string()).or_insert_with(|| {
            debug!(channel = %channel, "Creating new channel");
            HashSet::new()
        });
        members.insert(connection.id().clone());
        let subscribers = members.len();

        index
            .subscriptions
            .entry(connection.id().clone())
            .or_default()
            .insert(channel.to_string());

        let channel_count = index.channels.len();
        drop(guard);

        telemetry::record_subscription();
        telemetry::set_active_channels(channel_count);
        debug!(
            channel = %channel,
            connection = %connection.id(),
            subscribers,
            "Subscribed"
        );

        Ok(SubscribeOutcome::Subscribed)
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `true` if the connection was subscribed. Unsubscribing from a
    /// channel the connection never joined is a no-op.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, channel: &str) -> bool {
        let mut guard = self.index.write();
        let index = &mut *guard;

        let removed = match index.subscriptions.get_mut(connection_id.as_str()) {
            Some(subs) => {
                let removed = subs.remove(channel);
                if subs.is_empty() {
                    index.subscriptions.remove(connection_id.as_str());
                }
                removed
            }
            None => false,
        };

        if removed {
            index.remove_member(channel, connection_id.as_str());
            let channel_count = index.channels.len();
            drop(guard);
            telemetry::set_active_channels(channel_count);
            debug!(channel = %channel, connection = %connection_id, "Unsubscribed");
        }

        removed
    }

    /// Remove a connection from every channel it belongs to.
    ///
    /// Returns the channels it left.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Vec<String> {
        let mut guard = self.index.write();
        let index = &mut *guard;

        let Some(channels) = index.subscriptions.remove(connection_id.as_str()) else {
            return Vec::new();
        };
        for channel in &channels {
            index.remove_member(channel, connection_id.as_str());
        }
        let channel_count = index.channels.len();
        drop(guard);

        telemetry::set_active_channels(channel_count);
        debug!(connection = %connection_id, channels = channels.len(), "Unsubscribed from all channels");

        channels.into_iter().collect()
    }

    /// Current members of a channel.
    #[must_use]
    pub fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.index
            .read()
            .channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels a connection is subscribed to, sorted.
    #[must_use]
    pub fn subscriptions(&self, connection_id: &ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .index
            .read()
            .subscriptions
            .get(connection_id.as_str())
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Whether a connection is subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId, channel: &str) -> bool {
        self.index
            .read()
            .subscriptions
            .get(connection_id.as_str())
            .is_some_and(|subs| subs.contains(channel))
    }

    /// Get the subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.index
            .read()
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.index.read().channels.contains_key(channel)
    }

    /// Number of channels with at least one member.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.index.read().channels.len()
    }

    /// Subscriber count of every channel.
    #[must_use]
    pub fn channel_counts(&self) -> BTreeMap<String, usize> {
        self.index
            .read()
            .channels
            .iter()
            .map(|(name, members)| (name.clone(), members.len()))
            .collect()
    }

    /// Both directions of the index agree.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let index = self.index.read();
        let forward = index.channels.iter().all(|(channel, members)| {
            !members.is_empty()
                && members.iter().all(|id| {
                    index
                        .subscriptions
                        .get(id)
                        .is_some_and(|subs| subs.contains(channel))
                })
        });
        let backward = index.subscriptions.iter().all(|(id, subs)| {
            !subs.is_empty()
                && subs.iter().all(|channel| {
                    index
                        .channels
                        .get(channel)
                        .is_some_and(|members| members.contains(id))
                })
        });
        forward && backward
    }
}
