//! Live connection registry.
//!
//! The registry is the only owner of [`ConnectionHandle`]s. Removing a
//! connection marks it closed, drops its channel memberships and forgets it
//! in one step; nothing else deletes entries.

use crate::connection::{ConnectionHandle, ConnectionId, OutboundSender};
use crate::directory::ChannelDirectory;
use crate::identity::{Identity, UserId};
use dashmap::DashMap;
use rakewire_protocol::CloseReason;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Server is at its connection limit.
    #[error("Connection limit of {0} reached")]
    CapacityExceeded(usize),
}

/// Connection registry.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    directory: Arc<ChannelDirectory>,
    admitted: AtomicUsize,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry. `max_connections == 0` means unlimited.
    #[must_use]
    pub fn new(directory: Arc<ChannelDirectory>, max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            directory,
            admitted: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Register an authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] at the connection limit.
    pub fn register(
        &self,
        identity: Identity,
        outbound: OutboundSender,
    ) -> Result<Arc<ConnectionHandle>, RegistryError> {
        if self.max_connections > 0 {
            let reserved = self
                .admitted
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < self.max_connections).then_some(n + 1)
                });
            if reserved.is_err() {
                return Err(RegistryError::CapacityExceeded(self.max_connections));
            }
        } else {
            self.admitted.fetch_add(1, Ordering::SeqCst);
        }

        let id = ConnectionId::generate();
        let handle = Arc::new(ConnectionHandle::new(id.clone(), identity, outbound));

        self.by_user
            .entry(handle.identity().user_id.clone())
            .or_default()
            .insert(id.clone());
        self.connections.insert(id.clone(), Arc::clone(&handle));

        info!(
            connection = %id,
            user = %handle.identity().user_id,
            role = %handle.identity().role,
            "Connection registered"
        );

        Ok(handle)
    }

    /// Remove a connection and every membership it holds.
    ///
    /// Returns the removed handle, or `None` if it was already gone.
    /// Calling this twice for the same ID is harmless.
    pub fn remove(&self, id: &ConnectionId, reason: CloseReason) -> Option<Arc<ConnectionHandle>> {
        let handle = self.connections.get(id.as_str()).map(|h| Arc::clone(h.value()))?;

        // Closed first: a subscribe that races this removal sees the flag
        // under the directory lock and backs off.
        if !handle.close(reason) {
            return None;
        }

        let channels = self.directory.remove_connection(id);
        self.connections.remove(id.as_str());
        self.admitted.fetch_sub(1, Ordering::SeqCst);

        let user_id = &handle.identity().user_id;
        if let Some(mut ids) = self.by_user.get_mut(user_id) {
            ids.remove(id.as_str());
        }
        self.by_user.remove_if(user_id, |_, ids| ids.is_empty());

        info!(
            connection = %id,
            user = %user_id,
            reason = %reason,
            channels = channels.len(),
            "Connection removed"
        );

        Some(handle)
    }

    /// Get a connection by ID.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(id.as_str()).map(|h| Arc::clone(h.value()))
    }

    /// All live connections of a user.
    #[must_use]
    pub fn by_identity(&self, user_id: &UserId) -> Vec<Arc<ConnectionHandle>> {
        let ids: Vec<ConnectionId> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Snapshot of every live connection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Channel directory shared with this registry.
    #[must_use]
    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    /// Close every connection.
    pub fn close_all(&self, reason: CloseReason) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        debug!(count = ids.len(), reason = %reason, "Closing all connections");
        for id in ids {
            self.remove(&id, reason);
        }
    }
}
