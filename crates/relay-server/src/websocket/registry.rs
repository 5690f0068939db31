//! Authoritative set of live connections.
//!
//! Entries are keyed by [`ConnectionId`] with a secondary index from identity
//! to connection ids. Iteration always runs over a snapshot taken under the
//! read lock, so a visitor may register or deregister connections without
//! observing a half-updated map. The lock is never held across an `.await`.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::gauge;
use parking_lot::RwLock;
use tracing::debug;

use super::connection::{Connection, ConnectionId};
use crate::errors::RegistryError;
use crate::metrics::CONNECTIONS_ACTIVE;

#[derive(Default)]
struct Inner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_identity: HashMap<String, HashSet<ConnectionId>>,
}

impl Inner {
    fn unindex(&mut self, conn: &Connection) {
        if let Some(ids) = self.by_identity.get_mut(conn.identity()) {
            let _ = ids.remove(conn.id());
            if ids.is_empty() {
                let _ = self.by_identity.remove(conn.identity());
            }
        }
    }
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection.
    ///
    /// Never replaces an existing entry: a colliding id is reported as
    /// [`RegistryError::DuplicateKey`] and the registry is left unchanged.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        self.insert(connection, usize::MAX)
    }

    /// Insert a connection unless `limit` entries are already registered.
    ///
    /// The size check and the insert happen under one write lock, so
    /// concurrent callers can never push the registry past `limit`.
    pub fn register_bounded(
        &self,
        connection: Arc<Connection>,
        limit: usize,
    ) -> Result<(), RegistryError> {
        self.insert(connection, limit)
    }

    fn insert(&self, connection: Arc<Connection>, limit: usize) -> Result<(), RegistryError> {
        let len = {
            let mut inner = self.inner.write();
            if inner.by_id.len() >= limit {
                return Err(RegistryError::Full(inner.by_id.len()));
            }
            match inner.by_id.entry(connection.id().clone()) {
                Entry::Occupied(_) => {
                    return Err(RegistryError::DuplicateKey(connection.id().clone()));
                }
                Entry::Vacant(slot) => {
                    let _ = slot.insert(Arc::clone(&connection));
                }
            }
            let _ = inner
                .by_identity
                .entry(connection.identity().to_owned())
                .or_default()
                .insert(connection.id().clone());
            inner.by_id.len()
        };
        record_active(len);
        debug!(connection_id = %connection.id(), identity = connection.identity(), "registered connection");
        Ok(())
    }

    /// Remove a connection, returning it if it was present.
    ///
    /// Removing an absent id is a no-op: close and liveness termination can
    /// both race to deregister the same connection.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (removed, len) = {
            let mut inner = self.inner.write();
            let removed = inner.by_id.remove(id);
            if let Some(conn) = &removed {
                inner.unindex(conn);
            }
            (removed, inner.by_id.len())
        };
        if removed.is_some() {
            record_active(len);
            debug!(connection_id = %id, "deregistered connection");
        }
        removed
    }

    /// Look up a connection by id.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Every registered connection at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Apply `visitor` to a snapshot of the registry.
    ///
    /// Connections registered while the visitor runs are not visited;
    /// connections deregistered while it runs may still be visited.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Connection>)) {
        for conn in &self.snapshot() {
            visitor(conn);
        }
    }

    /// Connections whose identity equals `identity`.
    pub fn find_by_identity(&self, identity: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        inner
            .by_identity
            .get(identity)
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<_> = {
            let mut inner = self.inner.write();
            inner.by_identity.clear();
            inner.by_id.drain().map(|(_, conn)| conn).collect()
        };
        record_active(0);
        drained
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct identities with at least one connection.
    pub fn identity_count(&self) -> usize {
        self.inner.read().by_identity.len()
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(len: usize) {
    gauge!(CONNECTIONS_ACTIVE).set(len as f64);
}
