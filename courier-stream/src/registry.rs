//! Connection registry: the single shared map from client tokens to
//! live connections.
//!
//! Every mutation goes through the registry's own lock, so lookups and
//! snapshots never observe a half-registered or half-removed
//! connection. The lock is never held across an await or a callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_core::models::ClientToken;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::info;

use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, Result};

struct Inner {
    closed: bool,
    /// Insertion-ordered so snapshots are deterministic within a call.
    connections: IndexMap<ConnectionId, Arc<Connection>>,
}

/// Registry of all currently-open client connections.
///
/// Owned by the [`crate::Broker`] and shared by reference with the
/// dispatcher, reconciler, and per-connection tasks; no component
/// mutates token-to-connection associations any other way.
pub struct Registry {
    inner: Mutex<Inner>,
    total_registered: AtomicU64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                closed: false,
                connections: IndexMap::new(),
            }),
            total_registered: AtomicU64::new(0),
        }
    }

    /// Add a connection and promote it to `Open` in one atomic step.
    ///
    /// Duplicate tokens are always accepted (one client may hold many
    /// devices). Fails only after [`Registry::close`], in which case
    /// the caller must close the connection immediately.
    pub fn register(&self, connection: &Arc<Connection>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            connection.set_open();
            inner
                .connections
                .insert(connection.id(), Arc::clone(connection));
        }
        self.total_registered.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %connection.id(),
            token = %connection.token(),
            active_connections = self.connection_count(),
            "Connection registered"
        );
        Ok(())
    }

    /// Idempotent removal; safe from client close, heartbeat timeout,
    /// dispatcher send failure, and the shutdown sweep alike.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.inner.lock();
            // shift_remove keeps insertion order for later snapshots.
            inner.connections.shift_remove(&id)
        };

        if let Some(connection) = &removed {
            info!(
                connection_id = %id,
                token = %connection.token(),
                reason = connection
                    .close_reason()
                    .map_or_else(|| "unknown".to_string(), |r| r.to_string()),
                duration = ?connection.opened_at().elapsed(),
                active_connections = self.connection_count(),
                "Connection unregistered"
            );
        }
        removed
    }

    /// All live (`Open`) connections held under one token; possibly empty.
    #[must_use]
    pub fn lookup(&self, token: &ClientToken) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .connections
            .values()
            .filter(|c| c.token() == token && c.is_open())
            .cloned()
            .collect()
    }

    /// Every live connection, for broadcast fanout.
    #[must_use]
    pub fn open_connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .connections
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    /// Distinct tokens with at least one live connection, in first-seen
    /// insertion order. Deterministic within one call; consumers must
    /// not read more into the ordering than that.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientToken> {
        let inner = self.inner.lock();
        let mut tokens: IndexSet<&ClientToken> = IndexSet::new();
        for connection in inner.connections.values() {
            if connection.is_open() {
                tokens.insert(connection.token());
            }
        }
        tokens.into_iter().cloned().collect()
    }

    /// Mark the registry closed and drain every entry for the shutdown
    /// sweep. Later `register` calls fail with [`Error::Closed`].
    pub fn close(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.connections.drain(..).map(|(_, c)| c).collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Lifetime count of registrations, for observability.
    #[must_use]
    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseReason;
    use tokio_util::sync::CancellationToken;

    fn open_connection(registry: &Registry, token: &str) -> Arc<Connection> {
        let (connection, _queues) = Connection::new(
            ClientToken::from(token),
            8,
            CancellationToken::new(),
        );
        registry.register(&connection).expect("registry open");
        connection
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let conn = open_connection(&registry, "alpha");

        let found = registry.lookup(&ClientToken::from("alpha"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), conn.id());
        assert!(registry.lookup(&ClientToken::from("beta")).is_empty());
    }

    #[test]
    fn test_duplicate_tokens_are_accepted() {
        let registry = Registry::new();
        open_connection(&registry, "alpha");
        open_connection(&registry, "alpha");

        assert_eq!(registry.lookup(&ClientToken::from("alpha")).len(), 2);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.total_registered(), 2);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = Registry::new();
        let conn = open_connection(&registry, "alpha");

        assert!(registry.unregister(conn.id()).is_some());
        assert!(registry.unregister(conn.id()).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_snapshot_dedups_tokens_in_first_seen_order() {
        // The ["A", "B", "A"] scenario: two devices for A, one for B.
        let registry = Registry::new();
        let a1 = open_connection(&registry, "A");
        open_connection(&registry, "B");
        let a2 = open_connection(&registry, "A");

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![ClientToken::from("A"), ClientToken::from("B")]
        );

        // Dropping one of A's devices keeps A live.
        registry.unregister(a1.id());
        assert_eq!(registry.lookup(&ClientToken::from("A")).len(), 1);
        assert!(registry.snapshot().contains(&ClientToken::from("A")));

        // Dropping the last one removes A entirely.
        registry.unregister(a2.id());
        assert!(registry.lookup(&ClientToken::from("A")).is_empty());
        assert_eq!(registry.snapshot(), vec![ClientToken::from("B")]);
    }

    #[test]
    fn test_lookup_excludes_closing_connections() {
        let registry = Registry::new();
        let conn = open_connection(&registry, "alpha");

        conn.begin_close(CloseReason::HeartbeatTimeout);
        assert!(registry.lookup(&ClientToken::from("alpha")).is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_closed_registry_rejects_registration() {
        let registry = Registry::new();
        open_connection(&registry, "alpha");

        let swept = registry.close();
        assert_eq!(swept.len(), 1);
        assert!(registry.is_closed());
        assert_eq!(registry.connection_count(), 0);

        let (late, _queues) = Connection::new(
            ClientToken::from("beta"),
            8,
            CancellationToken::new(),
        );
        assert!(matches!(registry.register(&late), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_register_unregister_keeps_lookup_exact() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        // Churn: many tasks registering and immediately unregistering
        // under the same token while others look it up.
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let (conn, _queues) = Connection::new(
                        ClientToken::from("shared"),
                        4,
                        CancellationToken::new(),
                    );
                    registry.register(&conn).expect("registry open");
                    let found = registry.lookup(&ClientToken::from("shared"));
                    assert!(!found.is_empty());
                    registry.unregister(conn.id());
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task completed");
        }

        assert!(registry.lookup(&ClientToken::from("shared")).is_empty());
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.total_registered(), 400);
    }
}
