//! The label registry: a concurrent `label -> pool-of-connections` map plus
//! its reverse `connection -> {labels}` index, so a disconnecting
//! connection can be unregistered from every label it joined without a scan.
//!
//! Grounded on the reference `internal/connlib.go` / `internal/container/
//! safemap.go` / `safepool.go` design (optimistic pool creation, atomic
//! empty-pool unlinking, iteration tolerant of concurrent mutation), but
//! built on `dashmap`'s sharded concurrent map instead of a hand-rolled
//! `unsafe.Pointer` CAS list with tombstone reclamation — see DESIGN.md.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::connection::{Connection, ConnectionId};

/// The set of connections currently subscribed to one label. Cheaply
/// cloneable (an `Arc` handle) so a multicast fanout can snapshot the
/// membership list and iterate it without holding the registry's shard
/// lock for the duration of the fanout.
#[derive(Clone, Default)]
pub struct Pool {
    members: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl Pool {
    fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Snapshot-iterate current members. Connections added or removed
    /// concurrently may or may not appear; callers must tolerate that.
    pub fn iter(&self) -> impl Iterator<Item = Arc<Connection>> + '_ {
        self.members.iter().map(|entry| entry.value().clone())
    }
}

/// Concurrent label -> pool map with a reverse connection -> labels index.
#[derive(Default)]
pub struct LabelRegistry {
    labels: DashMap<String, Pool>,
    membership: DashMap<ConnectionId, DashSet<String>>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a label, creating the pool if this is its
    /// first member.
    pub fn register(&self, label: &str, conn: Arc<Connection>) {
        let pool = self
            .labels
            .entry(label.to_string())
            .or_insert_with(Pool::new)
            .clone();
        pool.members.insert(conn.id, conn.clone());
        self.membership
            .entry(conn.id)
            .or_insert_with(DashSet::new)
            .insert(label.to_string());
    }

    /// Unsubscribe a connection from a label. If the pool becomes empty,
    /// the label entry is unlinked so it doesn't leak. Returns whether the
    /// connection actually held the label — callers surface a `false`
    /// result as an application error to the caller.
    pub fn dislabel(&self, label: &str, conn: ConnectionId) -> bool {
        let removed = match self.labels.get(label) {
            Some(pool) => pool.members.remove(&conn).is_some(),
            None => false,
        };
        self.labels.remove_if(label, |_, pool| pool.is_empty());

        if let Some(set) = self.membership.get(&conn) {
            set.remove(label);
        }
        self.membership.remove_if(&conn, |_, set| set.is_empty());

        removed
    }

    /// Unsubscribe a connection from every label it holds — called once,
    /// on disconnect.
    pub fn remove(&self, conn: ConnectionId) {
        let Some((_, labels)) = self.membership.remove(&conn) else {
            return;
        };
        for label in labels.iter() {
            if let Some(pool) = self.labels.get(label.key()) {
                pool.members.remove(&conn);
            }
            self.labels.remove_if(label.key(), |_, pool| pool.is_empty());
        }
    }

    /// Look up the pool for a label, for multicast fanout. Returns `None`
    /// if nobody currently holds the label.
    pub fn pool(&self, label: &str) -> Option<Pool> {
        self.labels.get(label).map(|entry| entry.value().clone())
    }

    /// Number of distinct labels currently registered — for metrics.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn test_connection() -> Arc<Connection> {
        let (_client, server) = duplex(4096);
        let boxed: Box<dyn crate::connection::ByteStream> = Box::new(server);
        let (_r, w) = tokio::io::split(boxed);
        Connection::new(w, std::time::Duration::from_secs(1))
    }

    #[tokio::test]
    async fn register_creates_pool_and_reverse_entry() {
        let registry = LabelRegistry::new();
        let conn = test_connection().await;
        registry.register("room", conn.clone());

        let pool = registry.pool("room").unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(registry.label_count(), 1);
    }

    #[tokio::test]
    async fn dislabel_unlinks_empty_pool() {
        let registry = LabelRegistry::new();
        let conn = test_connection().await;
        registry.register("room", conn.clone());
        assert!(registry.dislabel("room", conn.id));

        assert!(registry.pool("room").is_none());
        assert_eq!(registry.label_count(), 0);
    }

    #[tokio::test]
    async fn dislabel_of_absent_label_reports_not_removed() {
        let registry = LabelRegistry::new();
        let conn = test_connection().await;

        assert!(!registry.dislabel("room", conn.id));

        registry.register("other", conn.clone());
        assert!(!registry.dislabel("room", conn.id));
    }

    #[tokio::test]
    async fn remove_unsubscribes_from_every_label() {
        let registry = LabelRegistry::new();
        let conn = test_connection().await;
        registry.register("a", conn.clone());
        registry.register("b", conn.clone());
        registry.remove(conn.id);

        assert!(registry.pool("a").is_none());
        assert!(registry.pool("b").is_none());
    }

    #[tokio::test]
    async fn multiple_connections_share_a_pool() {
        let registry = LabelRegistry::new();
        let c1 = test_connection().await;
        let c2 = test_connection().await;
        registry.register("room", c1.clone());
        registry.register("room", c2.clone());

        let pool = registry.pool("room").unwrap();
        assert_eq!(pool.len(), 2);

        assert!(registry.dislabel("room", c1.id));
        let pool = registry.pool("room").unwrap();
        assert_eq!(pool.len(), 1);
    }
}
