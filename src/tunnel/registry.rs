//! Registry of connected slaves, keyed by slave id.
//!
//! One record per slave id, created on successful handshake and removed on
//! disconnect. A second handshake for an id already present evicts the prior
//! control connection with close code 4004 before the new record is
//! installed. Removal is keyed by `(slave_id, conn_id)` so an evicted
//! connection's cleanup cannot take down its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::correlator::Correlator;
use super::{Outbound, CLOSE_REPLACED};
use crate::util::epoch_ms;

/// A connected slave's control-connection state.
#[derive(Clone)]
pub struct SlaveRecord {
    pub name: String,
    /// Identity of the control connection currently backing this record.
    pub conn_id: Uuid,
    pub connected_at_ms: u64,
    pub last_ping_ms: Arc<AtomicU64>,
    /// Handle to the connection's writer task.
    pub tx: mpsc::Sender<Outbound>,
    /// In-flight HTTP requests addressed to this slave.
    pub pending: Arc<Correlator>,
}

/// Read-only snapshot of a slave record, safe to hand to the API layer.
#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub id: String,
    pub name: String,
    pub connected_at_ms: u64,
    pub last_ping_ms: u64,
}

#[derive(Default)]
pub struct SlaveRegistry {
    slaves: RwLock<HashMap<String, SlaveRecord>>,
}

impl SlaveRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a record for `slave_id`, evicting any existing holder. The
    /// evicted connection is asked to close with code 4004 and its record is
    /// returned so the caller can drain its tunnels and pending requests.
    pub async fn register(
        &self,
        slave_id: &str,
        name: &str,
        conn_id: Uuid,
        tx: mpsc::Sender<Outbound>,
    ) -> Option<SlaveRecord> {
        let now = epoch_ms();
        let record = SlaveRecord {
            name: name.to_string(),
            conn_id,
            connected_at_ms: now,
            last_ping_ms: Arc::new(AtomicU64::new(now)),
            tx,
            pending: Arc::new(Correlator::new()),
        };
        let evicted = self
            .slaves
            .write()
            .await
            .insert(slave_id.to_string(), record);
        if let Some(ref old) = evicted {
            warn!(slave_id, "Slave re-registered, evicting previous connection");
            let _ = old.tx.try_send(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: "replaced by new connection",
            });
        } else {
            info!(slave_id, name, "Slave registered");
        }
        evicted
    }

    /// Remove the record for `slave_id`, but only if it still belongs to
    /// `conn_id`. Returns the removed record.
    pub async fn unregister(&self, slave_id: &str, conn_id: Uuid) -> Option<SlaveRecord> {
        let mut slaves = self.slaves.write().await;
        match slaves.get(slave_id) {
            Some(record) if record.conn_id == conn_id => {
                info!(slave_id, "Slave unregistered");
                slaves.remove(slave_id)
            }
            _ => None,
        }
    }

    /// Full record for a slave (cloned handles, cheap).
    pub async fn get(&self, slave_id: &str) -> Option<SlaveRecord> {
        self.slaves.read().await.get(slave_id).cloned()
    }

    /// Snapshot view of a slave for the API layer.
    pub async fn info(&self, slave_id: &str) -> Option<SlaveInfo> {
        self.slaves
            .read()
            .await
            .get(slave_id)
            .map(|r| snapshot(slave_id, r))
    }

    /// Immutable snapshot of all connected slaves.
    pub async fn list(&self) -> Vec<SlaveInfo> {
        let slaves = self.slaves.read().await;
        let mut out: Vec<SlaveInfo> = slaves.iter().map(|(id, r)| snapshot(id, r)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn is_connected(&self, slave_id: &str) -> bool {
        self.slaves.read().await.contains_key(slave_id)
    }

    /// Record a ping receipt for a slave.
    pub async fn touch(&self, slave_id: &str) {
        if let Some(record) = self.slaves.read().await.get(slave_id) {
            record.last_ping_ms.store(epoch_ms(), Ordering::Relaxed);
        }
    }

    pub async fn count(&self) -> usize {
        self.slaves.read().await.len()
    }
}

fn snapshot(id: &str, record: &SlaveRecord) -> SlaveInfo {
    SlaveInfo {
        id: id.to_string(),
        name: record.name.clone(),
        connected_at_ms: record.connected_at_ms,
        last_ping_ms: record.last_ping_ms.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = SlaveRegistry::new();
        let (tx, _rx) = channel();
        assert!(registry
            .register("s1", "Rack 1", Uuid::new_v4(), tx)
            .await
            .is_none());
        assert!(registry.is_connected("s1").await);
        assert_eq!(registry.count().await, 1);
        let info = registry.info("s1").await.unwrap();
        assert_eq!(info.name, "Rack 1");
        assert!(registry.list().await.iter().any(|s| s.id == "s1"));
    }

    #[tokio::test]
    async fn reregistration_evicts_with_close_4004() {
        let registry = SlaveRegistry::new();
        let (tx1, mut rx1) = channel();
        let conn1 = Uuid::new_v4();
        registry.register("s1", "first", conn1, tx1).await;

        let (tx2, _rx2) = channel();
        let conn2 = Uuid::new_v4();
        let evicted = registry.register("s1", "second", conn2, tx2).await.unwrap();
        assert_eq!(evicted.conn_id, conn1);

        match rx1.recv().await.unwrap() {
            Outbound::Close { code, .. } => assert_eq!(code, CLOSE_REPLACED),
            Outbound::Frame(f) => panic!("expected close, got {f:?}"),
        }
        assert_eq!(registry.get("s1").await.unwrap().conn_id, conn2);
    }

    #[tokio::test]
    async fn stale_unregister_does_not_remove_replacement() {
        let registry = SlaveRegistry::new();
        let (tx1, _rx1) = channel();
        let conn1 = Uuid::new_v4();
        registry.register("s1", "first", conn1, tx1).await;

        let (tx2, _rx2) = channel();
        let conn2 = Uuid::new_v4();
        registry.register("s1", "second", conn2, tx2).await;

        // The evicted connection's teardown runs after replacement.
        assert!(registry.unregister("s1", conn1).await.is_none());
        assert!(registry.is_connected("s1").await);

        assert!(registry.unregister("s1", conn2).await.is_some());
        assert!(!registry.is_connected("s1").await);
    }

    #[tokio::test]
    async fn touch_updates_last_ping() {
        let registry = SlaveRegistry::new();
        let (tx, _rx) = channel();
        registry.register("s1", "s1", Uuid::new_v4(), tx).await;
        let before = registry.info("s1").await.unwrap().last_ping_ms;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.touch("s1").await;
        let after = registry.info("s1").await.unwrap().last_ping_ms;
        assert!(after >= before);
    }
}
