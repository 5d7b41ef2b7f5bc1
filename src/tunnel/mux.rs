//! WebSocket tunnel multiplexer: tunnel-id -> user-side WebSocket.
//!
//! Each tunnel couples a user-facing WebSocket on the master with a local
//! WebSocket on the owning slave. Frames from the slave arrive tagged with a
//! tunnel id and are pushed to the user side through a bounded channel; a
//! full channel means the user socket cannot keep up, and the tunnel is torn
//! down rather than queued without bound.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::protocol::Channel;

/// Frame for a user-side WebSocket writer task.
#[derive(Debug)]
pub enum UserFrame {
    Text(String),
    /// Ask the writer to close the socket and stop.
    Close,
}

/// One open tunnel. The user socket itself is owned by its handler task;
/// the record holds only the bounded sender feeding that task.
pub struct TunnelRecord {
    pub slave_id: String,
    pub channel: Channel,
    user_tx: mpsc::Sender<UserFrame>,
}

/// What happened to a slave-originated frame.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    Delivered,
    /// The user socket's buffer was full; the frame was dropped and the
    /// tunnel removed. The caller should tell the slave to close its side.
    Backpressure,
    /// No such tunnel (already closed); the frame was dropped.
    Gone,
}

#[derive(Default)]
pub struct TunnelMux {
    tunnels: RwLock<HashMap<String, TunnelRecord>>,
}

impl TunnelMux {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel under a freshly minted id.
    pub async fn insert(
        &self,
        tunnel_id: &str,
        slave_id: &str,
        channel: Channel,
        user_tx: mpsc::Sender<UserFrame>,
    ) {
        self.tunnels.write().await.insert(
            tunnel_id.to_string(),
            TunnelRecord {
                slave_id: slave_id.to_string(),
                channel,
                user_tx,
            },
        );
    }

    /// Forward a slave-originated frame to the user WebSocket.
    pub async fn deliver(&self, tunnel_id: &str, data: String) -> DeliverOutcome {
        let sendable = {
            let tunnels = self.tunnels.read().await;
            let Some(record) = tunnels.get(tunnel_id) else {
                return DeliverOutcome::Gone;
            };
            record.user_tx.try_send(UserFrame::Text(data))
        };
        match sendable {
            Ok(()) => DeliverOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(tunnel_id, "User WebSocket too slow, closing tunnel");
                if let Some(record) = self.tunnels.write().await.remove(tunnel_id) {
                    let _ = record.user_tx.try_send(UserFrame::Close);
                }
                DeliverOutcome::Backpressure
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(tunnel_id, "User WebSocket already gone, removing tunnel");
                self.tunnels.write().await.remove(tunnel_id);
                DeliverOutcome::Gone
            }
        }
    }

    /// Close the user side of a tunnel and drop the record. Used when the
    /// slave reports its local side closed.
    pub async fn close_local(&self, tunnel_id: &str) -> bool {
        match self.tunnels.write().await.remove(tunnel_id) {
            Some(record) => {
                let _ = record.user_tx.try_send(UserFrame::Close);
                true
            }
            None => false,
        }
    }

    /// Forget a tunnel without touching the user socket (the user-side pump
    /// calls this when the socket has already closed on its own).
    pub async fn remove(&self, tunnel_id: &str) -> Option<TunnelRecord> {
        self.tunnels.write().await.remove(tunnel_id)
    }

    /// Close and remove every tunnel owned by a slave, in one step.
    /// Returns the removed tunnel ids.
    pub async fn remove_for_slave(&self, slave_id: &str) -> Vec<String> {
        let mut tunnels = self.tunnels.write().await;
        let ids: Vec<String> = tunnels
            .iter()
            .filter(|(_, r)| r.slave_id == slave_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(record) = tunnels.remove(id) {
                let _ = record.user_tx.try_send(UserFrame::Close);
            }
        }
        ids
    }

    pub async fn contains(&self, tunnel_id: &str) -> bool {
        self.tunnels.read().await.contains_key(tunnel_id)
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_reaches_the_user_channel() {
        let mux = TunnelMux::new();
        let (tx, mut rx) = mpsc::channel(4);
        mux.insert("t1", "s1", Channel::Ws, tx).await;
        assert_eq!(mux.deliver("t1", "hello".into()).await, DeliverOutcome::Delivered);
        match rx.recv().await.unwrap() {
            UserFrame::Text(data) => assert_eq!(data, "hello"),
            UserFrame::Close => panic!("expected text"),
        }
    }

    #[tokio::test]
    async fn unknown_tunnel_is_gone() {
        let mux = TunnelMux::new();
        assert_eq!(mux.deliver("t1", "x".into()).await, DeliverOutcome::Gone);
    }

    #[tokio::test]
    async fn full_buffer_tears_the_tunnel_down() {
        let mux = TunnelMux::new();
        let (tx, mut rx) = mpsc::channel(1);
        mux.insert("t1", "s1", Channel::Shell, tx).await;
        assert_eq!(mux.deliver("t1", "1".into()).await, DeliverOutcome::Delivered);
        // Buffer of one is now full; the next frame drops and closes.
        assert_eq!(mux.deliver("t1", "2".into()).await, DeliverOutcome::Backpressure);
        assert!(!mux.contains("t1").await);
        match rx.recv().await.unwrap() {
            UserFrame::Text(data) => assert_eq!(data, "1"),
            UserFrame::Close => panic!("expected the buffered frame first"),
        }
    }

    #[tokio::test]
    async fn remove_for_slave_closes_only_that_slaves_tunnels() {
        let mux = TunnelMux::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let (tx3, _rx3) = mpsc::channel(4);
        mux.insert("t1", "s1", Channel::Ws, tx1).await;
        mux.insert("t2", "s1", Channel::Shell, tx2).await;
        mux.insert("t3", "s2", Channel::Ws, tx3).await;

        let mut removed = mux.remove_for_slave("s1").await;
        removed.sort();
        assert_eq!(removed, vec!["t1".to_string(), "t2".to_string()]);
        assert!(mux.contains("t3").await);
        assert_eq!(mux.count().await, 1);
        assert!(matches!(rx1.recv().await, Some(UserFrame::Close)));
    }
}
