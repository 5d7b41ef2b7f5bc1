//! Pending-request correlation for HTTP forwarded over the tunnel.
//!
//! Each forwarded request gets a freshly minted UUID and a oneshot slot. The
//! slave's `response` frame (or an `error` frame, or the deadline, or a
//! disconnect drain) resolves the slot exactly once; anything arriving after
//! that is silently discarded. Request ids are never reused.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Duration;
use tracing::debug;

/// Outcome delivered to a waiting forwarder.
#[derive(Debug)]
pub enum Completion {
    /// The local service on the slave answered.
    Response {
        status: u16,
        headers: HashMap<String, String>,
        body: Option<String>,
    },
    /// The slave reported a failure, or the connection was drained.
    Error(String),
}

/// Why a wait ended without a completion.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline elapsed before any completion arrived.
    Timeout,
    /// The pending entry was dropped without being completed.
    ConnectionLost,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timeout"),
            Self::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

/// In-flight request map for one slave's control connection.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a request id and register a pending entry for it.
    pub async fn issue(&self) -> (String, oneshot::Receiver<Completion>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        (request_id, rx)
    }

    /// Resolve a pending request. Returns `false` when the id is unknown,
    /// which covers both late responses and duplicate completions.
    pub async fn complete(&self, request_id: &str, outcome: Completion) -> bool {
        let Some(tx) = self.pending.lock().await.remove(request_id) else {
            debug!(request_id, "Dropping completion for unknown request id");
            return false;
        };
        // The receiver may have given up (timeout path); that's fine.
        tx.send(outcome).is_ok()
    }

    /// Forget a pending entry without completing it (send-side failure).
    pub async fn forget(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    /// Await the completion for an issued request, bounded by `deadline`.
    /// On expiry the entry is removed so a late `response` frame is a no-op.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<Completion>,
        deadline: Duration,
    ) -> Result<Completion, WaitError> {
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(_)) => Err(WaitError::ConnectionLost),
            Err(_) => {
                self.forget(request_id).await;
                Err(WaitError::Timeout)
            }
        }
    }

    /// Fail every pending request with the given error. Used when the owning
    /// slave's control connection goes away.
    pub async fn drain(&self, error: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Completion::Error(error.to_string()));
        }
        count
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
