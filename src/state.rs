//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::Config;
use crate::tunnel::manager::TunnelManager;

/// Shared state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Master-side tunnel state. `None` in slave and standalone modes.
    pub tunnel: Option<Arc<TunnelManager>>,
    /// Shared HTTP client for calls against the local service.
    pub local_http: reqwest::Client,
    /// Slave-side tunnel connection statistics.
    pub tunnel_stats: Arc<TunnelStats>,
}

impl AppState {
    /// Build the state for a resolved configuration. The tunnel manager is
    /// attached later by the entry point when the node runs as master.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let local_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            tunnel: None,
            local_http,
            tunnel_stats: Arc::new(TunnelStats::new()),
        }
    }
}

/// Maximum number of pong RTT samples kept for quality tracking.
const MAX_RTT_SAMPLES: usize = 20;

/// Tunnel connection statistics for a slave node. Atomics for the hot path,
/// a mutex only for the RTT sample window.
pub struct TunnelStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub last_pong_ms: AtomicU64,
    rtt_samples: Mutex<VecDeque<u64>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_pong_ms: AtomicU64::new(0),
            rtt_samples: Mutex::new(VecDeque::with_capacity(MAX_RTT_SAMPLES)),
        }
    }

    /// Record a pong receipt with its measured round-trip time.
    pub async fn record_pong(&self, rtt_ms: u64) {
        self.last_pong_ms
            .store(crate::util::epoch_ms(), std::sync::atomic::Ordering::Relaxed);
        let mut samples = self.rtt_samples.lock().await;
        if samples.len() >= MAX_RTT_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(rtt_ms);
    }

    /// Median and p95 RTT from the sample window, or `None` if empty.
    pub async fn rtt_stats(&self) -> Option<(u64, u64)> {
        let samples = self.rtt_samples.lock().await;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        let p95_idx = (sorted.len() * 95).div_ceil(100);
        let p95 = sorted[p95_idx.saturating_sub(1).min(sorted.len() - 1)];
        Some((median, p95))
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rtt_window_is_bounded() {
        let stats = TunnelStats::new();
        assert!(stats.rtt_stats().await.is_none());
        for i in 0..50 {
            stats.record_pong(i).await;
        }
        let (median, p95) = stats.rtt_stats().await.unwrap();
        // Only the most recent MAX_RTT_SAMPLES are retained (30..=49).
        assert!(median >= 30);
        assert!(p95 <= 49);
        assert!(median <= p95);
    }
}
