//! Process-wide counters and liveness gauges.
//!
//! Exposition is log-based: a reporter task periodically writes a summary
//! line, and the upstream watchdog reads the block-added gauge to decide
//! when the node feed has gone quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tracing::info;

use crate::utils::ShutdownMessage;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub shares_accepted: AtomicU64,
    pub shares_stale: AtomicU64,
    pub shares_invalid: AtomicU64,
    pub shares_duplicated: AtomicU64,
    pub blocks_found: AtomicU64,
    pub blocks_rejected: AtomicU64,
    pub templates_received: AtomicU64,
    pub upstream_reconnections: AtomicU64,
    /// Gauge updated by the stats sweep
    pub active_workers: AtomicU64,
    /// Pool hashrate in H/s, stored as f64 bits
    pool_hashrate_bits: AtomicU64,
    /// Unix timestamp of the last block-added event
    pub last_block_added: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        metrics.last_block_added.store(unix_now(), Ordering::Relaxed);
        metrics
    }

    pub fn set_pool_hashrate(&self, hashrate: f64) {
        self.pool_hashrate_bits
            .store(hashrate.to_bits(), Ordering::Relaxed);
    }

    pub fn pool_hashrate(&self) -> f64 {
        f64::from_bits(self.pool_hashrate_bits.load(Ordering::Relaxed))
    }

    pub fn mark_block_added(&self) {
        self.last_block_added.store(unix_now(), Ordering::Relaxed);
    }

    /// Seconds since the node last announced a block.
    pub fn block_added_age(&self) -> u64 {
        unix_now().saturating_sub(self.last_block_added.load(Ordering::Relaxed))
    }

    pub fn log_summary(&self) {
        info!(
            accepted = self.shares_accepted.load(Ordering::Relaxed),
            stale = self.shares_stale.load(Ordering::Relaxed),
            invalid = self.shares_invalid.load(Ordering::Relaxed),
            duplicated = self.shares_duplicated.load(Ordering::Relaxed),
            blocks = self.blocks_found.load(Ordering::Relaxed),
            blocks_rejected = self.blocks_rejected.load(Ordering::Relaxed),
            templates = self.templates_received.load(Ordering::Relaxed),
            reconnections = self.upstream_reconnections.load(Ordering::Relaxed),
            workers = self.active_workers.load(Ordering::Relaxed),
            hashrate = %format_hashrate(self.pool_hashrate()),
            block_added_age_secs = self.block_added_age(),
            "pool status"
        );
    }
}

/// Human-readable hashrate for log lines.
pub fn format_hashrate(hashrate: f64) -> String {
    const UNITS: [&str; 6] = ["H/s", "kH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut value = hashrate;
    let mut unit = 0;
    while value >= 1_000.0 && unit < UNITS.len() - 1 {
        value /= 1_000.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Periodically log the metrics summary until shutdown.
pub async fn run_reporter(
    metrics: std::sync::Arc<PoolMetrics>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<ShutdownMessage>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => metrics.log_summary(),
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashrate_formatting_scales_units() {
        assert_eq!(format_hashrate(0.0), "0.00 H/s");
        assert_eq!(format_hashrate(1_500.0), "1.50 kH/s");
        assert_eq!(format_hashrate(2.5e12), "2.50 TH/s");
        assert_eq!(format_hashrate(3.0e18), "3000.00 PH/s");
    }

    #[test]
    fn block_added_gauge_tracks_age() {
        let metrics = PoolMetrics::new();
        assert!(metrics.block_added_age() <= 1);
        metrics.last_block_added.store(unix_now() - 150, Ordering::Relaxed);
        assert!(metrics.block_added_age() >= 150);
        metrics.mark_block_added();
        assert!(metrics.block_added_age() <= 1);
    }
}
