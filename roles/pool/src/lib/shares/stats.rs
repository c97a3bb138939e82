//! Periodic worker maintenance: the VarDiff ticker and the activity sweep.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metrics::format_hashrate;
use crate::shares::{vardiff, ShareManager};
use crate::utils::ShutdownMessage;

/// Interval of the consolidated stats sweep.
pub const STATS_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// A session whose workers were all silent this long is disconnected.
pub const IDLE_DISCONNECT: Duration = Duration::from_secs(600);

/// Run the VarDiff controller over every worker on a fixed tick.
pub async fn run_vardiff_loop(
    manager: Arc<ShareManager>,
    mut shutdown: broadcast::Receiver<ShutdownMessage>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(vardiff::TICK_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                for (miner_id, stats, config, _) in manager.snapshot_workers().await {
                    let mut stats = stats.lock().await;
                    stats.update_hashrate(now);
                    if let Some(new_diff) = vardiff::evaluate(&mut stats, &config, now) {
                        info!(
                            miner = %miner_id,
                            difficulty = new_diff,
                            "vardiff retarget; renegotiating on next notify"
                        );
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Run the activity sweep until shutdown.
pub async fn run_stats_loop(
    manager: Arc<ShareManager>,
    mut shutdown: broadcast::Receiver<ShutdownMessage>,
) {
    let mut ticker = tokio::time::interval(STATS_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately; skip it so a fresh pool does not log
    // an empty table
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&manager).await,
            _ = shutdown.recv() => break,
        }
    }
}

/// One sweep pass: refresh hashrates, log the worker table, end idle
/// sessions. Map cleanup happens in each session's close handler.
pub(crate) async fn sweep(manager: &ShareManager) {
    let now = Instant::now();
    let workers = manager.snapshot_workers().await;

    let mut pool_hashrate = 0.0;
    let mut idle = HashSet::new();
    let mut table = String::new();

    for (miner_id, stats, _, _) in &workers {
        let mut stats = stats.lock().await;
        stats.update_hashrate(now);
        pool_hashrate += stats.hashrate;
        if stats.idle_for(now) > IDLE_DISCONNECT {
            idle.insert(miner_id.clone());
        }
        table.push_str(&format!(
            "\n  {:<60} diff={:<8} shares={:<8} stale={:<6} invalid={:<6} dup={:<6} blocks={:<4} {}",
            miner_id,
            stats.min_diff,
            stats.shares_found,
            stats.stale_shares,
            stats.invalid_shares,
            stats.duplicated_shares,
            stats.blocks_found,
            format_hashrate(stats.hashrate),
        ));
    }

    let metrics = manager.metrics();
    metrics.set_pool_hashrate(pool_hashrate);
    metrics
        .active_workers
        .store(workers.len() as u64, Ordering::Relaxed);

    for (session_id, token, session_workers) in manager.session_handles().await {
        if !session_workers.is_empty() && session_workers.iter().all(|w| idle.contains(w)) {
            warn!(session_id, "ending idle session: no share in over 10 minutes");
            token.cancel();
        }
    }

    info!(
        workers = workers.len(),
        hashrate = %format_hashrate(pool_hashrate),
        "worker stats{}",
        table
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStore;
    use crate::jobs::{BlockSubmitter, SubmitOutcome, Template};
    use crate::metrics::PoolMetrics;
    use crate::shares::vardiff::VarDiffConfig;
    use crate::shares::worker::WorkerIdentity;
    use crate::stratum::encoding::MinerEncoding;
    use async_trait::async_trait;
    use storage_kas::backends::memory::MemoryStorage;

    struct NullSubmitter;

    #[async_trait]
    impl BlockSubmitter for NullSubmitter {
        async fn submit_block(
            &self,
            template: &Template,
            _nonce: u64,
        ) -> crate::error::PoolResult<SubmitOutcome> {
            Ok(SubmitOutcome::Accepted {
                block_hash: template.header_hash,
            })
        }
    }

    #[tokio::test]
    async fn sweep_updates_gauges() {
        let metrics = Arc::new(PoolMetrics::new());
        let manager = Arc::new(ShareManager::new(
            Arc::new(JobStore::new(4)),
            Arc::new(MemoryStorage::new()),
            Arc::new(NullSubmitter),
            metrics.clone(),
            "kaspa:qzpool".to_string(),
        ));
        let (session_id, _token) = manager.open_session("127.0.0.1:1".parse().unwrap()).await;
        manager
            .register_worker(
                session_id,
                WorkerIdentity {
                    payout_address: "kaspa:qztest".to_string(),
                    worker_name: "rig01".to_string(),
                },
                MinerEncoding::BigHeader,
                64,
                VarDiffConfig {
                    expected_share_rate: 20.0,
                    clamp_pow2: false,
                    min_diff: 1,
                    max_diff: 32_768,
                },
                true,
            )
            .await;

        sweep(&manager).await;
        assert_eq!(metrics.active_workers.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn sweep_cancels_idle_sessions() {
        let manager = Arc::new(ShareManager::new(
            Arc::new(JobStore::new(4)),
            Arc::new(MemoryStorage::new()),
            Arc::new(NullSubmitter),
            Arc::new(PoolMetrics::new()),
            "kaspa:qzpool".to_string(),
        ));
        let (session_id, token) = manager.open_session("127.0.0.1:1".parse().unwrap()).await;
        let stats = manager
            .register_worker(
                session_id,
                WorkerIdentity {
                    payout_address: "kaspa:qztest".to_string(),
                    worker_name: "rig01".to_string(),
                },
                MinerEncoding::BigHeader,
                64,
                VarDiffConfig {
                    expected_share_rate: 20.0,
                    clamp_pow2: false,
                    min_diff: 1,
                    max_diff: 32_768,
                },
                true,
            )
            .await;

        // backdate the worker past the idle threshold
        {
            let mut stats = stats.lock().await;
            stats.start_time = Instant::now() - (IDLE_DISCONNECT + Duration::from_secs(30));
            stats.last_share = None;
        }

        sweep(&manager).await;
        assert!(token.is_cancelled());
    }
}
