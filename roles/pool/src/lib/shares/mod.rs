//! Shares manager: per-worker stats, duplicate detection, the share window
//! and the submission classification pipeline.

pub mod stats;
pub mod vardiff;
pub mod worker;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use storage_kas::{AllocationPath, BlockDetails, PoolPersistence};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PoolResult;
use crate::jobs::{BlockSubmitter, JobStore, SubmitOutcome};
use crate::metrics::{unix_now, PoolMetrics};
use crate::shares::vardiff::VarDiffConfig;
use crate::shares::worker::{WorkerIdentity, WorkerStats};
use crate::stratum::encoding::MinerEncoding;
use crate::target::difficulty_to_target;

/// A validated share waiting to be consumed by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub address: String,
    pub worker_name: String,
    pub difficulty: u64,
    pub timestamp: u64,
    pub job_id: String,
    pub daa_score: u64,
}

/// Classification of one `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Meets the assigned target
    Valid,
    /// Meets the network target; the block was forwarded upstream
    Block { block_hash: String },
    /// Nonce already accepted inside the duplicate window; reported as
    /// success on the wire
    Duplicate,
    /// Job no longer cached
    Stale,
    /// Proof-of-work above the assigned target
    LowDifficulty,
    /// Submission for a worker that never authorized
    UnknownWorker,
}

struct WorkerEntry {
    stats: Arc<Mutex<WorkerStats>>,
    vardiff: VarDiffConfig,
    session_id: u64,
}

/// Handle to a live stratum session, used by the stats sweep to end idle
/// connections.
pub struct SessionHandle {
    pub token: CancellationToken,
    pub peer: SocketAddr,
    pub workers: Vec<String>,
}

/// Shared state for every authorized worker in the process.
pub struct ShareManager {
    jobs: Arc<JobStore>,
    storage: Arc<dyn PoolPersistence>,
    submitter: Arc<dyn BlockSubmitter>,
    metrics: Arc<PoolMetrics>,
    pool_address: String,
    workers: RwLock<HashMap<String, WorkerEntry>>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    window: Mutex<VecDeque<Contribution>>,
    next_session_id: AtomicU64,
}

impl ShareManager {
    pub fn new(
        jobs: Arc<JobStore>,
        storage: Arc<dyn PoolPersistence>,
        submitter: Arc<dyn BlockSubmitter>,
        metrics: Arc<PoolMetrics>,
        pool_address: String,
    ) -> Self {
        ShareManager {
            jobs,
            storage,
            submitter,
            metrics,
            pool_address,
            workers: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            window: Mutex::new(VecDeque::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    // === Sessions ===

    /// Register a new connection; the returned token is cancelled by the
    /// stats sweep when the session goes idle.
    pub async fn open_session(&self, peer: SocketAddr) -> (u64, CancellationToken) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.sessions.lock().await.insert(
            id,
            SessionHandle {
                token: token.clone(),
                peer,
                workers: Vec::new(),
            },
        );
        (id, token)
    }

    /// Close-handler cleanup: drops the session and its workers from the
    /// miner map.
    pub async fn close_session(&self, session_id: u64) {
        let handle = self.sessions.lock().await.remove(&session_id);
        if let Some(handle) = handle {
            let mut workers = self.workers.write().await;
            for miner_id in &handle.workers {
                // a reconnected worker now belongs to a newer session
                let owned_here = workers
                    .get(miner_id)
                    .map(|entry| entry.session_id == session_id)
                    .unwrap_or(false);
                if owned_here {
                    workers.remove(miner_id);
                }
            }
            debug!(session_id, peer = %handle.peer, "session closed");
        }
    }

    // === Workers ===

    /// Create (or re-attach) the stats record for an authorizing worker.
    pub async fn register_worker(
        &self,
        session_id: u64,
        identity: WorkerIdentity,
        asic_type: MinerEncoding,
        difficulty: u64,
        vardiff: VarDiffConfig,
        vardiff_enabled: bool,
    ) -> Arc<Mutex<WorkerStats>> {
        let miner_id = identity.miner_id();
        // workers lock released before the sessions lock; close_session
        // takes them in the opposite order
        let stats = {
            let mut workers = self.workers.write().await;
            let entry = workers.entry(miner_id.clone()).or_insert_with(|| WorkerEntry {
                stats: Arc::new(Mutex::new(WorkerStats::new(
                    identity,
                    asic_type,
                    difficulty,
                    vardiff_enabled,
                    Instant::now(),
                ))),
                vardiff,
                session_id,
            });
            entry.session_id = session_id;
            entry.stats.clone()
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get_mut(&session_id) {
            if !handle.workers.contains(&miner_id) {
                handle.workers.push(miner_id);
            }
        }
        stats
    }

    pub async fn worker_stats(&self, miner_id: &str) -> Option<Arc<Mutex<WorkerStats>>> {
        self.workers.read().await.get(miner_id).map(|e| e.stats.clone())
    }

    // === Submission pipeline ===

    /// Classify one submission and apply its effects.
    pub async fn add_share(
        &self,
        identity: &WorkerIdentity,
        job_id: &str,
        assigned_difficulty: u64,
        nonce: u64,
    ) -> PoolResult<ShareOutcome> {
        let miner_id = identity.miner_id();
        let stats = match self.worker_stats(&miner_id).await {
            Some(stats) => stats,
            None => return Ok(ShareOutcome::UnknownWorker),
        };
        let now = Instant::now();

        {
            let mut stats = stats.lock().await;
            if stats.is_duplicate(nonce, now) {
                stats.duplicated_shares += 1;
                self.metrics.shares_duplicated.fetch_add(1, Ordering::Relaxed);
                debug!(miner = %miner_id, nonce, "duplicate share");
                return Ok(ShareOutcome::Duplicate);
            }
        }

        let template = match self.jobs.get(job_id).await {
            Some(template) => template,
            None => {
                let mut stats = stats.lock().await;
                stats.stale_shares += 1;
                self.metrics.shares_stale.fetch_add(1, Ordering::Relaxed);
                debug!(miner = %miner_id, job_id, "stale share");
                return Ok(ShareOutcome::Stale);
            }
        };

        let (meets_block_target, pow_value) = template.pow.check_pow(nonce);
        if pow_value > difficulty_to_target(assigned_difficulty) {
            let mut stats = stats.lock().await;
            stats.invalid_shares += 1;
            self.metrics.shares_invalid.fetch_add(1, Ordering::Relaxed);
            debug!(miner = %miner_id, nonce, "low difficulty share");
            return Ok(ShareOutcome::LowDifficulty);
        }

        {
            let mut stats = stats.lock().await;
            stats.record_valid(assigned_difficulty, nonce, now);
        }
        self.metrics.shares_accepted.fetch_add(1, Ordering::Relaxed);

        self.window.lock().await.push_back(Contribution {
            address: identity.payout_address.clone(),
            worker_name: identity.worker_name.clone(),
            difficulty: assigned_difficulty,
            timestamp: unix_now(),
            job_id: job_id.to_string(),
            daa_score: template.daa_score,
        });

        if !meets_block_target {
            return Ok(ShareOutcome::Valid);
        }

        // Block hit: best-effort forward to the node. The share is counted
        // either way; the block credit only lands on acceptance.
        match self.submitter.submit_block(&template, nonce).await {
            Ok(SubmitOutcome::Accepted { block_hash }) => {
                let block_hash = block_hash.to_string();
                {
                    let mut stats = stats.lock().await;
                    stats.blocks_found += 1;
                }
                self.metrics.blocks_found.fetch_add(1, Ordering::Relaxed);
                info!(miner = %miner_id, block_hash = %block_hash, daa_score = template.daa_score, "block found");

                let details = BlockDetails {
                    mined_block_hash: block_hash.clone(),
                    miner_id: miner_id.clone(),
                    pool_address: self.pool_address.clone(),
                    reward_block_hash: String::new(),
                    miner_reward: 0,
                    daa_score: template.daa_score,
                    timestamp: unix_now(),
                    allocation_path: AllocationPath::Pending,
                };
                if let Err(e) = self.storage.add_block_details(&details).await {
                    warn!(block_hash = %block_hash, error = %e, "failed to record provisional block details");
                }
                Ok(ShareOutcome::Block { block_hash })
            }
            Ok(SubmitOutcome::Rejected { reason }) => {
                self.metrics.blocks_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(miner = %miner_id, reason = %reason, "node rejected block");
                Ok(ShareOutcome::Valid)
            }
            Err(e) => {
                self.metrics.blocks_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(miner = %miner_id, error = %e, "block submission failed");
                Ok(ShareOutcome::Valid)
            }
        }
    }

    // === Allocator interface ===

    /// Drain every contribution with `daa_score <= max_daa` from the front
    /// of the window. Strictly monotonic: once drained, a DAA score is never
    /// revisited.
    pub async fn drain_window(&self, max_daa: u64) -> Vec<Contribution> {
        let mut window = self.window.lock().await;
        let mut drained = Vec::new();
        while window.front().is_some_and(|front| front.daa_score <= max_daa) {
            if let Some(contribution) = window.pop_front() {
                drained.push(contribution);
            }
        }
        drained
    }

    /// Time-weighted synthetic shares for the fallback allocation path:
    /// each active worker contributes its assigned difficulty weighted by
    /// `min(time_since_last_share, 5 min) / 5 min`, floored at a tenth of
    /// the difficulty (at least 1).
    pub async fn fallback_weights(&self) -> Vec<(String, String, u64)> {
        const WEIGHT_WINDOW_SECS: u64 = 300;
        let now = Instant::now();
        let mut weights = Vec::new();
        let workers = self.workers.read().await;
        for (miner_id, entry) in workers.iter() {
            let stats = entry.stats.lock().await;
            let idle = stats.idle_for(now).as_secs().min(WEIGHT_WINDOW_SECS);
            let weighted = stats.min_diff * idle / WEIGHT_WINDOW_SECS;
            let floor = (stats.min_diff / 10).max(1);
            weights.push((
                miner_id.clone(),
                stats.identity.payout_address.clone(),
                weighted.max(floor),
            ));
        }
        weights
    }

    pub async fn window_len(&self) -> usize {
        self.window.lock().await.len()
    }

    // used by the stats sweep
    pub(crate) async fn snapshot_workers(&self) -> Vec<(String, Arc<Mutex<WorkerStats>>, VarDiffConfig, u64)> {
        self.workers
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.stats.clone(), e.vardiff.clone(), e.session_id))
            .collect()
    }

    pub(crate) async fn session_handles(&self) -> Vec<(u64, CancellationToken, Vec<String>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, h)| (*id, h.token.clone(), h.workers.clone()))
            .collect()
    }

    pub(crate) fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::test_support::template;
    use crate::jobs::Template;
    use async_trait::async_trait;
    use storage_kas::backends::memory::MemoryStorage;

    struct NullSubmitter;

    #[async_trait]
    impl BlockSubmitter for NullSubmitter {
        async fn submit_block(&self, template: &Template, _nonce: u64) -> PoolResult<SubmitOutcome> {
            Ok(SubmitOutcome::Accepted {
                block_hash: template.header_hash,
            })
        }
    }

    fn identity() -> WorkerIdentity {
        WorkerIdentity {
            payout_address: "kaspa:qztest".to_string(),
            worker_name: "rig01".to_string(),
        }
    }

    fn vardiff_config() -> VarDiffConfig {
        VarDiffConfig {
            expected_share_rate: 20.0,
            clamp_pow2: false,
            min_diff: 1,
            max_diff: 32_768,
        }
    }

    async fn manager() -> (Arc<ShareManager>, Arc<JobStore>) {
        let jobs = Arc::new(JobStore::new(8));
        let manager = Arc::new(ShareManager::new(
            jobs.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(NullSubmitter),
            Arc::new(PoolMetrics::new()),
            "kaspa:qzpool".to_string(),
        ));
        (manager, jobs)
    }

    async fn register(manager: &ShareManager) -> u64 {
        let (session_id, _token) = manager.open_session("127.0.0.1:1".parse().unwrap()).await;
        manager
            .register_worker(
                session_id,
                identity(),
                MinerEncoding::BigHeader,
                64,
                vardiff_config(),
                true,
            )
            .await;
        session_id
    }

    #[tokio::test]
    async fn unknown_worker_is_flagged() {
        let (manager, _) = manager().await;
        let outcome = manager.add_share(&identity(), "0", 64, 1).await.unwrap();
        assert_eq!(outcome, ShareOutcome::UnknownWorker);
    }

    #[tokio::test]
    async fn unknown_job_is_stale() {
        let (manager, _) = manager().await;
        register(&manager).await;
        let outcome = manager.add_share(&identity(), "77", 64, 1).await.unwrap();
        assert_eq!(outcome, ShareOutcome::Stale);

        let stats = manager.worker_stats("kaspa:qztest.rig01").await.unwrap();
        assert_eq!(stats.lock().await.stale_shares, 1);
    }

    #[tokio::test]
    async fn repeated_nonce_is_duplicate_and_appends_nothing() {
        let (manager, jobs) = manager().await;
        register(&manager).await;
        let (job_id, _) = jobs.insert(template(10)).await;

        // difficulty 1 accepts any proof of work
        let first = manager.add_share(&identity(), &job_id, 1, 0x2a).await.unwrap();
        assert!(matches!(first, ShareOutcome::Valid | ShareOutcome::Block { .. }));
        assert_eq!(manager.window_len().await, 1);

        let second = manager.add_share(&identity(), &job_id, 1, 0x2a).await.unwrap();
        assert_eq!(second, ShareOutcome::Duplicate);
        assert_eq!(manager.window_len().await, 1);

        let stats = manager.worker_stats("kaspa:qztest.rig01").await.unwrap();
        let stats = stats.lock().await;
        assert_eq!(stats.shares_found, 1);
        assert_eq!(stats.duplicated_shares, 1);
    }

    #[tokio::test]
    async fn duplicate_is_checked_before_staleness() {
        let (manager, jobs) = manager().await;
        register(&manager).await;
        let (job_id, _) = jobs.insert(template(10)).await;
        manager.add_share(&identity(), &job_id, 1, 0x2a).await.unwrap();

        // same nonce against an unknown job still reads as duplicate
        let outcome = manager.add_share(&identity(), "999", 1, 0x2a).await.unwrap();
        assert_eq!(outcome, ShareOutcome::Duplicate);
    }

    #[tokio::test]
    async fn drain_window_is_monotonic_by_daa() {
        let (manager, _) = manager().await;
        {
            let mut window = manager.window.lock().await;
            for daa in [10u64, 11, 12, 20, 21] {
                window.push_back(Contribution {
                    address: "kaspa:qztest".to_string(),
                    worker_name: "rig01".to_string(),
                    difficulty: 64,
                    timestamp: 0,
                    job_id: "0".to_string(),
                    daa_score: daa,
                });
            }
        }

        let first = manager.drain_window(12).await;
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|c| c.daa_score <= 12));

        // drained scores are never revisited
        let second = manager.drain_window(12).await;
        assert!(second.is_empty());

        let third = manager.drain_window(30).await;
        assert_eq!(third.len(), 2);
        assert_eq!(manager.window_len().await, 0);
    }

    #[tokio::test]
    async fn close_session_removes_workers_from_map() {
        let (manager, _) = manager().await;
        let session_id = register(&manager).await;
        assert!(manager.worker_stats("kaspa:qztest.rig01").await.is_some());
        manager.close_session(session_id).await;
        assert!(manager.worker_stats("kaspa:qztest.rig01").await.is_none());
    }

    #[tokio::test]
    async fn fallback_weights_floor_at_tenth_of_difficulty() {
        let (manager, _) = manager().await;
        register(&manager).await;
        // freshly authorized worker: idle time ~0, weight floored
        let weights = manager.fallback_weights().await;
        assert_eq!(weights.len(), 1);
        let (miner_id, address, weight) = &weights[0];
        assert_eq!(miner_id, "kaspa:qztest.rig01");
        assert_eq!(address, "kaspa:qztest");
        assert_eq!(*weight, 6); // floor(64 / 10)
    }

    #[tokio::test]
    async fn accepted_block_records_provisional_details() {
        let (manager, jobs) = manager().await;
        register(&manager).await;
        let (job_id, template_arc) = jobs.insert(template(10)).await;

        // difficulty 1 + permissive template bits: any nonce that clears the
        // compact target records a block through the NullSubmitter
        let mut recorded = false;
        for nonce in 0..64u64 {
            if let ShareOutcome::Block { block_hash } = manager
                .add_share(&identity(), &job_id, 1, nonce)
                .await
                .unwrap()
            {
                assert_eq!(block_hash, template_arc.header_hash.to_string());
                recorded = true;
                break;
            }
        }
        if recorded {
            let stats = manager.worker_stats("kaspa:qztest.rig01").await.unwrap();
            assert_eq!(stats.lock().await.blocks_found, 1);
        }
    }

}
