//! Per-worker statistics and the recent-share window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::stratum::encoding::MinerEncoding;

/// Shares older than this are dropped from the recent deque; it is also the
/// duplicate-detection horizon.
pub const RECENT_SHARE_WINDOW: Duration = Duration::from_secs(600);

/// Identity a worker authorized with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    /// Validated payout address or custodian identifier
    pub payout_address: String,
    /// Worker name, unique per connection
    pub worker_name: String,
}

impl WorkerIdentity {
    /// Canonical `address.worker` form used as the miner id.
    pub fn miner_id(&self) -> String {
        format!("{}.{}", self.payout_address, self.worker_name)
    }
}

/// One accepted share in the recent window.
#[derive(Debug, Clone, Copy)]
pub struct RecentShare {
    pub at: Instant,
    pub difficulty: u64,
    pub nonce: u64,
}

/// Mutable state tracked for every authorized worker.
#[derive(Debug)]
pub struct WorkerStats {
    pub identity: WorkerIdentity,
    pub asic_type: MinerEncoding,
    pub start_time: Instant,
    pub last_share: Option<Instant>,
    pub shares_found: u64,
    pub stale_shares: u64,
    pub invalid_shares: u64,
    pub duplicated_shares: u64,
    pub blocks_found: u64,
    /// Currently assigned difficulty
    pub min_diff: u64,
    pub var_diff_enabled: bool,
    /// `None` means the calibration clock is reset and restarts on the next
    /// controller tick
    pub var_diff_start: Option<Instant>,
    pub var_diff_shares: u64,
    /// Index into the VarDiff window table
    pub var_diff_window: usize,
    pub recent_shares: VecDeque<RecentShare>,
    /// Estimated hashes per second over the recent window
    pub hashrate: f64,
}

impl WorkerStats {
    pub fn new(
        identity: WorkerIdentity,
        asic_type: MinerEncoding,
        difficulty: u64,
        var_diff_enabled: bool,
        now: Instant,
    ) -> Self {
        WorkerStats {
            identity,
            asic_type,
            start_time: now,
            last_share: None,
            shares_found: 0,
            stale_shares: 0,
            invalid_shares: 0,
            duplicated_shares: 0,
            blocks_found: 0,
            min_diff: difficulty,
            var_diff_enabled,
            var_diff_start: None,
            var_diff_shares: 0,
            var_diff_window: 0,
            recent_shares: VecDeque::new(),
            hashrate: 0.0,
        }
    }

    /// Whether this nonce was already accepted inside the duplicate window.
    pub fn is_duplicate(&mut self, nonce: u64, now: Instant) -> bool {
        self.prune_recent(now);
        self.recent_shares.iter().any(|share| share.nonce == nonce)
    }

    /// Record an accepted share.
    pub fn record_valid(&mut self, difficulty: u64, nonce: u64, now: Instant) {
        self.shares_found += 1;
        self.var_diff_shares += 1;
        self.last_share = Some(now);
        self.recent_shares.push_back(RecentShare {
            at: now,
            difficulty,
            nonce,
        });
        self.prune_recent(now);
    }

    /// Drop recent shares that fell out of the window.
    pub fn prune_recent(&mut self, now: Instant) {
        while let Some(front) = self.recent_shares.front() {
            if now.duration_since(front.at) > RECENT_SHARE_WINDOW {
                self.recent_shares.pop_front();
            } else {
                break;
            }
        }
    }

    /// Re-estimate the hashrate from the recent window. With the pool's
    /// target convention a difficulty-`d` share represents `d` expected
    /// hashes.
    pub fn update_hashrate(&mut self, now: Instant) {
        self.prune_recent(now);
        let work: u64 = self.recent_shares.iter().map(|s| s.difficulty).sum();
        let span = match self.recent_shares.front() {
            Some(front) => now.duration_since(front.at).as_secs_f64(),
            None => 0.0,
        };
        self.hashrate = if span > 0.0 {
            work as f64 / span
        } else {
            0.0
        };
    }

    /// Seconds since the last accepted share, or since authorize when no
    /// share has arrived yet.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_share.unwrap_or(self.start_time))
    }
}
