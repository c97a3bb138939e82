//! Per-worker variable difficulty controller.
//!
//! A multi-window feedback loop: a freshly calibrating worker is judged over
//! a one-minute window, then over progressively longer windows as each one
//! clears within tolerance. The terminal window (0) is steady state, where
//! any drift beyond tolerance adjusts difficulty immediately. A high
//! rejection rate overrides the feedback loop entirely and re-seats the
//! worker from a coarse hashrate table.

use std::time::Instant;

use tracing::debug;

use crate::shares::worker::WorkerStats;
use crate::target::{clamp_difficulty, floor_pow2};

/// Calibration windows in minutes; 0 is steady state.
pub const WINDOWS_MIN: [u64; 7] = [1, 3, 10, 30, 60, 240, 0];

/// Share-rate tolerance for each window.
pub const TOLERANCES: [f64; 7] = [1.0, 0.5, 0.25, 0.15, 0.10, 0.10, 0.10];

/// Interval between controller ticks.
pub const TICK_SECS: u64 = 10;

/// A finite-window breach never scales difficulty below a tenth of its
/// current value.
const MIN_RATIO: f64 = 0.1;

/// Rejection-rate override threshold: invalid / found >= 20%.
const REJECTION_NUM: u64 = 1;
const REJECTION_DEN: u64 = 5;

/// Per-port controller parameters.
#[derive(Debug, Clone)]
pub struct VarDiffConfig {
    /// Target share rate, shares per minute.
    pub expected_share_rate: f64,
    /// Round adjusted difficulty down to a power of two.
    pub clamp_pow2: bool,
    pub min_diff: u64,
    pub max_diff: u64,
}

/// Evaluate one controller tick for a worker.
///
/// Returns the new difficulty when it changed; the caller announces it with
/// the next `mining.notify`.
pub fn evaluate(stats: &mut WorkerStats, config: &VarDiffConfig, now: Instant) -> Option<u64> {
    if !stats.var_diff_enabled {
        return None;
    }

    let start = match stats.var_diff_start {
        Some(start) => start,
        None => {
            // calibration restart
            stats.var_diff_start = Some(now);
            stats.var_diff_shares = 0;
            return None;
        }
    };

    let elapsed_min = now.duration_since(start).as_secs_f64() / 60.0;
    if elapsed_min <= 0.0 {
        return None;
    }

    if stats.shares_found > 0
        && stats.invalid_shares * REJECTION_DEN >= stats.shares_found * REJECTION_NUM
    {
        let new_diff = difficulty_for_hashrate(stats.hashrate);
        return apply(stats, config, new_diff, now);
    }

    let window_idx = stats.var_diff_window.min(WINDOWS_MIN.len() - 1);
    let window = WINDOWS_MIN[window_idx];
    let tolerance = TOLERANCES[window_idx];

    let rate = stats.var_diff_shares as f64 / elapsed_min;
    let ratio = rate / config.expected_share_rate;

    if window == 0 {
        // steady state: immediate adjustment on drift
        if (1.0 - ratio).abs() >= tolerance {
            let new_diff = scaled(stats.min_diff, ratio);
            return apply(stats, config, new_diff, now);
        }
        return None;
    }

    if elapsed_min < window as f64 {
        return None;
    }

    if (1.0 - ratio).abs() <= tolerance {
        // window cleared, judge over the next one
        stats.var_diff_window += 1;
        debug!(
            miner = %stats.identity.miner_id(),
            window = stats.var_diff_window,
            "vardiff window cleared"
        );
        return None;
    }

    let new_diff = scaled(stats.min_diff, ratio.max(MIN_RATIO));
    apply(stats, config, new_diff, now)
}

fn scaled(current: u64, ratio: f64) -> u64 {
    ((current as f64 * ratio) as u64).max(1)
}

fn apply(
    stats: &mut WorkerStats,
    config: &VarDiffConfig,
    proposed: u64,
    _now: Instant,
) -> Option<u64> {
    let mut new_diff = proposed;
    if config.clamp_pow2 {
        new_diff = floor_pow2(new_diff);
    }
    new_diff = clamp_difficulty(new_diff, config.min_diff, config.max_diff);

    if new_diff == stats.min_diff {
        return None;
    }

    debug!(
        miner = %stats.identity.miner_id(),
        old = stats.min_diff,
        new = new_diff,
        "vardiff adjustment"
    );
    stats.min_diff = new_diff;
    stats.var_diff_start = None;
    stats.var_diff_window = 0;
    stats.var_diff_shares = 0;
    Some(new_diff)
}

/// Coarse hashrate-to-difficulty table used by the rejection-rate override.
pub fn difficulty_for_hashrate(hashrate: f64) -> u64 {
    const BANDS: [(f64, u64); 6] = [
        (1e9, 64),
        (1e10, 256),
        (1e11, 1_024),
        (1e12, 4_096),
        (1e13, 8_192),
        (1e14, 16_384),
    ];
    for (limit, diff) in BANDS {
        if hashrate < limit {
            return diff;
        }
    }
    32_768
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::worker::WorkerIdentity;
    use crate::stratum::encoding::MinerEncoding;
    use std::time::Duration;

    fn config() -> VarDiffConfig {
        VarDiffConfig {
            expected_share_rate: 20.0,
            clamp_pow2: false,
            min_diff: 4,
            max_diff: 32_768,
        }
    }

    fn worker(difficulty: u64, now: Instant) -> WorkerStats {
        WorkerStats::new(
            WorkerIdentity {
                payout_address: "kaspa:qztest".to_string(),
                worker_name: "rig01".to_string(),
            },
            MinerEncoding::BigHeader,
            difficulty,
            true,
            now,
        )
    }

    /// Put a worker straight into the steady-state window with a given
    /// number of shares over `minutes`.
    fn steady_state(difficulty: u64, shares: u64, minutes: u64, start: Instant) -> WorkerStats {
        let mut stats = worker(difficulty, start);
        stats.var_diff_window = WINDOWS_MIN.len() - 1;
        stats.var_diff_start = Some(start);
        stats.var_diff_shares = shares;
        stats.shares_found = shares;
        stats
    }

    #[test]
    fn first_tick_arms_the_clock() {
        let start = Instant::now();
        let mut stats = worker(64, start);
        assert!(evaluate(&mut stats, &config(), start).is_none());
        assert!(stats.var_diff_start.is_some());
    }

    #[test]
    fn steady_state_doubles_on_double_rate() {
        // expected 20/min, observed 40/min over the terminal window
        let start = Instant::now();
        let mut stats = steady_state(1_024, 400, 10, start);
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(600));
        assert_eq!(new, Some(2_048));
        assert_eq!(stats.min_diff, 2_048);
        // state reset on change
        assert!(stats.var_diff_start.is_none());
        assert_eq!(stats.var_diff_window, 0);
        assert_eq!(stats.var_diff_shares, 0);
    }

    #[test]
    fn steady_state_within_tolerance_holds() {
        // 21/min vs 20/min expected is inside the 10% band
        let start = Instant::now();
        let mut stats = steady_state(1_024, 210, 10, start);
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(600));
        assert_eq!(new, None);
        assert_eq!(stats.min_diff, 1_024);
    }

    #[test]
    fn finite_window_promotes_when_in_tolerance() {
        let start = Instant::now();
        let mut stats = worker(64, start);
        stats.var_diff_start = Some(start);
        stats.var_diff_shares = 20; // 20/min over the 1-minute window
        stats.shares_found = 20;
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(60));
        assert_eq!(new, None);
        assert_eq!(stats.var_diff_window, 1);
    }

    #[test]
    fn first_window_tolerates_anything_up_to_double_rate() {
        // the 1-minute window has tolerance 1.0: even a silent worker
        // clears it and moves on to the next window
        let start = Instant::now();
        let mut stats = worker(1_000, start);
        stats.var_diff_start = Some(start);
        stats.var_diff_shares = 0;
        stats.shares_found = 1;
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(60));
        assert_eq!(new, None);
        assert_eq!(stats.var_diff_window, 1);
    }

    #[test]
    fn finite_window_breach_is_floored_at_tenth() {
        // zero shares over the 3-minute window (tolerance 0.5) would scale
        // by 0; the breach ratio is floored at 0.1
        let start = Instant::now();
        let mut stats = worker(1_000, start);
        stats.var_diff_window = 1;
        stats.var_diff_start = Some(start);
        stats.var_diff_shares = 0;
        stats.shares_found = 1;
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(180));
        assert_eq!(new, Some(100));
    }

    #[test]
    fn pow2_clamp_rounds_down() {
        let start = Instant::now();
        let mut stats = steady_state(1_024, 500, 10, start); // ratio 2.5
        let mut config = config();
        config.clamp_pow2 = true;
        let new = evaluate(&mut stats, &config, start + Duration::from_secs(600));
        // 1024 * 2.5 = 2560, floored to the nearest power of two
        assert_eq!(new, Some(2_048));
    }

    #[test]
    fn pow2_clamp_to_current_value_is_a_no_op() {
        let start = Instant::now();
        let mut stats = steady_state(1_024, 300, 10, start); // ratio 1.5
        let mut config = config();
        config.clamp_pow2 = true;
        // 1536 floors back to 1024: no change, no reset
        let new = evaluate(&mut stats, &config, start + Duration::from_secs(600));
        assert_eq!(new, None);
        assert_eq!(stats.min_diff, 1_024);
        assert!(stats.var_diff_start.is_some());
    }

    #[test]
    fn adjustment_respects_port_bounds() {
        let start = Instant::now();
        // ratio 10x at diff 8192 would be 81920, beyond max_diff
        let mut stats = steady_state(8_192, 2_000, 10, start);
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(600));
        assert_eq!(new, Some(32_768));
    }

    #[test]
    fn rejection_rate_override_uses_hashrate_table() {
        let start = Instant::now();
        let mut stats = steady_state(4, 100, 10, start);
        stats.invalid_shares = 25; // 25% of 100 found
        stats.hashrate = 5e11; // lands in the < 1e12 band -> 4096
        let new = evaluate(&mut stats, &config(), start + Duration::from_secs(600));
        assert_eq!(new, Some(4_096));
    }

    #[test]
    fn hashrate_table_bands() {
        assert_eq!(difficulty_for_hashrate(0.0), 64);
        assert_eq!(difficulty_for_hashrate(5e9), 256);
        assert_eq!(difficulty_for_hashrate(5e10), 1_024);
        assert_eq!(difficulty_for_hashrate(5e11), 4_096);
        assert_eq!(difficulty_for_hashrate(5e12), 8_192);
        assert_eq!(difficulty_for_hashrate(5e13), 16_384);
        assert_eq!(difficulty_for_hashrate(1e15), 32_768);
    }

    #[test]
    fn disabled_worker_is_untouched() {
        let start = Instant::now();
        let mut stats = steady_state(64, 1_000, 10, start);
        stats.var_diff_enabled = false;
        assert!(evaluate(&mut stats, &config(), start + Duration::from_secs(600)).is_none());
    }
}
