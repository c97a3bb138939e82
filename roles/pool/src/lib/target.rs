//! Difficulty and target arithmetic.
//!
//! The pool-side convention is `share_target(d) = Uint256::MAX / d`, so a
//! share at difficulty `d` costs `d` expected hashes and per-worker hashrate
//! reduces to the sum of accepted difficulties over the window.

use kaspa_math::Uint256;

/// Target a share must meet for an assigned difficulty.
pub fn difficulty_to_target(difficulty: u64) -> Uint256 {
    Uint256::MAX / Uint256::from_u64(difficulty.max(1))
}

/// Largest power of two less than or equal to `value`.
pub fn floor_pow2(value: u64) -> u64 {
    if value <= 1 {
        1
    } else {
        1u64 << (63 - value.leading_zeros())
    }
}

/// Clamp a difficulty into a port's configured bounds.
pub fn clamp_difficulty(value: u64, min_diff: u64, max_diff: u64) -> u64 {
    value.max(min_diff).min(max_diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_difficulty_means_smaller_target() {
        let easy = difficulty_to_target(16);
        let hard = difficulty_to_target(4_096);
        assert!(hard < easy);
    }

    #[test]
    fn difficulty_one_is_max_target() {
        assert_eq!(difficulty_to_target(1), Uint256::MAX);
        // zero is treated as one rather than dividing by zero
        assert_eq!(difficulty_to_target(0), Uint256::MAX);
    }

    #[test]
    fn floor_pow2_rounds_down() {
        assert_eq!(floor_pow2(0), 1);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(2), 2);
        assert_eq!(floor_pow2(3), 2);
        assert_eq!(floor_pow2(1023), 512);
        assert_eq!(floor_pow2(1024), 1024);
        assert_eq!(floor_pow2(u64::MAX), 1u64 << 63);
    }

    #[test]
    fn clamp_respects_bounds() {
        assert_eq!(clamp_difficulty(2, 4, 32_768), 4);
        assert_eq!(clamp_difficulty(100_000, 4, 32_768), 32_768);
        assert_eq!(clamp_difficulty(512, 4, 32_768), 512);
    }
}
