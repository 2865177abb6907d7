//! Proof-of-work targets and chain work.
//!
//! # Difficulty target semantics
//!
//! The `difficulty_target` field in [`BlockHeader`](crate::types::BlockHeader)
//! is a u64 where **higher = easier**. The PoW check interprets the first 8
//! bytes of the header hash as a little-endian u64 and requires it to be
//! ≤ `difficulty_target`.
//!
//! # Chain work
//!
//! The expected number of hashes needed to meet a target `t` is
//! `2^64 / (t + 1)`; [`block_work`] returns it as a u128 so cumulative chain
//! work never overflows.
//!
//! # Retargeting
//!
//! Every block retargets against a rolling window of the most recent
//! [`DIFFICULTY_WINDOW`](crate::constants::DIFFICULTY_WINDOW) intervals,
//! clamped to a [`MAX_ADJUSTMENT_FACTOR`] change per step.

use crate::constants::{BLOCK_TIME_SECS, DIFFICULTY_WINDOW};
use crate::types::Hash256;

/// Maximum difficulty adjustment factor per window.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

/// Hardest possible target.
pub const MIN_TARGET: u64 = 1;

/// Work represented by a single block at `target`.
pub fn block_work(target: u64) -> u128 {
    (1u128 << 64) / (target as u128 + 1)
}

/// Whether `hash` meets `target`.
pub fn hash_meets_target(hash: &Hash256, target: u64) -> bool {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.0[..8]);
    u64::from_le_bytes(prefix) <= target
}

/// Compute the next difficulty target from a window of recent timestamps.
///
/// `timestamps` must be ordered oldest to newest. Returns `current_target`
/// unchanged with fewer than 2 timestamps; otherwise scales it by
/// actual/expected elapsed time clamped to `[expected / 4, expected * 4]`,
/// then clamps to `[MIN_TARGET, pow_limit]`.
pub fn next_target(timestamps: &[u64], current_target: u64, pow_limit: u64) -> u64 {
    if timestamps.len() < 2 {
        return current_target;
    }

    let actual_time = timestamps[timestamps.len() - 1].saturating_sub(timestamps[0]);
    let intervals = (timestamps.len() - 1) as u64;
    let expected_time = intervals * BLOCK_TIME_SECS;

    let min_time = expected_time / MAX_ADJUSTMENT_FACTOR;
    let max_time = expected_time.saturating_mul(MAX_ADJUSTMENT_FACTOR);
    let clamped = actual_time.clamp(min_time, max_time);

    let result =
        (current_target as u128).saturating_mul(clamped as u128) / (expected_time as u128);

    (result.min(pow_limit as u128) as u64).max(MIN_TARGET)
}

/// Expected target for the block at `height`.
///
/// `get_timestamp` returns the timestamp of the ancestor at a given height
/// (valid for every height below `height`). Heights 0 and 1 use `pow_limit`.
pub fn target_for_height(
    height: u64,
    parent_target: u64,
    pow_limit: u64,
    get_timestamp: impl Fn(u64) -> u64,
) -> u64 {
    if height <= 1 {
        return pow_limit;
    }
    let num_timestamps = height.min(DIFFICULTY_WINDOW + 1);
    let start = height - num_timestamps;
    let timestamps: Vec<u64> = (start..height).map(&get_timestamp).collect();
    next_target(&timestamps, parent_target, pow_limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaced_timestamps(start: u64, count: usize, interval: u64) -> Vec<u64> {
        (0..count).map(|i| start + i as u64 * interval).collect()
    }

    // --- block_work ---

    #[test]
    fn easiest_target_is_one_unit_of_work() {
        assert_eq!(block_work(u64::MAX), 1);
    }

    #[test]
    fn halving_target_doubles_work() {
        assert_eq!(block_work(u64::MAX / 2), 2);
        assert!(block_work(1000) > block_work(2000));
    }

    #[test]
    fn hardest_target_does_not_overflow() {
        assert_eq!(block_work(0), 1u128 << 64);
    }

    // --- hash_meets_target ---

    #[test]
    fn zero_hash_meets_any_target() {
        assert!(hash_meets_target(&Hash256::ZERO, 0));
        assert!(!hash_meets_target(&Hash256([0xFF; 32]), u64::MAX - 1));
        assert!(hash_meets_target(&Hash256([0xFF; 32]), u64::MAX));
    }

    // --- next_target ---

    #[test]
    fn on_target_returns_same_difficulty() {
        let ts = spaced_timestamps(1_000_000, 61, BLOCK_TIME_SECS);
        assert_eq!(next_target(&ts, 1_000_000, u64::MAX), 1_000_000);
    }

    #[test]
    fn slow_blocks_increase_target() {
        let ts = spaced_timestamps(1_000_000, 61, BLOCK_TIME_SECS * 2);
        assert_eq!(next_target(&ts, 1_000_000, u64::MAX), 2_000_000);
    }

    #[test]
    fn adjustment_is_clamped() {
        let ts = spaced_timestamps(1_000_000, 11, BLOCK_TIME_SECS * 100);
        assert_eq!(next_target(&ts, 1_000_000, u64::MAX), 4_000_000);
        let fast = spaced_timestamps(1_000_000, 11, 1);
        assert_eq!(next_target(&fast, 1_000_000, u64::MAX), 250_000);
    }

    #[test]
    fn result_respects_pow_limit() {
        let ts = spaced_timestamps(1_000_000, 11, BLOCK_TIME_SECS * 4);
        assert_eq!(next_target(&ts, 1_000, 2_000), 2_000);
    }

    #[test]
    fn early_heights_use_pow_limit() {
        assert_eq!(target_for_height(0, 5, 77, |_| 0), 77);
        assert_eq!(target_for_height(1, 5, 77, |_| 0), 77);
    }
}
