//! Proof-of-work targets, chain work accumulation, and difficulty retargeting.
//!
//! # Target encoding
//!
//! `difficulty` counts the leading zero hex nibbles a valid header hash must
//! have: the numeric target is `T = 2^256 >> (4 * difficulty)` and a hash is
//! valid iff its integer value is at most `T`, which is exactly the
//! leading-nibble check. Difficulty 0 accepts any hash.
//!
//! # Chain work
//!
//! Each block contributes `2^256 / (T + 1) = 2^(4 * difficulty)` work units.
//! Cumulative work is tracked in a 256-bit accumulator so deep chains at
//! high difficulty cannot overflow.
//!
//! # Retargeting
//!
//! Every `difficulty_adjustment_interval` blocks the difficulty is rescaled
//! by `target_timespan / actual_timespan`, with the actual timespan clamped
//! so a single retarget never changes difficulty by more than
//! `max_difficulty_change` in either direction. All other heights inherit
//! the parent's difficulty.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::Hash256;

/// Count the leading zero hex nibbles of a hash.
pub fn leading_zero_nibbles(hash: &Hash256) -> u32 {
    let mut count = 0;
    for byte in hash.as_bytes() {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        return count;
    }
    count
}

/// Whether a header hash satisfies the given difficulty.
pub fn meets_difficulty(hash: &Hash256, difficulty: u32) -> bool {
    leading_zero_nibbles(hash) >= difficulty
}

/// 256-bit cumulative work accumulator.
///
/// Field order (`hi` first) makes the derived `Ord` the numeric ordering.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainWork {
    hi: u128,
    lo: u128,
}

impl ChainWork {
    pub const ZERO: Self = Self { hi: 0, lo: 0 };
    pub const MAX: Self = Self { hi: u128::MAX, lo: u128::MAX };

    /// Work contributed by one block at the given difficulty: `2^(4 * d)`.
    ///
    /// Saturates at [`ChainWork::MAX`] for difficulties of 64 nibbles or
    /// more (the entire hash zero), which no real chain reaches.
    pub fn block_work(difficulty: u32) -> Self {
        let shift = 4u32.saturating_mul(difficulty);
        if shift >= 256 {
            Self::MAX
        } else if shift >= 128 {
            Self { hi: 1u128 << (shift - 128), lo: 0 }
        } else {
            Self { hi: 0, lo: 1u128 << shift }
        }
    }

    /// Saturating addition.
    pub fn saturating_add(self, other: Self) -> Self {
        let (lo, carry) = self.lo.overflowing_add(other.lo);
        let hi = self.hi.checked_add(other.hi).and_then(|h| h.checked_add(carry as u128));
        match hi {
            Some(hi) => Self { hi, lo },
            None => Self::MAX,
        }
    }
}

/// Whether `height` is a retarget boundary (every interval, genesis exempt).
pub fn is_retarget_height(config: &Config, height: u64) -> bool {
    height != 0 && height % config.difficulty_adjustment_interval == 0
}

/// Compute the retargeted difficulty from the elapsed interval time.
///
/// `actual_timespan` is the wall time the last interval took; it is clamped
/// to `[target / max_change, target * max_change]` before rescaling so the
/// difficulty ratio stays within the configured bound. The result is never
/// below 1.
pub fn retarget(config: &Config, current: u32, actual_timespan: i64) -> u32 {
    let target_timespan =
        config.target_block_time.saturating_mul(config.difficulty_adjustment_interval);
    let max_change = config.max_difficulty_change as u64;

    let min_span = (target_timespan / max_change).max(1);
    let max_span = target_timespan.saturating_mul(max_change);
    let clamped = (actual_timespan.max(1) as u64).clamp(min_span, max_span);

    // new = current * target / actual; u128 intermediate avoids overflow.
    let scaled = (current.max(1) as u128) * (target_timespan as u128) / (clamped as u128);

    let floor = ((current as u64) / max_change).max(1);
    let ceil = (current.max(1) as u64).saturating_mul(max_change);
    (scaled as u64).clamp(floor, ceil) as u32
}

/// Expected difficulty for the block at `height`.
///
/// `get_timestamp` must return the timestamp of the canonical (or candidate
/// path) block at any height below `height`. Non-retarget heights inherit
/// `parent_difficulty`; height 0 uses the configured initial difficulty.
pub fn expected_difficulty(
    config: &Config,
    height: u64,
    parent_difficulty: u32,
    get_timestamp: impl Fn(u64) -> i64,
) -> u32 {
    if height == 0 {
        return config.initial_difficulty;
    }
    if !is_retarget_height(config, height) {
        return parent_difficulty;
    }
    let interval = config.difficulty_adjustment_interval;
    let first = get_timestamp(height - interval);
    let last = get_timestamp(height - 1);
    retarget(config, parent_difficulty, last.saturating_sub(first))
}

/// Median time past: the median of the given window of ancestor timestamps.
///
/// `timestamps` must be the most recent `median_time_span` (or fewer, near
/// genesis) timestamps in chain order. Returns `None` for an empty window.
pub fn median_time_past(timestamps: &[i64]) -> Option<i64> {
    if timestamps.is_empty() {
        return None;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}
