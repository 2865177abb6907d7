//! Block subsidy schedule.
//!
//! The subsidy starts at [`INITIAL_SUBSIDY`](crate::constants::INITIAL_SUBSIDY)
//! and halves every `halving_interval` blocks. After 64 halvings the shift
//! would overflow, so the subsidy is defined as zero from then on.

use crate::constants::INITIAL_SUBSIDY;

/// Subsidy (in base units) for a block at `height`.
pub fn block_subsidy(height: u64, halving_interval: u64) -> u64 {
    if halving_interval == 0 {
        return 0;
    }
    let halvings = height / halving_interval;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}
