//! # cairn-consensus: Checkpoints and script checking.
//!
//! Everything the chain-state engine needs to decide whether a block's
//! inputs are authorised and whether a branch respects signed checkpoints:
//!
//! - [`checkpoint`]: signed `(height, hash)` pins and the set that holds them.
//! - [`flags`]: which script rules apply at a height.
//! - [`verifier`]: the Ed25519 pay-to-pubkey-hash [`ScriptVerifier`](cairn_core::traits::ScriptVerifier).
//! - [`script_check`]: the fixed-size worker pool that runs input checks in parallel.

pub mod checkpoint;
pub mod flags;
pub mod script_check;
pub mod verifier;

pub use checkpoint::{CheckpointSet, SignedCheckpoint};
pub use flags::script_flags;
pub use script_check::{ScriptCheck, ScriptCheckPool};
pub use verifier::Ed25519Verifier;
