//! # cairn-core
//! Foundation types, consensus rules and the layered coin cache for the
//! Cairn chain-state engine.

pub mod block_validation;
pub mod coins;
pub mod constants;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod genesis;
pub mod mempool;
pub mod merkle;
pub mod reward;
pub mod traits;
pub mod types;
pub mod validation;
