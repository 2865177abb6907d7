//! # cairn-node-lib: Chain-state engine.
//!
//! Everything between "a header or block arrived" and "the coin set reflects
//! the best valid chain":
//! - [`block_index::BlockIndex`]: the in-memory block tree and candidate set
//! - [`block_store::BlockStore`]: append-only block and undo files
//! - [`coins_db::CoinsDb`]: the persistent coin set behind the coin cache
//! - [`chainstate::Chainstate`]: acceptance, activation, flushing, overrides
//! - [`import`]: reindex and bootstrap-file import
//! - [`config::ChainstateConfig`]: engine configuration

pub mod block_index;
pub mod block_store;
pub mod chain;
pub mod chainstate;
pub mod coins_db;
pub mod config;
pub mod import;
pub mod storage;
pub mod utxo;

pub use block_index::{BlockId, BlockIndex, Validity};
pub use chainstate::{BlockInfo, ChainStats, Chainstate, Collaborators, FlushMode};
pub use config::ChainstateConfig;
pub use import::{run_import, ImportReport, ImportSource};
