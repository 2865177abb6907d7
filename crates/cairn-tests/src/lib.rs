//! Integration test suite for the Cairn chain-state engine.
//!
//! Each test opens a real [`Chainstate`](cairn_node_lib::Chainstate) on a
//! temporary directory, on regtest, with a fixed clock and a mempool that
//! records what the engine tells it.

pub mod helpers;
