//! Applying and reversing blocks on a coin view.
//!
//! Connecting a transaction spends its inputs and records the spent coins in
//! an undo record; disconnecting walks the block backwards, deleting the
//! outputs it created and restoring the coins it spent. [`replay_blocks`]
//! uses both to repair a coin database left between two tips by an
//! interrupted flush.

use cairn_core::coins::{add_coins, CoinsView, CoinsViewCache};
use cairn_core::constants::ChainParams;
use cairn_core::error::{CairnError, ChainStateError};
use cairn_core::types::{Block, BlockUndo, Coin, Hash256, OutPoint, Transaction, TxUndo};
use tracing::{error, info, warn};

use crate::block_index::{BlockIndex, BlockIndexEntry};
use crate::block_store::BlockStore;
use crate::coins_db::CoinsDb;

/// Outcome of reversing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectResult {
    /// Every coin matched expectations.
    Ok,
    /// The view was repaired but did not match exactly: an output to delete
    /// was missing or different, or a restored coin was already present.
    Unclean,
    /// Undo data was missing or did not fit the block. The view is unusable.
    Failed,
}

/// Spend the inputs of `tx` into `undo` and add its outputs at `height`.
///
/// Inputs must exist; callers validate them first.
pub fn update_coins<B: CoinsView>(
    tx: &Transaction,
    view: &mut CoinsViewCache<B>,
    undo: &mut BlockUndo,
    height: u64,
) -> Result<(), CairnError> {
    if !tx.is_coinbase() {
        let mut tx_undo = TxUndo::default();
        for input in &tx.inputs {
            let coin = view.spend_coin(&input.previous_output)?.ok_or_else(|| {
                ChainStateError::Inconsistent(format!(
                    "spending missing coin {}",
                    input.previous_output
                ))
            })?;
            tx_undo.prev_coins.push(coin);
        }
        undo.txs.push(tx_undo);
    }
    add_coins(view, tx, height, false)
}

/// Restore one spent coin. Returns `false` if something was already there.
fn apply_tx_in_undo<B: CoinsView>(
    coin: Coin,
    view: &mut CoinsViewCache<B>,
    outpoint: &OutPoint,
) -> Result<bool, CairnError> {
    let clean = !view.have_coin(outpoint)?;
    view.add_coin(outpoint.clone(), coin, !clean)?;
    Ok(clean)
}

/// Reverse `block` (described by `entry`) on `view` using its undo record.
pub fn disconnect_block<B: CoinsView>(
    store: &BlockStore,
    params: &ChainParams,
    block: &Block,
    entry: &BlockIndexEntry,
    view: &mut CoinsViewCache<B>,
) -> Result<DisconnectResult, CairnError> {
    let Some(undo_pos) = entry.undo_pos else {
        error!(hash = %entry.hash, "no undo data to disconnect block");
        return Ok(DisconnectResult::Failed);
    };
    let undo = match store.read_undo(undo_pos, &block.header.prev_hash) {
        Ok(undo) => undo,
        Err(e) => {
            error!(hash = %entry.hash, error = %e, "failed to read undo data");
            return Ok(DisconnectResult::Failed);
        }
    };
    if undo.txs.len() + 1 != block.transactions.len() {
        error!(
            hash = %entry.hash,
            undo = undo.txs.len(),
            txs = block.transactions.len(),
            "undo data does not match block"
        );
        return Ok(DisconnectResult::Failed);
    }

    let bip30_exception = params.is_bip30_exception(entry.height, &entry.hash);
    let mut clean = true;

    for (i, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (o, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, o as u64);
            let spent = view.spend_coin(&outpoint)?;
            let matches = spent.is_some_and(|c| {
                c.output == *output && c.height == entry.height && c.is_coinbase == is_coinbase
            });
            if !matches && !bip30_exception {
                clean = false;
            }
        }

        if i > 0 {
            let tx_undo = &undo.txs[i - 1];
            if tx_undo.prev_coins.len() != tx.inputs.len() {
                error!(hash = %entry.hash, tx = i, "undo input count mismatch");
                return Ok(DisconnectResult::Failed);
            }
            for (input, coin) in tx.inputs.iter().zip(&tx_undo.prev_coins).rev() {
                if !apply_tx_in_undo(coin.clone(), view, &input.previous_output)? {
                    clean = false;
                }
            }
        }
    }

    view.set_best_block(block.header.prev_hash);
    if clean {
        Ok(DisconnectResult::Ok)
    } else {
        warn!(hash = %entry.hash, "block disconnected uncleanly");
        Ok(DisconnectResult::Unclean)
    }
}

/// Re-apply `block` at `height` without validation, tolerating outputs that
/// already exist. Used to finish an interrupted flush.
fn roll_forward_block<B: CoinsView>(
    block: &Block,
    height: u64,
    view: &mut CoinsViewCache<B>,
) -> Result<(), CairnError> {
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                view.spend_coin(&input.previous_output)?;
            }
        }
        add_coins(view, tx, height, true)?;
    }
    Ok(())
}

/// What [`replay_blocks`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    /// The tip the coin database now reflects.
    pub tip: Hash256,
    pub disconnected: u64,
    pub connected: u64,
}

/// Finish an interrupted coin flush.
///
/// When the head-blocks record holds `[new, old]`, blocks of `old` back to
/// the fork with `new` are disconnected, blocks up to `new` are applied,
/// and the result is flushed, leaving the record `[new]`. Returns `None`
/// when the database was consistent.
pub fn replay_blocks(
    index: &BlockIndex,
    store: &BlockStore,
    params: &ChainParams,
    coins: &mut CoinsViewCache<CoinsDb>,
) -> Result<Option<ReplayReport>, CairnError> {
    let heads = coins.base().head_blocks()?;
    let (new_hash, old_hash) = match heads.as_slice() {
        [] | [_] => return Ok(None),
        [new, old] => (*new, *old),
        _ => {
            return Err(ChainStateError::Inconsistent(format!(
                "unexpected head-blocks record of {} entries",
                heads.len()
            ))
            .into())
        }
    };

    let lookup = |hash: &Hash256| {
        index.lookup(hash).ok_or_else(|| {
            CairnError::from(ChainStateError::Inconsistent(format!(
                "replay head {hash} not in block index"
            )))
        })
    };
    let new = lookup(&new_hash)?;
    let old = if old_hash.is_zero() {
        None
    } else {
        Some(lookup(&old_hash)?)
    };
    let fork = old.and_then(|o| index.last_common_ancestor(o, new));

    info!(new = %new_hash, old = %old_hash, "replaying blocks after interrupted flush");

    let read = |entry: &BlockIndexEntry| -> Result<Block, CairnError> {
        let pos = entry
            .data_pos
            .ok_or_else(|| ChainStateError::BlockDataMissing(entry.hash.to_string()))?;
        store.read_block(pos)
    };

    let mut report = ReplayReport {
        tip: new_hash,
        disconnected: 0,
        connected: 0,
    };

    let mut cur = old;
    while cur != fork {
        let Some(id) = cur else { break };
        let entry = index.get(id);
        if entry.height > 0 {
            let block = read(entry)?;
            if disconnect_block(store, params, &block, entry, coins)? == DisconnectResult::Failed {
                return Err(ChainStateError::DisconnectFailed(entry.hash.to_string()).into());
            }
            report.disconnected += 1;
        }
        cur = entry.parent;
    }

    let fork_height = fork.map_or(0, |f| index.get(f).height);
    for height in fork_height + 1..=index.get(new).height {
        let Some(id) = index.ancestor(new, height) else {
            break;
        };
        let entry = index.get(id);
        let block = read(entry)?;
        roll_forward_block(&block, height, coins)?;
        report.connected += 1;
    }

    coins.set_best_block(new_hash);
    coins.flush()?;
    info!(
        disconnected = report.disconnected,
        connected = report.connected,
        "replay finished"
    );
    Ok(Some(report))
}
