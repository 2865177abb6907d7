//! Connecting and disconnecting single blocks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use cairn_consensus::{script_flags, ScriptCheck};
use cairn_core::block_validation::{
    check_block, contextual_check_block, contextual_check_block_header, HeaderContext,
};
use cairn_core::coins::{CoinsView, CoinsViewCache, CoinsWrite};
use cairn_core::constants::MAX_MONEY;
use cairn_core::error::{BlockError, CairnError, ChainStateError, TransactionError};
use cairn_core::reward::block_subsidy;
use cairn_core::types::{Block, BlockUndo, Hash256, OutPoint, Transaction};
use cairn_core::validation::check_tx_inputs;

use super::{ChainInner, Chainstate};
use crate::block_index::{BlockId, BlockIndex, Validity};
use crate::storage::TxLocation;
use crate::utxo::{self, DisconnectResult};

/// Identity of the block being connected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockContext {
    /// Index entry, absent for a dry run of a block not in the index.
    pub id: Option<BlockId>,
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
}

impl Chainstate {
    /// Validate `block` against `view` and apply it there.
    ///
    /// With `just_check` nothing outside `view` changes: no undo record, no
    /// validity update, no transaction index.
    pub(crate) fn connect_block<B: CoinsView>(
        &self,
        index: &mut BlockIndex,
        block: &Block,
        ctx: &BlockContext,
        view: &mut CoinsViewCache<B>,
        just_check: bool,
    ) -> Result<(), CairnError> {
        let view_best = view.best_block()?;
        if view_best != ctx.prev_hash {
            return Err(ChainStateError::ViewMismatch {
                view: view_best.to_string(),
                parent: ctx.prev_hash.to_string(),
            }
            .into());
        }

        check_block(block, self.params.pow_limit)?;

        // Genesis outputs are not spendable and never enter the coin set.
        if ctx.hash == self.params.genesis_hash() {
            if !just_check {
                view.set_best_block(ctx.hash);
            }
            return Ok(());
        }

        let height = ctx.height;
        if !self.params.is_bip30_exception(height, &ctx.hash) {
            for tx in &block.transactions {
                let txid = tx.txid();
                for o in 0..tx.outputs.len() {
                    let outpoint = OutPoint::new(txid, o as u64);
                    if view.have_coin(&outpoint)? {
                        return Err(BlockError::OverwriteUnspent(outpoint.to_string()).into());
                    }
                }
            }
        }

        let flags = script_flags(height, &self.params);
        let mut fees: u64 = 0;
        let mut checks = Vec::new();
        let mut undo = BlockUndo::default();

        for (i, tx) in block.transactions.iter().enumerate() {
            if !tx.is_coinbase() {
                let mut spent = HashMap::with_capacity(tx.inputs.len());
                for input in &tx.inputs {
                    if let Some(coin) = view.access_coin(&input.previous_output)? {
                        spent.insert(input.previous_output.clone(), coin);
                    }
                }
                let fee = check_tx_inputs(tx, |op| spent.get(op).cloned(), height)
                    .map_err(|source| BlockError::Transaction { index: i, source })?;
                fees = fees
                    .checked_add(fee)
                    .filter(|f| *f <= MAX_MONEY)
                    .ok_or(BlockError::Transaction {
                        index: i,
                        source: TransactionError::ValueOutOfRange,
                    })?;

                let shared = Arc::new(tx.clone());
                for (j, input) in tx.inputs.iter().enumerate() {
                    if let Some(coin) = spent.remove(&input.previous_output) {
                        checks.push(ScriptCheck {
                            tx: Arc::clone(&shared),
                            tx_index: i,
                            input_index: j,
                            spent: coin,
                            flags,
                        });
                    }
                }
            }
            utxo::update_coins(tx, view, &mut undo, height)?;
        }

        let limit = fees + block_subsidy(height, self.params.subsidy_halving_interval);
        let minted = block
            .coinbase()
            .and_then(Transaction::total_output_value)
            .ok_or(BlockError::NoCoinbase)?;
        if minted > limit {
            return Err(BlockError::BadCoinbaseAmount { got: minted, limit }.into());
        }

        self.scripts
            .run(&checks, self.collab.verifier.as_ref())
            .map_err(|(index, source)| BlockError::Transaction { index, source })?;

        if just_check {
            return Ok(());
        }

        let id = ctx.id.ok_or_else(|| {
            ChainStateError::Inconsistent(format!("connecting {} without index entry", ctx.hash))
        })?;
        let entry = index.get(id);
        let data_pos = entry
            .data_pos
            .ok_or_else(|| ChainStateError::BlockDataMissing(ctx.hash.to_string()))?;
        if !entry.has_undo() {
            let pos = self.store.write_undo(&undo, &ctx.prev_hash, data_pos.file)?;
            index.set_undo_pos(id, pos);
        }
        index.raise_validity(id, Validity::Scripts);

        if self.config.txindex {
            let locations: Vec<(Hash256, TxLocation)> = block
                .transactions
                .iter()
                .enumerate()
                .map(|(i, tx)| {
                    (
                        tx.txid(),
                        TxLocation {
                            block_pos: data_pos,
                            tx_index: i as u32,
                        },
                    )
                })
                .collect();
            self.index_db.write_tx_index(&locations)?;
        }

        view.set_best_block(ctx.hash);
        Ok(())
    }

    /// Dry-run `block` on top of the active tip.
    ///
    /// Runs the header, body and connection checks without storing
    /// anything. The block's parent must be the current tip.
    pub fn test_block_validity(&self, block: &Block) -> Result<(), CairnError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tip = inner.chain.tip();
        let tip_entry = inner.index.get(tip);
        if block.header.prev_hash != tip_entry.hash {
            return Err(BlockError::PrevBlockNotFound(block.header.prev_hash.to_string()).into());
        }
        let height = tip_entry.height + 1;
        let ctx = HeaderContext {
            height,
            median_time_past: inner.index.median_time_past(tip),
            expected_target: inner.index.next_target(tip, &self.params),
        };
        contextual_check_block_header(
            &block.header,
            &ctx,
            &self.params,
            self.collab.clock.now(),
        )?;
        check_block(block, self.params.pow_limit)?;
        contextual_check_block(block, height, ctx.median_time_past, &self.params)?;

        let bctx = BlockContext {
            id: None,
            hash: block.hash(),
            prev_hash: block.header.prev_hash,
            height,
        };
        let mut view = CoinsViewCache::new(&inner.coins);
        self.connect_block(&mut inner.index, block, &bctx, &mut view, true)
    }

    /// Connect `id` on top of the active tip. `block` saves a disk read
    /// when the caller already has the body.
    ///
    /// An invalid block is marked failed before the error is returned.
    pub(crate) fn connect_tip(
        &self,
        inner: &mut ChainInner,
        id: BlockId,
        block: Option<&Block>,
    ) -> Result<(), CairnError> {
        let entry = inner.index.get(id);
        let read;
        let block = match block {
            Some(b) => b,
            None => {
                let pos = entry
                    .data_pos
                    .ok_or_else(|| ChainStateError::BlockDataMissing(entry.hash.to_string()))?;
                read = self.store.read_block(pos)?;
                &read
            }
        };
        let ctx = BlockContext {
            id: Some(id),
            hash: entry.hash,
            prev_hash: entry.header.prev_hash,
            height: entry.height,
        };

        let ChainInner {
            index, chain, coins, ..
        } = &mut *inner;
        let mut view = CoinsViewCache::new(&*coins);
        if let Err(e) = self.connect_block(index, block, &ctx, &mut view, false) {
            if e.is_invalid() {
                index.mark_failed(id);
                info!(hash = %ctx.hash, height = ctx.height, error = %e, "block failed to connect");
            }
            return Err(e);
        }
        let (changes, best) = view.into_changes();
        coins.batch_write(changes, best)?;
        chain.set_tip(index, id);
        self.record_connected();

        let e = index.get(id);
        info!(
            height = e.height,
            hash = %e.hash,
            txs = e.chain_tx_count,
            cache_mib = coins.dynamic_usage() as f64 / (1024.0 * 1024.0),
            "new tip"
        );

        self.collab
            .mempool
            .remove_confirmed(&block.transactions, ctx.height);
        self.flush_state_locked(inner, super::FlushMode::IfNeeded)?;
        Ok(())
    }

    /// Disconnect the active tip. Its non-coinbase transactions are
    /// prepended to `disconnected`, keeping oldest-block-first order.
    pub(crate) fn disconnect_tip(
        &self,
        inner: &mut ChainInner,
        disconnected: &mut Vec<Transaction>,
    ) -> Result<(), CairnError> {
        let tip = inner.chain.tip();
        let entry = inner.index.get(tip);
        let parent = entry.parent.ok_or_else(|| {
            ChainStateError::Inconsistent("attempt to disconnect genesis".to_string())
        })?;
        let pos = entry
            .data_pos
            .ok_or_else(|| ChainStateError::BlockDataMissing(entry.hash.to_string()))?;
        let block = self.store.read_block(pos)?;

        let ChainInner {
            index, chain, coins, ..
        } = &mut *inner;
        let mut view = CoinsViewCache::new(&*coins);
        let entry = index.get(tip);
        let (height, hash) = (entry.height, entry.hash);
        if utxo::disconnect_block(&self.store, &self.params, &block, entry, &mut view)?
            == DisconnectResult::Failed
        {
            return Err(ChainStateError::DisconnectFailed(hash.to_string()).into());
        }
        let (changes, best) = view.into_changes();
        coins.batch_write(changes, best)?;
        chain.set_tip(index, parent);
        index.add_candidate(parent);
        self.record_disconnected();
        debug!(height, %hash, "block disconnected");

        let txs: Vec<Transaction> = block
            .transactions
            .into_iter()
            .filter(|tx| !tx.is_coinbase())
            .collect();
        disconnected.splice(0..0, txs);

        self.flush_state_locked(inner, super::FlushMode::IfNeeded)?;
        Ok(())
    }
}
