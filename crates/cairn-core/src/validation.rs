//! Transaction validation.
//!
//! Two levels of validation:
//!
//! - **Structural** ([`check_transaction`]): context-free checks on
//!   transaction format and value ranges.
//! - **Contextual** ([`check_tx_inputs`]): coin-aware checks for input
//!   existence, coinbase maturity and value conservation. Returns the fee.
//!
//! Signature checks are not done here; they go through
//! [`ScriptVerifier`](crate::traits::ScriptVerifier) so they can run on a
//! worker pool.

use std::collections::HashSet;

use crate::constants::{
    LOCKTIME_THRESHOLD, MAX_COINBASE_DATA, MAX_MONEY, MAX_TX_WEIGHT, MIN_COINBASE_DATA,
    SEQUENCE_FINAL, WITNESS_SCALE_FACTOR,
};
use crate::error::TransactionError;
use crate::types::{Coin, OutPoint, Transaction};

/// Validate transaction structure (context-free).
///
/// - Non-empty inputs and outputs
/// - Each output and the output sum within [`MAX_MONEY`]
/// - Stripped weight within [`MAX_TX_WEIGHT`]
/// - Coinbase: data length within bounds
/// - Other: no null or duplicate prevouts
pub fn check_transaction(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(TransactionError::EmptyInputsOrOutputs);
    }

    let stripped_weight = tx.stripped_size() * WITNESS_SCALE_FACTOR;
    if stripped_weight > MAX_TX_WEIGHT {
        return Err(TransactionError::OversizedTransaction {
            size: stripped_weight,
            max: MAX_TX_WEIGHT,
        });
    }

    let mut total: u64 = 0;
    for output in &tx.outputs {
        if output.value > MAX_MONEY {
            return Err(TransactionError::ValueOutOfRange);
        }
        total = total
            .checked_add(output.value)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or(TransactionError::ValueOutOfRange)?;
    }

    if tx.is_coinbase() {
        let data_len = tx.inputs[0].signature.len();
        if !(MIN_COINBASE_DATA..=MAX_COINBASE_DATA).contains(&data_len) {
            return Err(TransactionError::InvalidCoinbase(format!(
                "data length {data_len} outside {MIN_COINBASE_DATA}..={MAX_COINBASE_DATA}"
            )));
        }
        return Ok(());
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.previous_output.is_null() {
            return Err(TransactionError::NullPrevout(i));
        }
        if !seen.insert(&input.previous_output) {
            return Err(TransactionError::DuplicateInput(
                input.previous_output.to_string(),
            ));
        }
    }

    Ok(())
}

/// Check a non-coinbase transaction's inputs against the coin view.
///
/// `get_coin` looks a coin up by outpoint so the caller can supply any
/// source (cache, database, in-memory map). Returns the fee.
pub fn check_tx_inputs<F>(
    tx: &Transaction,
    get_coin: F,
    spend_height: u64,
) -> Result<u64, TransactionError>
where
    F: Fn(&OutPoint) -> Option<Coin>,
{
    let mut total_input: u64 = 0;

    for (i, input) in tx.inputs.iter().enumerate() {
        let coin = get_coin(&input.previous_output).ok_or_else(|| {
            TransactionError::MissingInputs(input.previous_output.to_string())
        })?;

        if !coin.is_mature(spend_height) {
            return Err(TransactionError::ImmatureCoinbase { index: i });
        }

        total_input = total_input
            .checked_add(coin.output.value)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or(TransactionError::ValueOutOfRange)?;
    }

    let total_output = tx
        .total_output_value()
        .ok_or(TransactionError::ValueOutOfRange)?;

    if total_input < total_output {
        return Err(TransactionError::InsufficientFunds {
            have: total_input,
            need: total_output,
        });
    }

    Ok(total_input - total_output)
}

/// Whether `tx` may be included in a block at `height` with lock-time
/// cutoff `block_time`.
pub fn is_final_tx(tx: &Transaction, height: u64, block_time: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        block_time
    };
    if tx.lock_time < cutoff {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}
