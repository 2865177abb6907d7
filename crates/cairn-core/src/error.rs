//! Error types for the Cairn chain-state engine.
//!
//! Every failure surfaced by the engine belongs to one of three classes
//! (see [`ErrorClass`]): the block itself is consensus-invalid, some data it
//! depends on has not arrived yet, or the node hit a system fault and must
//! stop mutating its stores.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("missing inputs: {0}")] MissingInputs(String),
    #[error("inputs spend {have}, outputs need {need}")] InsufficientFunds { have: u64, need: u64 },
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("oversized: {size} > {max}")] OversizedTransaction { size: usize, max: usize },
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
    #[error("value out of range")] ValueOutOfRange,
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("serialization: {0}")] Serialization(String),
    #[error("premature spend of coinbase at input {index}")] ImmatureCoinbase { index: usize },
    #[error("null outpoint in non-coinbase input {0}")] NullPrevout(usize),
    #[error("non-final transaction")] NonFinal,
    #[error("script verification failed on input {index}: {reason}")] Script { index: usize, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("proof of work failed")] HighHash,
    #[error("target above pow limit")] TargetTooEasy,
    #[error("incorrect difficulty: got {got}, expected {expected}")] BadDifficulty { got: u64, expected: u64 },
    #[error("time too old")] TimeTooOld,
    #[error("time too far in the future: {0}")] TimeTooNew(u64),
    #[error("obsolete version {version} at height {height}")] BadVersion { version: u64, height: u64 },
    #[error("previous block not found: {0}")] PrevBlockNotFound(String),
    #[error("previous block is invalid")] BadPrevBlock,
    #[error("duplicate of a known invalid block: {0}")] DuplicateInvalid(String),
    #[error("checkpoint mismatch at height {height}")] CheckpointMismatch { height: u64 },
    #[error("fork forks off before the last checkpoint at height {height}")] ForkBeforeCheckpoint { height: u64 },
    #[error("merkle root mismatch")] BadMerkleRoot,
    #[error("duplicate transaction")] DuplicateTransaction,
    #[error("witness merkle commitment mismatch")] BadWitnessCommitment,
    #[error("missing witness commitment")] MissingWitnessCommitment,
    #[error("block weight {weight} exceeds {max}")] Overweight { weight: usize, max: usize },
    #[error("no coinbase")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("coinbase does not start with serialized height")] BadCoinbaseHeight,
    #[error("coinbase pays {got}, limit {limit}")] BadCoinbaseAmount { got: u64, limit: u64 },
    #[error("tried to overwrite unspent output {0}")] OverwriteUnspent(String),
    #[error("double spend across transactions: {0}")] DoubleSpend(String),
    #[error("tx error in {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

impl BlockError {
    /// True when the body could have been malleated in transit; the header
    /// itself may still be valid so it must not be marked failed.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            BlockError::BadMerkleRoot
                | BlockError::DuplicateTransaction
                | BlockError::BadWitnessCommitment
                | BlockError::MissingWitnessCommitment
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("pubkey hash does not match script")] PubkeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")] Conflict { existing_txid: String, outpoint: String },
    #[error("pool full")] PoolFull,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("bad checkpoint signature at height {0}")] BadSignature(u64),
    #[error("no checkpoint master key configured")] NoMasterKey,
    #[error("conflicting checkpoint at height {height}")] Conflict { height: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("block data missing for {0}")] BlockDataMissing(String),
    #[error("undo data missing for block: {0}")] UndoDataMissing(String),
    #[error("undo checksum mismatch for block: {0}")] UndoChecksumMismatch(String),
    #[error("failed to disconnect block {0}")] DisconnectFailed(String),
    #[error("coin view best block {view} does not match parent {parent}")] ViewMismatch { view: String, parent: String },
    #[error("attempted to overwrite an unspent coin: {0}")] CoinOverwrite(String),
    #[error("fresh flag misapplied to coin {0}")] FreshMisapplied(String),
    #[error("inconsistent state: {0}")] Inconsistent(String),
    #[error("shutdown requested")] ShutdownRequested,
    #[error("genesis block cannot be invalidated")] InvalidateGenesis,
}

#[derive(Error, Debug)]
pub enum CairnError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Checkpoint(#[from] CheckpointError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error("storage: {0}")] Storage(String),
    #[error("block file: {0}")] BlockFile(String),
    #[error("io: {0}")] Io(String),
    #[error("worker pool: {0}")] WorkerPool(String),
}

impl From<std::io::Error> for CairnError {
    fn from(e: std::io::Error) -> Self {
        CairnError::Io(e.to_string())
    }
}

/// How the engine reacts to an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The block or header violates a consensus rule. Recorded as a sticky
    /// failure and never retried.
    Invalid,
    /// An ancestor body or undo record is not available yet.
    MissingData,
    /// Disk, corruption or invariant failure. Abort and request shutdown.
    Fatal,
}

impl CairnError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CairnError::Transaction(_) | CairnError::Crypto(_) => ErrorClass::Invalid,
            CairnError::Block(BlockError::PrevBlockNotFound(_)) => ErrorClass::MissingData,
            CairnError::Block(_) => ErrorClass::Invalid,
            CairnError::Checkpoint(_) | CairnError::Mempool(_) => ErrorClass::Invalid,
            CairnError::ChainState(ChainStateError::BlockDataMissing(_)) => ErrorClass::MissingData,
            CairnError::ChainState(ChainStateError::InvalidateGenesis) => ErrorClass::Invalid,
            CairnError::ChainState(_) => ErrorClass::Fatal,
            CairnError::Storage(_)
            | CairnError::BlockFile(_)
            | CairnError::Io(_)
            | CairnError::WorkerPool(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.class() == ErrorClass::Invalid
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// True for invalid bodies that may have been malleated.
    pub fn is_mutation(&self) -> bool {
        matches!(self, CairnError::Block(e) if e.is_mutation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_errors_are_invalid() {
        assert_eq!(CairnError::from(BlockError::HighHash).class(), ErrorClass::Invalid);
        assert_eq!(
            CairnError::from(TransactionError::NonFinal).class(),
            ErrorClass::Invalid
        );
    }

    #[test]
    fn missing_parent_is_missing_data() {
        let err = CairnError::from(BlockError::PrevBlockNotFound("ab".into()));
        assert_eq!(err.class(), ErrorClass::MissingData);
        assert!(!err.is_invalid());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let err = CairnError::from(ChainStateError::UndoChecksumMismatch("ab".into()));
        assert!(err.is_fatal());
        assert!(CairnError::Storage("disk full".into()).is_fatal());
    }

    #[test]
    fn mutation_detection() {
        assert!(CairnError::from(BlockError::BadMerkleRoot).is_mutation());
        assert!(!CairnError::from(BlockError::HighHash).is_mutation());
    }
}
