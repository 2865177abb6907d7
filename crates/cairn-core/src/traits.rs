//! Collaborator interfaces consumed by the chain-state engine.
//!
//! - [`ScriptVerifier`]: per-input signature and script checks, run on the
//!   script-check pool (cairn-consensus implements).
//! - [`MempoolSink`]: reorg reconciliation for the unconfirmed pool.
//! - [`Clock`]: wall-clock time for header timestamp checks.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TransactionError;
use crate::types::{Coin, Transaction};

/// Set of script rules in force at a height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    pub const NONE: Self = Self(0);
    pub const P2SH: Self = Self(1 << 0);
    pub const STRICTENC: Self = Self(1 << 1);
    pub const DERSIG: Self = Self(1 << 2);
    pub const CHECKLOCKTIMEVERIFY: Self = Self(1 << 3);
    pub const CHECKSEQUENCEVERIFY: Self = Self(1 << 4);
    pub const WITNESS: Self = Self(1 << 5);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ScriptFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Verifies one input of a transaction against the coin it spends.
///
/// Implementations must be stateless: checks for one block run in parallel
/// on a worker pool.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &Coin,
        flags: ScriptFlags,
    ) -> Result<(), TransactionError>;
}

/// The unconfirmed transaction pool, as seen by the chain-state engine.
pub trait MempoolSink: Send + Sync {
    /// Called after every disconnect/connect batch of a reorg.
    ///
    /// `removed` holds the transactions of disconnected blocks, oldest block
    /// first. With `add_back` they are offered back to the pool; without it
    /// they are dropped along with anything spending them.
    fn reconcile_after_reorg(&self, removed: &[Transaction], add_back: bool);

    /// Called after a batch of connects with the newly confirmed transactions.
    fn remove_confirmed(&self, txs: &[Transaction], height: u64);
}

/// A pool that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMempool;

impl MempoolSink for NoopMempool {
    fn reconcile_after_reorg(&self, _removed: &[Transaction], _add_back: bool) {}

    fn remove_confirmed(&self, _txs: &[Transaction], _height: u64) {}
}

/// Source of the current Unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEQUENCE_FINAL;
    use crate::types::{Hash256, OutPoint, TxInput, TxOutput};
    use std::sync::Mutex;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([1; 32]), 0),
                signature: vec![0; 64],
                public_key: vec![0; 32],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOutput {
                value: 1,
                script_pubkey: vec![0; 32],
            }],
            lock_time: 0,
        }
    }

    // ------------------------------------------------------------------
    // ScriptFlags
    // ------------------------------------------------------------------

    #[test]
    fn flags_combine() {
        let f = ScriptFlags::P2SH | ScriptFlags::WITNESS;
        assert!(f.contains(ScriptFlags::P2SH));
        assert!(f.contains(ScriptFlags::WITNESS));
        assert!(!f.contains(ScriptFlags::DERSIG));
        assert!(f.contains(ScriptFlags::NONE));
        assert_eq!(ScriptFlags::default(), ScriptFlags::NONE);
    }

    // ------------------------------------------------------------------
    // Mock: ScriptVerifier
    // ------------------------------------------------------------------

    struct RejectAbove(u64);

    impl ScriptVerifier for RejectAbove {
        fn verify_input(
            &self,
            _tx: &Transaction,
            input_index: usize,
            spent: &Coin,
            _flags: ScriptFlags,
        ) -> Result<(), TransactionError> {
            if spent.output.value > self.0 {
                return Err(TransactionError::Script {
                    index: input_index,
                    reason: "too rich".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn verifier_is_object_safe() {
        let v: Box<dyn ScriptVerifier> = Box::new(RejectAbove(5));
        let tx = sample_tx();
        let cheap = Coin::new(tx.outputs[0].clone(), 1, false);
        assert!(v.verify_input(&tx, 0, &cheap, ScriptFlags::NONE).is_ok());
        let mut rich = cheap.clone();
        rich.output.value = 6;
        assert!(v.verify_input(&tx, 0, &rich, ScriptFlags::NONE).is_err());
    }

    // ------------------------------------------------------------------
    // Mock: MempoolSink
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, bool)>>);

    impl MempoolSink for Recorder {
        fn reconcile_after_reorg(&self, removed: &[Transaction], add_back: bool) {
            self.0.lock().unwrap().push((removed.len(), add_back));
        }

        fn remove_confirmed(&self, _txs: &[Transaction], _height: u64) {}
    }

    #[test]
    fn mempool_sink_through_trait_object() {
        let rec = Recorder::default();
        let sink: &dyn MempoolSink = &rec;
        sink.reconcile_after_reorg(&[sample_tx()], true);
        NoopMempool.reconcile_after_reorg(&[sample_tx()], false);
        assert_eq!(*rec.0.lock().unwrap(), vec![(1, true)]);
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    #[test]
    fn fixed_clock_moves_on_demand() {
        let c = FixedClock::new(100);
        assert_eq!(c.now(), 100);
        c.advance(5);
        assert_eq!(c.now(), 105);
        c.set(7);
        assert_eq!(c.now(), 7);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
