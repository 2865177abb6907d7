//! Parallel script checking.
//!
//! Connecting a block produces one [`ScriptCheck`] per non-coinbase input.
//! The checks are independent, so they run on a dedicated fixed-size rayon
//! pool; the caller blocks until all of them pass or one fails. Checks that
//! are already running when another fails are allowed to finish.

use std::sync::Arc;

use cairn_core::error::{CairnError, TransactionError};
use cairn_core::traits::{ScriptFlags, ScriptVerifier};
use cairn_core::types::{Coin, Transaction};
use rayon::prelude::*;
use tracing::debug;

/// One deferred input check.
#[derive(Debug, Clone)]
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    /// Position of `tx` in its block, for error reporting.
    pub tx_index: usize,
    pub input_index: usize,
    pub spent: Coin,
    pub flags: ScriptFlags,
}

impl ScriptCheck {
    pub fn run(&self, verifier: &dyn ScriptVerifier) -> Result<(), TransactionError> {
        verifier.verify_input(&self.tx, self.input_index, &self.spent, self.flags)
    }
}

/// Fixed-size worker pool for script checks.
pub struct ScriptCheckPool {
    pool: rayon::ThreadPool,
}

impl ScriptCheckPool {
    /// Build a pool with `threads` workers; 0 picks one per core.
    pub fn new(threads: usize) -> Result<Self, CairnError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("scriptcheck-{i}"))
            .build()
            .map_err(|e| CairnError::WorkerPool(e.to_string()))?;
        debug!(threads = pool.current_num_threads(), "script check pool started");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run every check. On failure, returns the tx position and error of
    /// the earliest failing check in `checks` order, regardless of which
    /// worker hit a failure first.
    pub fn run(
        &self,
        checks: &[ScriptCheck],
        verifier: &dyn ScriptVerifier,
    ) -> Result<(), (usize, TransactionError)> {
        if checks.is_empty() {
            return Ok(());
        }
        self.pool.install(|| {
            checks
                .par_iter()
                .map(|check| check.run(verifier).map_err(|e| (check.tx_index, e)))
                .find_first(Result::is_err)
                .unwrap_or(Ok(()))
        })
    }
}

impl std::fmt::Debug for ScriptCheckPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCheckPool")
            .field("threads", &self.threads())
            .finish()
    }
}
