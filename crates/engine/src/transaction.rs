//! Transaction state tracking
//!
//! The environment allows at most one transaction in flight. This module
//! owns the state machine around it: `begin` from an idle slot, `commit`
//! or `abort` from an active one, and automatic abort when an operation
//! inside the transaction reports a lock conflict. The terminal states
//! are observational only; the next `begin` resets them.

use lexstore_core::{Error, Result};
use tracing::{debug, warn};

use crate::backend::Backend;

/// Where the environment's single transaction slot currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// No transaction has run since the last terminal state was observed.
    None,
    /// A transaction is in flight.
    Active,
    /// The last transaction committed.
    Committed,
    /// The last transaction was aborted, by the caller or by a conflict.
    Aborted,
}

#[derive(Debug)]
pub(crate) struct TxnSlot {
    state: TxnState,
}

impl TxnSlot {
    pub(crate) fn new() -> Self {
        TxnSlot { state: TxnState::None }
    }

    pub(crate) fn state(&self) -> TxnState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    pub(crate) fn begin(&mut self, backend: &mut dyn Backend) -> Result<()> {
        if self.is_active() {
            return Err(Error::InvalidState(
                "a transaction is already active".to_string(),
            ));
        }
        backend.begin()?;
        self.state = TxnState::Active;
        debug!(target: "lexstore::txn", "transaction started");
        Ok(())
    }

    pub(crate) fn commit(&mut self, backend: &mut dyn Backend) -> Result<()> {
        if !self.is_active() {
            return Err(Error::InvalidState("no active transaction".to_string()));
        }
        match backend.commit() {
            Ok(()) => {
                self.state = TxnState::Committed;
                debug!(target: "lexstore::txn", "transaction committed");
                // Trailing log flush is opportunistic; a failure here must
                // not turn a durable commit into an error.
                if let Err(e) = backend.flush_some() {
                    warn!(target: "lexstore::txn", error = %e, "post-commit log flush failed");
                }
                Ok(())
            }
            Err(e) => {
                self.state = TxnState::Aborted;
                warn!(target: "lexstore::txn", error = %e, "commit failed, transaction aborted");
                Err(e)
            }
        }
    }

    pub(crate) fn abort(&mut self, backend: &mut dyn Backend) -> Result<()> {
        if !self.is_active() {
            return Err(Error::InvalidState("no active transaction".to_string()));
        }
        backend.abort()?;
        self.state = TxnState::Aborted;
        debug!(target: "lexstore::txn", "transaction aborted");
        Ok(())
    }

    /// Post-process an operation result inside an active transaction: a
    /// lock conflict invalidates the whole transaction, so abort it
    /// before handing the error back for retry at the caller's level.
    pub(crate) fn absorb<T>(
        &mut self,
        backend: &mut dyn Backend,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Err(e @ Error::Conflict(_)) if self.is_active() => {
                warn!(target: "lexstore::txn", error = %e, "conflict, aborting transaction");
                if let Err(abort_err) = backend.abort() {
                    warn!(
                        target: "lexstore::txn",
                        error = %abort_err,
                        "abort after conflict failed"
                    );
                }
                self.state = TxnState::Aborted;
                Err(e)
            }
            other => other,
        }
    }
}
