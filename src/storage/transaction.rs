// ============================================================================
// Backing-Store Transactions
// ============================================================================
//
// State transitions:
//
//   NotStarted ──begin──> Active ──commit──> Committed
//                           │
//                           └──abort──> Aborted   (rollback-capable stores only)
//
// Commit and abort must run on the thread that called `begin`; embedded
// stores are not safe to commit from any other thread.
//
// ============================================================================

use super::engine::StoreEngine;
use crate::core::{GraphError, Result};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceTransactionState {
    NotStarted,
    Active,
    Committed,
    Aborted,
}

impl PersistenceTransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PersistenceTransactionState::Committed | PersistenceTransactionState::Aborted
        )
    }
}

impl fmt::Display for PersistenceTransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceTransactionState::NotStarted => write!(f, "NOT_STARTED"),
            PersistenceTransactionState::Active => write!(f, "ACTIVE"),
            PersistenceTransactionState::Committed => write!(f, "COMMITTED"),
            PersistenceTransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Called once with the terminal state.
pub type TransactionListener = Box<dyn FnOnce(PersistenceTransactionState) + Send>;

pub struct PersistenceTransaction {
    engine: Arc<dyn StoreEngine>,
    state: PersistenceTransactionState,
    owner: Option<ThreadId>,
    listeners: Vec<TransactionListener>,
}

impl PersistenceTransaction {
    pub fn new(engine: Arc<dyn StoreEngine>) -> Self {
        Self {
            engine,
            state: PersistenceTransactionState::NotStarted,
            owner: None,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> PersistenceTransactionState {
        self.state
    }

    /// Capture the calling thread and open the store transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != PersistenceTransactionState::NotStarted {
            return Err(GraphError::IllegalState(format!(
                "Cannot begin: transaction is already {}",
                self.state
            )));
        }
        self.engine.begin()?;
        self.owner = Some(thread::current().id());
        self.state = PersistenceTransactionState::Active;
        Ok(())
    }

    fn check_owner(&self, action: &str) -> Result<()> {
        if self.state != PersistenceTransactionState::Active {
            return Err(GraphError::IllegalState(format!(
                "Cannot {}: transaction is {}",
                action, self.state
            )));
        }
        let current = thread::current().id();
        if self.owner != Some(current) {
            return Err(GraphError::IllegalState(format!(
                "Begin and {} threads don't match: began on {:?}, {} on {:?}",
                action, self.owner, action, current
            )));
        }
        Ok(())
    }

    /// # Errors
    /// `IllegalState` when not active or when called from a thread other
    /// than the one that began the transaction; the transaction stays active.
    pub fn commit(&mut self) -> Result<()> {
        self.check_owner("commit")?;
        self.engine.commit()?;
        self.finish(PersistenceTransactionState::Committed);
        Ok(())
    }

    /// # Errors
    /// `UnsupportedOperation` when the store cannot roll back.
    pub fn abort(&mut self) -> Result<()> {
        if !self.engine.supports_rollback() {
            return Err(GraphError::UnsupportedOperation(
                "abort is not supported by this backing store".to_string(),
            ));
        }
        self.check_owner("abort")?;
        self.engine.abort()?;
        self.finish(PersistenceTransactionState::Aborted);
        Ok(())
    }

    pub fn add_listener(&mut self, listener: TransactionListener) {
        self.listeners.push(listener);
    }

    fn finish(&mut self, state: PersistenceTransactionState) {
        self.state = state;
        for listener in self.listeners.drain(..) {
            listener(state);
        }
    }
}

impl fmt::Debug for PersistenceTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceTransaction")
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Drop for PersistenceTransaction {
    fn drop(&mut self) {
        if self.state == PersistenceTransactionState::Active {
            log::warn!(
                "persistence transaction dropped while active (began on {:?})",
                self.owner
            );
        }
    }
}

/// Hands out store transactions already begun on the calling thread.
#[derive(Clone)]
pub struct PersistenceTransactionProvider {
    engine: Arc<dyn StoreEngine>,
}

impl PersistenceTransactionProvider {
    pub fn new(engine: Arc<dyn StoreEngine>) -> Self {
        Self { engine }
    }

    pub fn new_transaction(&self) -> Result<PersistenceTransaction> {
        let mut txn = PersistenceTransaction::new(Arc::clone(&self.engine));
        txn.begin()?;
        Ok(txn)
    }
}
