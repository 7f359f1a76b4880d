//! Transactions over a [`GraphStore`](super::GraphStore).
//!
//! A transaction is an undo log. While it is open in the current thread,
//! every store mutation records what it needs to revert: the ids of created
//! nodes, a snapshot of each pre-existing node the first time it is touched
//! or removed, and every context index change. `commit` drops the log;
//! `rollback` replays it backwards.
//!
//! Transactions are thread-confined. A worker thread joins a transaction for
//! the duration of its task through [`Transaction::open_in_current_thread`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::GraphStore;
use super::context::ContextChange;
use super::node::Node;
use crate::base::{NodeId, SourceId};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE: RefCell<Vec<Transaction>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    /// Undo failed; the store must be considered corrupt.
    Invalid,
}

impl TransactionState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Invalid)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling back",
            Self::RolledBack => "rolled back",
            Self::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction is not committable")]
    NotCommittable,
    #[error("Transaction is not open (state: {0})")]
    NotOpen(TransactionState),
    #[error("Transaction is invalid: {0}")]
    Invalid(String),
}

/// What a rollback discarded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub created_nodes: Vec<NodeId>,
    pub restored_nodes: usize,
    pub compiled_sources: Vec<SourceId>,
}

// ============================================================================
// UNDO LOG
// ============================================================================

#[derive(Debug, Default)]
struct UndoLog {
    created: IndexSet<NodeId>,
    /// State of pre-existing nodes before their first mutation or removal.
    snapshots: FxHashMap<NodeId, Node>,
    context: Vec<ContextChange>,
    compiled_sources: IndexSet<SourceId>,
}

struct Inner {
    id: u64,
    store: GraphStore,
    committable: bool,
    state: Mutex<TransactionState>,
    log: Mutex<UndoLog>,
}

/// Shared handle to one transaction. Clones refer to the same log.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("committable", &self.inner.committable)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub(crate) fn new(store: GraphStore, committable: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
                store,
                committable,
                state: Mutex::new(TransactionState::Open),
                log: Mutex::new(UndoLog::default()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_committable(&self) -> bool {
        self.inner.committable
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    pub fn store(&self) -> &GraphStore {
        &self.inner.store
    }

    /// Make this transaction the innermost one of the current thread until
    /// the guard drops.
    pub fn open_in_current_thread(&self) -> Result<TransactionGuard, TransactionError> {
        let state = self.state();
        if state != TransactionState::Open {
            return Err(TransactionError::NotOpen(state));
        }
        ACTIVE.with(|stack| stack.borrow_mut().push(self.clone()));
        Ok(TransactionGuard {
            transaction: self.clone(),
        })
    }

    /// Innermost open transaction of the current thread for the given store.
    pub(crate) fn current_for(store_id: u64) -> Option<Transaction> {
        ACTIVE.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|tx| tx.inner.store.id() == store_id)
                .filter(|tx| tx.is_open())
                .cloned()
        })
    }

    /// Innermost transaction of the current thread, whatever its store.
    pub fn current() -> Option<Transaction> {
        ACTIVE.with(|stack| stack.borrow().last().cloned())
    }

    /// Remember that `source` was compiled inside this transaction.
    pub fn note_source_compiled(&self, source: SourceId) {
        self.inner.log.lock().compiled_sources.insert(source);
    }

    pub fn compiled_sources(&self) -> Vec<SourceId> {
        self.inner.log.lock().compiled_sources.iter().cloned().collect()
    }

    pub fn created_nodes(&self) -> Vec<NodeId> {
        self.inner.log.lock().created.iter().copied().collect()
    }

    // ------------------------------------------------------------------------
    // recording (called by the store)
    // ------------------------------------------------------------------------

    pub(crate) fn record_created(&self, id: NodeId) {
        self.inner.log.lock().created.insert(id);
    }

    /// Snapshot `node` unless it was created in, or already touched by, this transaction.
    pub(crate) fn record_touched(&self, node: &Node) {
        let mut log = self.inner.log.lock();
        if log.created.contains(&node.id) || log.snapshots.contains_key(&node.id) {
            return;
        }
        log.snapshots.insert(node.id, node.clone());
    }

    pub(crate) fn record_context(&self, change: ContextChange) {
        self.inner.log.lock().context.push(change);
    }

    // ------------------------------------------------------------------------
    // completion
    // ------------------------------------------------------------------------

    fn transition(&self, from: TransactionState, to: TransactionState) -> Result<(), TransactionError> {
        let mut state = self.inner.state.lock();
        if *state != from {
            return Err(TransactionError::NotOpen(*state));
        }
        *state = to;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), TransactionError> {
        if !self.inner.committable {
            return Err(TransactionError::NotCommittable);
        }
        self.transition(TransactionState::Open, TransactionState::Committing)?;
        let log = std::mem::take(&mut *self.inner.log.lock());
        tracing::debug!(
            transaction = self.inner.id,
            created = log.created.len(),
            touched = log.snapshots.len(),
            "committed transaction"
        );
        *self.inner.state.lock() = TransactionState::Committed;
        Ok(())
    }

    /// Revert every recorded change.
    pub fn rollback(&self) -> Result<RollbackReport, TransactionError> {
        self.transition(TransactionState::Open, TransactionState::RollingBack)?;
        let log = std::mem::take(&mut *self.inner.log.lock());

        let report = RollbackReport {
            created_nodes: log.created.iter().copied().collect(),
            restored_nodes: log.snapshots.len(),
            compiled_sources: log.compiled_sources.iter().cloned().collect(),
        };

        match self.inner.store.undo(log.created, log.snapshots, log.context) {
            Ok(()) => {
                *self.inner.state.lock() = TransactionState::RolledBack;
                tracing::debug!(
                    transaction = self.inner.id,
                    created = report.created_nodes.len(),
                    restored = report.restored_nodes,
                    "rolled back transaction"
                );
                Ok(report)
            }
            Err(message) => {
                *self.inner.state.lock() = TransactionState::Invalid;
                Err(TransactionError::Invalid(message))
            }
        }
    }
}

// ============================================================================
// THREAD GUARD
// ============================================================================

/// Keeps a transaction open in the current thread while alive.
#[must_use = "the transaction is closed in this thread when the guard drops"]
pub struct TransactionGuard {
    transaction: Transaction,
}

impl TransactionGuard {
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|tx| *tx == self.transaction) {
                stack.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;

    #[test]
    fn test_state_machine() {
        let store = GraphStore::new();
        let tx = store.new_transaction(true);
        assert_eq!(tx.state(), TransactionState::Open);
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(tx.commit(), Err(TransactionError::NotOpen(TransactionState::Committed)));
        assert!(tx.rollback().is_err());
        assert!(tx.open_in_current_thread().is_err());
    }

    #[test]
    fn test_not_committable() {
        let store = GraphStore::new();
        let tx = store.new_transaction(false);
        let err = tx.commit().unwrap_err();
        assert_eq!(err.to_string(), "Transaction is not committable");
        assert!(tx.rollback().is_ok());
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[test]
    fn test_guard_is_thread_confined() {
        let store = GraphStore::new();
        let tx = store.new_transaction(true);
        {
            let _guard = tx.open_in_current_thread().unwrap();
            assert_eq!(Transaction::current_for(store.id()), Some(tx.clone()));
            let other = std::thread::spawn({
                let id = store.id();
                move || Transaction::current_for(id).is_none()
            })
            .join()
            .unwrap();
            assert!(other);
        }
        assert!(Transaction::current_for(store.id()).is_none());
    }

    #[test]
    fn test_rollback_reports_created_nodes_and_sources() {
        let store = GraphStore::new();
        let before = store.node_count();
        let tx = store.new_transaction(true);
        let id = {
            let _guard = tx.open_in_current_thread().unwrap();
            tx.note_source_compiled(SourceId::new("/m/a.pure"));
            store.create_packaged_element("a", "X", NodeKind::Class, None).unwrap()
        };
        let report = tx.rollback().unwrap();
        assert!(report.created_nodes.contains(&id));
        assert_eq!(report.compiled_sources, vec![SourceId::new("/m/a.pure")]);
        assert_eq!(store.node_count(), before);
        assert_eq!(store.find_by_path("a::X"), None);
        assert_eq!(store.find_by_path("a"), None);
    }
}
