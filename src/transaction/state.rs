// ============================================================================
// Transaction State Management
// ============================================================================
//
// A transaction is a cheap clonable handle. Components that need to act on
// commit or abort join it as participants; the manager drives their hooks.
//
// ============================================================================

use crate::core::{Identity, Result, TaskError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state
///
/// State transitions:
/// ```text
/// Active ──commit──> Preparing ──> Committed
///   │                    │
///   └──abort──> Aborted <┘ (veto)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can execute operations
    Active,

    /// Commit has started; no new participants may join
    Preparing,

    /// Transaction has been successfully committed
    Committed,

    /// Transaction has been aborted
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Preparing => write!(f, "PREPARING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Hooks invoked by the transaction manager at the end of a transaction.
///
/// A durable participant is driven last, with a single
/// [`prepare_and_commit`](TransactionParticipant::prepare_and_commit) call, so
/// that its validation and its writes happen atomically. At most one durable
/// participant may join a transaction.
pub trait TransactionParticipant: Send + Sync {
    fn name(&self) -> &str;

    fn is_durable(&self) -> bool {
        false
    }

    /// Vote on the outcome. Returning an error aborts the transaction.
    fn prepare(&self, _txn: &Transaction) -> Result<()> {
        Ok(())
    }

    fn prepare_and_commit(&self, txn: &Transaction) -> Result<()> {
        self.prepare(txn)?;
        self.commit(txn);
        Ok(())
    }

    fn commit(&self, txn: &Transaction);

    fn abort(&self, txn: &Transaction, retryable: bool);
}

struct TransactionInner {
    id: TransactionId,
    owner: Identity,
    state: Mutex<TransactionState>,
    participants: Mutex<Vec<Arc<dyn TransactionParticipant>>>,
    start_time: Instant,
}

/// Handle to one running transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(owner: Identity) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: TransactionId::new(),
                owner,
                state: Mutex::new(TransactionState::Active),
                participants: Mutex::new(Vec::new()),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Identity the transaction runs on behalf of.
    pub fn owner(&self) -> &Identity {
        &self.inner.owner
    }

    pub fn state(&self) -> TransactionState {
        match self.inner.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn duration(&self) -> Duration {
        self.inner.start_time.elapsed()
    }

    /// Registers a participant. Joining twice with the same participant is a no-op.
    pub fn join(&self, participant: Arc<dyn TransactionParticipant>) -> Result<()> {
        if !self.is_active() {
            return Err(TaskError::TransactionNotActive(self.id().to_string()));
        }
        let mut participants = self.inner.participants.lock()?;
        let ptr = Arc::as_ptr(&participant) as *const ();
        if participants
            .iter()
            .any(|existing| Arc::as_ptr(existing) as *const () == ptr)
        {
            return Ok(());
        }
        if participant.is_durable() && participants.iter().any(|p| p.is_durable()) {
            return Err(TaskError::ExecutionError(format!(
                "Transaction {} already has a durable participant; '{}' cannot join",
                self.id(),
                participant.name()
            )));
        }
        participants.push(participant);
        Ok(())
    }

    pub(crate) fn participants(&self) -> Result<Vec<Arc<dyn TransactionParticipant>>> {
        Ok(self.inner.participants.lock()?.clone())
    }

    /// Moves to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: TransactionState) -> Result<TransactionState> {
        let mut state = self.inner.state.lock()?;
        let previous = *state;
        *state = next;
        Ok(previous)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("state", &self.state())
            .finish()
    }
}
