// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Transaction, TransactionId, TransactionParticipant, TransactionState};
use crate::core::{Identity, Result, TaskError};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{Level, event};

pub struct TransactionManager {
    // Active transactions only; entries are removed when they end.
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub async fn begin(&self, owner: Identity) -> Transaction {
        let transaction = Transaction::new(owner);
        let mut transactions = self.transactions.write().await;
        transactions.insert(transaction.id(), transaction.clone());
        event!(Level::TRACE, txn = %transaction.id(), owner = %transaction.owner(), "transaction begun");
        transaction
    }

    /// Commits `txn`, driving every joined participant.
    ///
    /// Ordinary participants are prepared first, then the durable participant
    /// (if any) prepares and commits in one step, then ordinary participants
    /// commit. A veto at any point aborts every participant.
    pub async fn commit(&self, txn: &Transaction) -> Result<()> {
        let previous = txn.transition(TransactionState::Preparing)?;
        if previous != TransactionState::Active {
            txn.transition(previous)?;
            return Err(TaskError::TransactionNotActive(txn.id().to_string()));
        }

        let participants = txn.participants()?;
        let (durable, ordinary): (Vec<_>, Vec<_>) =
            participants.iter().cloned().partition(|p| p.is_durable());

        let mut veto = None;
        for participant in &ordinary {
            if let Err(err) = participant.prepare(txn) {
                veto = Some(err);
                break;
            }
        }
        if veto.is_none() {
            for participant in &durable {
                if let Err(err) = participant.prepare_and_commit(txn) {
                    veto = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = veto {
            event!(Level::DEBUG, txn = %txn.id(), error = %err, "transaction vetoed during prepare");
            self.finish_abort(txn, &participants, err.is_retryable()).await?;
            return Err(err);
        }

        for participant in &ordinary {
            participant.commit(txn);
        }
        txn.transition(TransactionState::Committed)?;
        self.transactions.write().await.remove(&txn.id());
        self.committed.fetch_add(1, Ordering::Relaxed);
        event!(Level::TRACE, txn = %txn.id(), "transaction committed");
        Ok(())
    }

    /// Aborts `txn`. Aborting a transaction that already ended is a no-op.
    pub async fn abort(&self, txn: &Transaction, retryable: bool) -> Result<()> {
        if txn.state().is_terminal() {
            return Ok(());
        }
        let participants = txn.participants()?;
        self.finish_abort(txn, &participants, retryable).await
    }

    async fn finish_abort(
        &self,
        txn: &Transaction,
        participants: &[Arc<dyn TransactionParticipant>],
        retryable: bool,
    ) -> Result<()> {
        txn.transition(TransactionState::Aborted)?;
        for participant in participants {
            participant.abort(txn, retryable);
        }
        self.transactions.write().await.remove(&txn.id());
        self.aborted.fetch_add(1, Ordering::Relaxed);
        event!(Level::TRACE, txn = %txn.id(), retryable, "transaction aborted");
        Ok(())
    }

    pub async fn is_active(&self, txn_id: TransactionId) -> bool {
        self.transactions.read().await.contains_key(&txn_id)
    }

    pub async fn active_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionStats {
    pub committed: u64,
    pub aborted: u64,
}
