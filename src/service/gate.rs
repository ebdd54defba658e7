use crate::core::{Identity, Result, TaskError};
use crate::scheduler::{KernelTask, TaskReservation, TaskScheduler};
use crate::transaction::{Transaction, TransactionId, TransactionParticipant};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{Level, event};

/// Holds task reservations until the transaction that made them ends.
///
/// Reservations are kept in a side table keyed by transaction id. On commit
/// each one is used, so its task becomes runnable; on abort each one is
/// cancelled and its task never runs.
pub struct ReservationGate {
    scheduler: Arc<dyn TaskScheduler>,
    contexts: Mutex<HashMap<TransactionId, Vec<Box<dyn TaskReservation>>>>,
    self_ref: Weak<ReservationGate>,
}

impl ReservationGate {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            scheduler,
            contexts: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Reserves a slot for `task` and ties it to `txn`. A full scheduler
    /// surfaces as [`TaskError::Rejected`]; nothing is retried here.
    pub fn add_reservation(&self, txn: &Transaction, task: KernelTask, owner: &Identity) -> Result<()> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| TaskError::ExecutionError("reservation gate has been dropped".into()))?;
        txn.join(this)?;

        let reservation = self.scheduler.reserve_task(task, owner)?;
        let mut contexts = self.contexts.lock()?;
        let context = contexts.entry(txn.id()).or_default();
        context.push(reservation);
        event!(
            Level::DEBUG,
            txn = %txn.id(),
            owner = %owner,
            reserved = context.len(),
            "task reservation added"
        );
        Ok(())
    }

    /// Transactions currently holding reservations.
    pub fn open_contexts(&self) -> usize {
        match self.contexts.lock() {
            Ok(contexts) => contexts.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn take_context(&self, txn: &Transaction) -> Vec<Box<dyn TaskReservation>> {
        let mut contexts = match self.contexts.lock() {
            Ok(contexts) => contexts,
            Err(poisoned) => poisoned.into_inner(),
        };
        contexts.remove(&txn.id()).unwrap_or_default()
    }
}

impl TransactionParticipant for ReservationGate {
    fn name(&self) -> &str {
        "reservation-gate"
    }

    fn commit(&self, txn: &Transaction) {
        let reservations = self.take_context(txn);
        let count = reservations.len();
        for reservation in reservations {
            reservation.use_reservation();
        }
        event!(Level::DEBUG, txn = %txn.id(), count, "task reservations committed");
    }

    fn abort(&self, txn: &Transaction, retryable: bool) {
        let reservations = self.take_context(txn);
        let count = reservations.len();
        for reservation in reservations {
            reservation.cancel();
        }
        event!(Level::DEBUG, txn = %txn.id(), count, retryable, "task reservations cancelled");
    }
}
