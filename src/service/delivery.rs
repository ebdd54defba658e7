use super::callback::TaskFailure;
use super::registry::CallbackRegistry;
use crate::core::Result;
use crate::transaction::{Transaction, TransactionParticipant, TransactionalTask};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

/// What a delivery reports to the callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(TaskFailure),
    /// The node running the task failed before delivering.
    NodeFailed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure(_) => "failure",
            Outcome::NodeFailed => "node-failed",
        }
    }
}

/// Counts deliveries whose transaction actually committed.
#[derive(Default)]
pub(crate) struct DeliveryCounter {
    delivered: AtomicU64,
}

impl DeliveryCounter {
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl TransactionParticipant for DeliveryCounter {
    fn name(&self) -> &str {
        "delivery-counter"
    }

    fn commit(&self, _txn: &Transaction) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn abort(&self, _txn: &Transaction, _retryable: bool) {}
}

/// Delivery step: resolve the record's callback, notify it, delete the
/// record. A callback target that has disappeared makes the notification a
/// no-op; the record is still deleted. Whoever runs the task reports a
/// permanent failure; the record then stays in place.
pub(crate) struct DeliveryTask {
    pub(crate) registry: Arc<CallbackRegistry>,
    pub(crate) record: String,
    pub(crate) outcome: Outcome,
    pub(crate) counter: Arc<DeliveryCounter>,
}

impl DeliveryTask {
    async fn deliver(&self, txn: &Transaction) -> Result<()> {
        match self.registry.resolve(txn, &self.record)? {
            Some(callback) => {
                match &self.outcome {
                    Outcome::Success(value) => callback.notify_result(txn, value.clone()).await?,
                    Outcome::Failure(failure) => {
                        callback.notify_failed(txn, Some(failure.clone())).await?
                    }
                    Outcome::NodeFailed => callback.notify_failed(txn, None).await?,
                }
                txn.join(self.counter.clone())?;
            }
            None => {
                event!(
                    Level::DEBUG,
                    record = %self.record,
                    "no live callback for record; skipping notification"
                );
            }
        }
        self.registry.delete(txn, &self.record)
    }
}

#[async_trait]
impl TransactionalTask for DeliveryTask {
    fn task_type(&self) -> &str {
        "callback-delivery"
    }

    async fn run(&self, txn: Transaction) -> Result<()> {
        match self.deliver(&txn).await {
            Ok(()) => {
                event!(
                    Level::DEBUG,
                    txn = %txn.id(),
                    record = %self.record,
                    outcome = self.outcome.label(),
                    "callback delivered"
                );
                Ok(())
            }
            Err(err) => {
                event!(
                    Level::DEBUG,
                    txn = %txn.id(),
                    record = %self.record,
                    retryable = err.is_retryable(),
                    error = %err,
                    "delivery attempt failed"
                );
                Err(err)
            }
        }
    }
}
