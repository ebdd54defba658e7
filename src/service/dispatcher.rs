// ============================================================================
// Async Task Dispatcher
// ============================================================================
//
// Task bodies run outside any transaction. A body is only released to the
// task scheduler once the transaction that started it commits. When a
// callback is attached, a pending record is written in that same
// transaction and the outcome is delivered by a later delivery transaction.
//
// ============================================================================

use super::callback::{AsyncCallable, AsyncRunnable, CallbackCatalog, TaskFailure};
use super::delivery::{DeliveryCounter, DeliveryTask, Outcome};
use super::failure::{CountingFailureHook, FailureHook, LoggingFailureHook, UnresolvedFailure};
use super::gate::ReservationGate;
use super::registry::{CallbackRegistry, CallbackTarget};
use crate::core::{Identity, NodeId, Result, TaskError};
use crate::scheduler::TaskScheduler;
use crate::storage::DataStore;
use crate::transaction::{
    OwnedTransactionRunner, TaskCompletion, Transaction, TransactionRunner, TransactionScheduler,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

/// Collaborators of one node's task service.
pub struct ServiceComponents {
    pub node_id: NodeId,
    pub namespace_root: String,
    pub task_scheduler: Arc<dyn TaskScheduler>,
    pub transaction_scheduler: Arc<dyn TransactionScheduler>,
    pub store: Arc<dyn DataStore>,
    pub catalog: Arc<CallbackCatalog>,
    pub failure_hook: Arc<dyn FailureHook>,
}

impl ServiceComponents {
    pub fn new(
        node_id: NodeId,
        task_scheduler: Arc<dyn TaskScheduler>,
        transaction_scheduler: Arc<dyn TransactionScheduler>,
        store: Arc<dyn DataStore>,
        catalog: Arc<CallbackCatalog>,
    ) -> Self {
        Self {
            node_id,
            namespace_root: crate::config::DEFAULT_NAMESPACE_ROOT.to_string(),
            task_scheduler,
            transaction_scheduler,
            store,
            catalog,
            failure_hook: Arc::new(LoggingFailureHook),
        }
    }

    pub fn namespace_root(mut self, root: impl Into<String>) -> Self {
        self.namespace_root = root.into();
        self
    }

    pub fn failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.failure_hook = hook;
        self
    }
}

/// Point-in-time service counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncTaskStats {
    pub tasks_submitted: u64,
    pub callbacks_registered: u64,
    pub callbacks_delivered: u64,
    pub unresolved_failures: u64,
    pub records_recovered: u64,
}

#[derive(Default)]
struct ServiceCounters {
    tasks_submitted: AtomicU64,
    callbacks_registered: AtomicU64,
    records_recovered: AtomicU64,
}

pub(crate) struct ServiceInner {
    pub(crate) node_id: NodeId,
    pub(crate) gate: Arc<ReservationGate>,
    pub(crate) registry: Arc<CallbackRegistry>,
    pub(crate) transaction_scheduler: Arc<dyn TransactionScheduler>,
    failure_hook: Arc<CountingFailureHook>,
    delivery_counter: Arc<DeliveryCounter>,
    counters: ServiceCounters,
    shut_down: AtomicBool,
}

impl ServiceInner {
    pub(crate) fn report(&self, failure: UnresolvedFailure) {
        self.failure_hook.report(&failure);
    }

    pub(crate) fn note_recovered(&self, count: usize) {
        self.counters
            .records_recovered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn delivery_task(&self, record: String, outcome: Outcome) -> Arc<DeliveryTask> {
        Arc::new(DeliveryTask {
            registry: self.registry.clone(),
            record,
            outcome,
            counter: self.delivery_counter.clone(),
        })
    }

    /// Schedules the delivery transaction for `record`, running as `owner`.
    /// A rejection, or a delivery that fails for good, is final: the record
    /// is left for an operator.
    pub(crate) fn schedule_delivery(&self, record: String, owner: &Identity, outcome: Outcome) {
        let label = outcome.label();
        let task = self.delivery_task(record.clone(), outcome);
        let hook = self.failure_hook.clone();
        let failed_record = record.clone();
        let on_done: TaskCompletion = Box::new(move |result: Result<()>| {
            if let Err(error) = result {
                hook.report(&UnresolvedFailure::DeliveryFailed {
                    record: failed_record,
                    error,
                });
            }
        });
        match self
            .transaction_scheduler
            .schedule_task_with_completion(task, owner, on_done)
        {
            Ok(()) => {
                event!(Level::DEBUG, record = %record, owner = %owner, outcome = label, "delivery scheduled");
            }
            Err(error) => {
                event!(Level::WARN, record = %record, error = %error, "delivery rejected");
                self.report(UnresolvedFailure::DeliveryRejected { record, error });
            }
        }
    }

    fn runner_for(&self, owner: &Identity) -> Arc<dyn TransactionRunner> {
        Arc::new(OwnedTransactionRunner::new(
            self.transaction_scheduler.clone(),
            owner.clone(),
        ))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TaskError::ShutDown);
        }
        Ok(())
    }
}

/// Starts task bodies outside transactions and delivers their outcomes.
#[derive(Clone)]
pub struct AsyncTaskService {
    pub(crate) inner: Arc<ServiceInner>,
}

impl AsyncTaskService {
    pub fn new(components: ServiceComponents) -> Self {
        let registry = Arc::new(CallbackRegistry::new(
            components.store,
            components.catalog,
            components.namespace_root,
            components.node_id.clone(),
        ));
        Self {
            inner: Arc::new(ServiceInner {
                node_id: components.node_id,
                gate: ReservationGate::new(components.task_scheduler),
                registry,
                transaction_scheduler: components.transaction_scheduler,
                failure_hook: Arc::new(CountingFailureHook::new(components.failure_hook)),
                delivery_counter: Arc::new(DeliveryCounter::default()),
                counters: ServiceCounters::default(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Builds the service, continues record numbering after whatever the
    /// local namespace already holds, and fails the records a previous run
    /// of this node left behind.
    pub async fn open(components: ServiceComponents, owner: &Identity) -> Result<Self> {
        let service = Self::new(components);
        service.seed_sequence(owner).await?;
        service.fail_orphaned_records(owner).await?;
        Ok(service)
    }

    pub async fn seed_sequence(&self, owner: &Identity) -> Result<u64> {
        let registry = self.inner.registry.clone();
        let next = Arc::new(AtomicU64::new(0));
        let seen = next.clone();
        let task = move |txn: Transaction| {
            let registry = registry.clone();
            let seen = seen.clone();
            async move {
                seen.store(registry.seed_sequence(&txn)?, Ordering::SeqCst);
                Ok::<(), TaskError>(())
            }
        };
        self.inner
            .transaction_scheduler
            .run_task(Arc::new(task), owner)
            .await?;
        let next = next.load(Ordering::SeqCst);
        event!(Level::INFO, node = %self.inner.node_id, next_sequence = next, "callback sequence seeded");
        Ok(next)
    }

    /// Delivers a node failure for every record in the local namespace.
    ///
    /// Only meaningful before the service starts any task: at that point
    /// every local record belongs to a body that died with an earlier run of
    /// this node. Deliveries run one at a time and are awaited. Returns the
    /// number of records found.
    pub async fn fail_orphaned_records(&self, owner: &Identity) -> Result<usize> {
        let registry = self.inner.registry.clone();
        let local = self.inner.node_id.clone();
        let found = Arc::new(Mutex::new(Vec::new()));
        let collected = found.clone();
        let scan = move |txn: Transaction| {
            let registry = registry.clone();
            let local = local.clone();
            let collected = collected.clone();
            async move {
                let mut orphans = Vec::new();
                let names = registry
                    .list_namespace(&txn, &local)
                    .collect::<Result<Vec<String>>>()?;
                for name in names {
                    match registry.load(&txn, &name) {
                        Ok(Some(record)) => orphans.push((name, Ok(record.owner))),
                        Ok(None) => {}
                        Err(error @ TaskError::Serialization(_)) => orphans.push((name, Err(error))),
                        Err(error) => return Err(error),
                    }
                }
                *collected.lock()? = orphans;
                Ok::<(), TaskError>(())
            }
        };
        self.inner
            .transaction_scheduler
            .run_task(Arc::new(scan), owner)
            .await?;
        let orphans = std::mem::take(&mut *found.lock()?);
        if orphans.is_empty() {
            return Ok(0);
        }

        let count = orphans.len();
        event!(Level::INFO, node = %self.inner.node_id, records = count, "failing records of a previous run");
        for (record, record_owner) in orphans {
            let record_owner = match record_owner {
                Ok(record_owner) => record_owner,
                Err(error) => {
                    self.inner
                        .report(UnresolvedFailure::DeliveryFailed { record, error });
                    continue;
                }
            };
            let task = self.inner.delivery_task(record.clone(), Outcome::NodeFailed);
            if let Err(error) = self
                .inner
                .transaction_scheduler
                .run_task(task, &record_owner)
                .await
            {
                self.inner
                    .report(UnresolvedFailure::DeliveryFailed { record, error });
            }
        }
        self.inner.note_recovered(count);
        Ok(count)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.inner.registry
    }

    pub fn gate(&self) -> &Arc<ReservationGate> {
        &self.inner.gate
    }

    /// Starts `body` once `txn` commits. Its outcome is not recorded.
    pub fn start_task<R>(&self, txn: &Transaction, body: R) -> Result<()>
    where
        R: AsyncRunnable + 'static,
    {
        self.start_shared_task(txn, Arc::new(body))
    }

    pub fn start_shared_task(&self, txn: &Transaction, body: Arc<dyn AsyncRunnable>) -> Result<()> {
        self.inner.ensure_running()?;
        let owner = txn.owner().clone();
        let runner = self.inner.runner_for(&owner);
        let task_owner = owner.clone();
        let task = async move {
            event!(Level::DEBUG, owner = %task_owner, "task body started");
            match AssertUnwindSafe(body.run(runner)).catch_unwind().await {
                Ok(Ok(())) => {
                    event!(Level::DEBUG, owner = %task_owner, "task body finished");
                }
                Ok(Err(failure)) => {
                    event!(Level::DEBUG, owner = %task_owner, failure = %failure, "task body failed");
                }
                Err(panic) => {
                    let failure = TaskFailure::from_panic(panic);
                    event!(Level::WARN, owner = %task_owner, failure = %failure, "task body panicked");
                }
            }
        }
        .boxed();

        self.inner.gate.add_reservation(txn, task, &owner)?;
        self.inner
            .counters
            .tasks_submitted
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Starts `body` once `txn` commits and delivers its outcome to
    /// `callback` in a new transaction. Returns the pending record name.
    pub fn start_task_with_callback<C>(
        &self,
        txn: &Transaction,
        body: C,
        callback: CallbackTarget,
    ) -> Result<String>
    where
        C: AsyncCallable + 'static,
    {
        self.inner.ensure_running()?;
        let owner = txn.owner().clone();
        let record = self.inner.registry.create(txn, callback, &owner)?;

        let inner = self.inner.clone();
        let runner = self.inner.runner_for(&owner);
        let task_record = record.clone();
        let task_owner = owner.clone();
        let task = async move {
            event!(Level::DEBUG, record = %task_record, owner = %task_owner, "task body started");
            let outcome = match AssertUnwindSafe(body.call(runner)).catch_unwind().await {
                Ok(Ok(output)) => match serde_json::to_value(&output) {
                    Ok(value) => Outcome::Success(value),
                    Err(e) => Outcome::Failure(TaskFailure::new(format!(
                        "task result could not be serialized: {}",
                        e
                    ))),
                },
                Ok(Err(failure)) => Outcome::Failure(failure),
                Err(panic) => Outcome::Failure(TaskFailure::from_panic(panic)),
            };
            event!(
                Level::DEBUG,
                record = %task_record,
                outcome = outcome.label(),
                "task body finished"
            );
            inner.schedule_delivery(task_record, &task_owner, outcome);
        }
        .boxed();

        if let Err(err) = self.inner.gate.add_reservation(txn, task, &owner) {
            // Drop the record too, in case the caller commits anyway.
            self.inner.registry.delete(txn, &record)?;
            return Err(err);
        }
        self.inner
            .counters
            .tasks_submitted
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .counters
            .callbacks_registered
            .fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    /// Refuses new tasks. Bodies and deliveries already under way continue.
    pub fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            event!(Level::INFO, node = %self.inner.node_id, "async task service shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AsyncTaskStats {
        let counters = &self.inner.counters;
        AsyncTaskStats {
            tasks_submitted: counters.tasks_submitted.load(Ordering::Relaxed),
            callbacks_registered: counters.callbacks_registered.load(Ordering::Relaxed),
            callbacks_delivered: self.inner.delivery_counter.delivered(),
            unresolved_failures: self.inner.failure_hook.reported(),
            records_recovered: counters.records_recovered.load(Ordering::Relaxed),
        }
    }
}
