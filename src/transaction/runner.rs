// ============================================================================
// Transactional work: runner handle and scheduler
// ============================================================================

use super::{Transaction, TransactionManager};
use crate::config::RetryPolicy;
use crate::core::{Identity, Result, TaskError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::time::{Duration, sleep};
use tracing::{Instrument, Level, event, info_span};

/// A unit of work that runs inside one transaction.
///
/// The work may be re-run from scratch when its transaction hits a
/// transient conflict, so it must not keep state between attempts.
#[async_trait]
pub trait TransactionalTask: Send + Sync {
    fn task_type(&self) -> &str {
        "transactional-task"
    }

    async fn run(&self, txn: Transaction) -> Result<()>;
}

#[async_trait]
impl<F, Fut> TransactionalTask for F
where
    F: Fn(Transaction) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, txn: Transaction) -> Result<()> {
        (self)(txn).await
    }
}

/// Handle that lets non-transactional code open transactions at will.
#[async_trait]
pub trait TransactionRunner: Send + Sync {
    /// Runs `task` to completion in a new transaction. Transient failures are
    /// retried internally; an error is a permanent failure.
    async fn run_transaction(&self, task: Arc<dyn TransactionalTask>) -> Result<()>;
}

/// Runs transactional work on the transactional worker pool.
#[async_trait]
pub trait TransactionScheduler: Send + Sync {
    /// Runs `task` in a transaction owned by `owner` and waits for it.
    async fn run_task(&self, task: Arc<dyn TransactionalTask>, owner: &Identity) -> Result<()>;

    /// Queues `task` to run in its own transaction. Fails with
    /// [`TaskError::Rejected`] if the pool has no capacity.
    fn schedule_task(&self, task: Arc<dyn TransactionalTask>, owner: &Identity) -> Result<()> {
        self.schedule_task_with_completion(task, owner, Box::new(|_| {}))
    }

    /// Like [`schedule_task`](TransactionScheduler::schedule_task), and
    /// calls `on_done` with the final result once retries are exhausted.
    /// `on_done` is never called when scheduling itself is rejected.
    fn schedule_task_with_completion(
        &self,
        task: Arc<dyn TransactionalTask>,
        owner: &Identity,
        on_done: TaskCompletion,
    ) -> Result<()>;
}

/// Receives the final result of a scheduled transaction.
pub type TaskCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// [`TransactionRunner`] that runs every transaction as one fixed identity.
#[derive(Clone)]
pub struct OwnedTransactionRunner {
    scheduler: Arc<dyn TransactionScheduler>,
    owner: Identity,
}

impl OwnedTransactionRunner {
    pub fn new(scheduler: Arc<dyn TransactionScheduler>, owner: Identity) -> Self {
        Self { scheduler, owner }
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }
}

#[async_trait]
impl TransactionRunner for OwnedTransactionRunner {
    async fn run_transaction(&self, task: Arc<dyn TransactionalTask>) -> Result<()> {
        self.scheduler.run_task(task, &self.owner).await
    }
}

struct SchedulerInner {
    manager: Arc<TransactionManager>,
    retry: RetryPolicy,
    inflight: Arc<Semaphore>,
    max_inflight: usize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Tokio-backed transaction scheduler with bounded admission and conflict retry.
#[derive(Clone)]
pub struct LocalTransactionScheduler {
    inner: Arc<SchedulerInner>,
}

impl LocalTransactionScheduler {
    pub fn new(manager: Arc<TransactionManager>, retry: RetryPolicy, max_inflight: usize) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                manager,
                retry,
                inflight: Arc::new(Semaphore::new(max_inflight)),
                max_inflight,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.inner.manager
    }

    /// Scheduled transactions not yet finished.
    pub fn inflight(&self) -> usize {
        self.inner.max_inflight - self.inner.inflight.available_permits()
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    async fn run_with_retry(
        inner: &SchedulerInner,
        task: &Arc<dyn TransactionalTask>,
        owner: &Identity,
    ) -> Result<()> {
        let max_attempts = inner.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let txn = inner.manager.begin(owner.clone()).await;
            let span = info_span!(
                "txn.run",
                txn = %txn.id(),
                owner = %owner,
                task = task.task_type(),
                attempt
            );
            let outcome = async {
                match task.run(txn.clone()).await {
                    Ok(()) => inner.manager.commit(&txn).await,
                    Err(err) => {
                        inner.manager.abort(&txn, err.is_retryable()).await?;
                        Err(err)
                    }
                }
            }
            .instrument(span)
            .await;

            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = inner.retry.backoff_ms(attempt);
                    event!(
                        Level::DEBUG,
                        task = task.task_type(),
                        attempt,
                        backoff_ms = backoff,
                        error = %err,
                        "transaction conflict, retrying"
                    );
                    sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl TransactionScheduler for LocalTransactionScheduler {
    async fn run_task(&self, task: Arc<dyn TransactionalTask>, owner: &Identity) -> Result<()> {
        Self::run_with_retry(&self.inner, &task, owner).await
    }

    fn schedule_task_with_completion(
        &self,
        task: Arc<dyn TransactionalTask>,
        owner: &Identity,
        on_done: TaskCompletion,
    ) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            TaskError::Rejected("no runtime available for transactional work".into())
        })?;
        let permit = self.inner.inflight.clone().try_acquire_owned().map_err(|_| {
            TaskError::Rejected(format!(
                "transaction scheduler is at capacity ({} in flight)",
                self.inner.max_inflight
            ))
        })?;

        let inner = self.inner.clone();
        let owner = owner.clone();
        handle.spawn(async move {
            let _permit = permit;
            let result = Self::run_with_retry(&inner, &task, &owner).await;
            match &result {
                Ok(()) => {
                    inner.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    event!(
                        Level::ERROR,
                        task = task.task_type(),
                        owner = %owner,
                        error = %err,
                        "scheduled transaction failed permanently"
                    );
                }
            }
            on_done(result);
        });
        Ok(())
    }
}
