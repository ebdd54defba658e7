use super::{KernelTask, TaskReservation, TaskScheduler};
use crate::core::{Identity, Result, TaskError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{Level, event};
use uuid::Uuid;

struct SchedulerInner {
    capacity: Arc<Semaphore>,
    max_outstanding: usize,
    running: AtomicUsize,
    started: AtomicU64,
    cancelled: AtomicU64,
}

/// Bounded task scheduler backed by the tokio runtime.
///
/// Capacity covers both reserved and running tasks, so a slot is held from
/// `reserve_task` until the task finishes or its reservation is cancelled.
#[derive(Clone)]
pub struct LocalTaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl LocalTaskScheduler {
    pub fn new(max_outstanding: usize) -> Self {
        let max_outstanding = max_outstanding.max(1);
        Self {
            inner: Arc::new(SchedulerInner {
                capacity: Arc::new(Semaphore::new(max_outstanding)),
                max_outstanding,
                running: AtomicUsize::new(0),
                started: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    /// Reserved plus running tasks.
    pub fn outstanding(&self) -> usize {
        self.inner.max_outstanding - self.inner.capacity.available_permits()
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> u64 {
        self.inner.started.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.inner.cancelled.load(Ordering::Relaxed)
    }
}

impl TaskScheduler for LocalTaskScheduler {
    fn reserve_task(
        &self,
        task: KernelTask,
        owner: &Identity,
    ) -> Result<Box<dyn TaskReservation>> {
        let handle = Handle::try_current()
            .map_err(|_| TaskError::Rejected("no runtime available for task bodies".into()))?;
        let permit = self.inner.capacity.clone().try_acquire_owned().map_err(|_| {
            TaskError::Rejected(format!(
                "task scheduler is at capacity ({} outstanding)",
                self.inner.max_outstanding
            ))
        })?;

        let reservation = LocalReservation {
            id: Uuid::new_v4(),
            owner: owner.clone(),
            task: Some(task),
            permit: Some(permit),
            handle,
            inner: self.inner.clone(),
        };
        event!(Level::TRACE, reservation = %reservation.id, owner = %owner, "task slot reserved");
        Ok(Box::new(reservation))
    }
}

struct LocalReservation {
    id: Uuid,
    owner: Identity,
    task: Option<KernelTask>,
    permit: Option<OwnedSemaphorePermit>,
    handle: Handle,
    inner: Arc<SchedulerInner>,
}

impl TaskReservation for LocalReservation {
    fn use_reservation(mut self: Box<Self>) {
        let (Some(task), Some(permit)) = (self.task.take(), self.permit.take()) else {
            return;
        };
        let inner = self.inner.clone();
        inner.started.fetch_add(1, Ordering::Relaxed);
        event!(Level::TRACE, reservation = %self.id, owner = %self.owner, "task reservation used");
        self.handle.spawn(async move {
            let _running = RunningGuard::enter(inner);
            task.await;
            drop(permit);
        });
    }

    fn cancel(mut self: Box<Self>) {
        self.task.take();
        self.permit.take();
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
        event!(Level::TRACE, reservation = %self.id, owner = %self.owner, "task reservation cancelled");
    }
}

impl Drop for LocalReservation {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
            event!(
                Level::WARN,
                reservation = %self.id,
                owner = %self.owner,
                "task reservation dropped without being used or cancelled"
            );
        }
    }
}

struct RunningGuard {
    inner: Arc<SchedulerInner>,
}

impl RunningGuard {
    fn enter(inner: Arc<SchedulerInner>) -> Self {
        inner.running.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}
