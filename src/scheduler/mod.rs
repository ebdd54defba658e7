//! Reservation-based scheduling of non-transactional work.
//!
//! A caller first reserves a slot for a task, then either uses the
//! reservation (the task becomes runnable) or cancels it (the task never
//! runs). Both terminal operations consume the reservation.

pub mod local;

pub use local::LocalTaskScheduler;

use crate::core::{Identity, Result};
use futures::future::BoxFuture;

/// Non-transactional work handed to the scheduler.
pub type KernelTask = BoxFuture<'static, ()>;

/// A provisionally accepted slot for one task.
pub trait TaskReservation: Send {
    /// Irrevocably schedules the reserved task.
    fn use_reservation(self: Box<Self>);

    /// Releases the slot; the reserved task never runs.
    fn cancel(self: Box<Self>);
}

pub trait TaskScheduler: Send + Sync {
    /// Reserves a slot for `task` on behalf of `owner`. Fails with
    /// [`TaskError::Rejected`](crate::core::TaskError::Rejected) when there
    /// is no capacity. Never blocks.
    fn reserve_task(&self, task: KernelTask, owner: &Identity)
    -> Result<Box<dyn TaskReservation>>;
}
