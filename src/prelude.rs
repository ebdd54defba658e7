//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` covers application code that starts tasks and receives callbacks.
//! `advanced` exposes the collaborator seams for custom wiring.

pub mod dx {
    //! Everyday surface: a wired node, task bodies, and callbacks.
    pub use crate::{
        AsyncCallable, AsyncRunnable, AsyncTaskConfig, CallbackCatalog, CallbackSpec,
        CallbackTarget, Identity, TaskCallback, TaskError, TaskFailure, TaskKernel, Transaction,
        TransactionRunner,
    };
}

pub mod advanced {
    //! Collaborator contracts and reference implementations.
    pub use crate::scheduler::{KernelTask, LocalTaskScheduler, TaskReservation, TaskScheduler};
    pub use crate::service::{
        CallbackRegistry, FailureHook, RecoveryCoordinator, ReservationGate, ServiceComponents,
    };
    pub use crate::storage::{DataStore, MemoryDataStore, PersistenceManager};
    pub use crate::transaction::{
        LocalTransactionScheduler, TransactionManager, TransactionParticipant,
        TransactionScheduler, TransactionalTask,
    };
    pub use crate::watchdog::{CompletionHandle, LocalWatchdog, RecoveryListener};
}
