// ============================================================================
// MemoTask Library
// ============================================================================
//
// Transactional code starts work that runs outside any transaction and is
// told about the outcome, in a new transaction, even if the node that ran
// the work fails before delivering it.
//
// ============================================================================

pub mod config;
pub mod core;
pub mod kernel;
pub mod prelude;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod transaction;
pub mod watchdog;

// Re-export main types for convenience
pub use config::{AsyncTaskConfig, RetryPolicy, SchedulerPolicy, StoragePolicy};
pub use core::{Identity, Node, NodeId, Result, TaskError};
pub use kernel::{TaskKernel, TaskKernelBuilder};
pub use service::{
    AsyncCallable, AsyncRunnable, AsyncTaskService, AsyncTaskStats, CallbackCatalog,
    CallbackSpec, CallbackTarget, FailureHook, TaskCallback, TaskFailure, UnresolvedFailure,
};
pub use storage::{DataStore, DurabilityMode, MemoryDataStore};
pub use transaction::{Transaction, TransactionManager, TransactionRunner};
