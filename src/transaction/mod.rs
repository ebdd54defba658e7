// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Reference transaction infrastructure the task service runs on:
// - explicit transaction handles (no thread-bound "current transaction")
// - participant hooks for commit/abort coordination
// - a transactional worker pool with conflict retry
//
// ============================================================================

pub mod manager;
pub mod runner;
pub mod state;

pub use manager::{TransactionManager, TransactionStats};
pub use runner::{
    LocalTransactionScheduler, OwnedTransactionRunner, TaskCompletion, TransactionRunner,
    TransactionScheduler, TransactionalTask,
};
pub use state::{Transaction, TransactionId, TransactionParticipant, TransactionState};
