// ============================================================================
// Async Task Service
// ============================================================================
//
// Runs work outside transactions on behalf of transactional code:
// - reservation gate: tasks start only if the starting transaction commits
// - dispatcher: runs bodies and schedules outcome delivery
// - callback registry: durable pending records, one namespace per node
// - recovery: takes over the pending records of failed nodes
//
// ============================================================================

pub mod callback;
pub mod delivery;
pub mod dispatcher;
pub mod failure;
pub mod gate;
pub mod recovery;
pub mod registry;
pub mod startup;

pub use callback::{
    AsyncCallable, AsyncRunnable, CallbackCatalog, CallbackFactory, CallbackSpec, TaskCallback,
    TaskFailure,
};
pub use delivery::Outcome;
pub use dispatcher::{AsyncTaskService, AsyncTaskStats, ServiceComponents};
pub use failure::{FailureHook, LoggingFailureHook, UnresolvedFailure};
pub use gate::ReservationGate;
pub use recovery::RecoveryCoordinator;
pub use registry::{CallbackRegistry, CallbackTarget, NamespaceScan, PendingCallbackRecord};
pub use startup::{NodeStartupTaskService, StartupTaskFactory, StartupTaskRegistry};
