use crate::core::{NodeId, TaskError};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

/// A failure this service cannot resolve on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedFailure {
    /// The outcome was decided but its delivery transaction could not be
    /// scheduled. The record stays until someone delivers it by hand.
    DeliveryRejected { record: String, error: TaskError },
    /// The delivery transaction failed permanently; the record stays.
    DeliveryFailed { record: String, error: TaskError },
    /// Scanning or migrating a failed node's records did not commit.
    RecoveryFailed { node: NodeId, error: TaskError },
}

impl UnresolvedFailure {
    pub fn error(&self) -> &TaskError {
        match self {
            UnresolvedFailure::DeliveryRejected { error, .. }
            | UnresolvedFailure::DeliveryFailed { error, .. }
            | UnresolvedFailure::RecoveryFailed { error, .. } => error,
        }
    }
}

impl fmt::Display for UnresolvedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedFailure::DeliveryRejected { record, error } => {
                write!(f, "delivery of {} could not be scheduled: {}", record, error)
            }
            UnresolvedFailure::DeliveryFailed { record, error } => {
                write!(f, "delivery of {} failed: {}", record, error)
            }
            UnresolvedFailure::RecoveryFailed { node, error } => {
                write!(f, "recovery of node {} failed: {}", node, error)
            }
        }
    }
}

/// Operator-level sink for unresolved failures.
pub trait FailureHook: Send + Sync {
    fn report(&self, failure: &UnresolvedFailure);
}

/// Default hook: logs every failure at ERROR.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFailureHook;

impl FailureHook for LoggingFailureHook {
    fn report(&self, failure: &UnresolvedFailure) {
        event!(Level::ERROR, failure = %failure, "unresolved async task failure");
    }
}

/// Forwards to another hook and counts what passed through.
pub(crate) struct CountingFailureHook {
    inner: Arc<dyn FailureHook>,
    reported: AtomicU64,
}

impl CountingFailureHook {
    pub(crate) fn new(inner: Arc<dyn FailureHook>) -> Self {
        Self {
            inner,
            reported: AtomicU64::new(0),
        }
    }

    pub(crate) fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl FailureHook for CountingFailureHook {
    fn report(&self, failure: &UnresolvedFailure) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        self.inner.report(failure);
    }
}
