use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task rejected: {0}")]
    Rejected(String),

    #[error("Service is shut down")]
    ShutDown,

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Transaction {0} is not active")]
    TransactionNotActive(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown callback kind '{0}'")]
    UnknownCallbackKind(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl TaskError {
    /// Transient failures that a transaction runner retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

impl<T> From<std::sync::PoisonError<T>> for TaskError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
