// ============================================================================
// Task bodies, callbacks, and the callback catalog
// ============================================================================

use crate::core::{Result, TaskError};
use crate::transaction::{Transaction, TransactionRunner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Failure reported by a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(format!("task body panicked: {}", detail))
    }
}

impl From<TaskError> for TaskFailure {
    fn from(err: TaskError) -> Self {
        Self::new(err.to_string())
    }
}

/// Fire-and-forget task body. Runs outside any transaction; `runner` opens
/// new transactions on behalf of the identity that started the task.
#[async_trait]
pub trait AsyncRunnable: Send + Sync {
    async fn run(&self, runner: Arc<dyn TransactionRunner>) -> std::result::Result<(), TaskFailure>;
}

#[async_trait]
impl<F, Fut> AsyncRunnable for F
where
    F: Fn(Arc<dyn TransactionRunner>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), TaskFailure>> + Send + 'static,
{
    async fn run(&self, runner: Arc<dyn TransactionRunner>) -> std::result::Result<(), TaskFailure> {
        (self)(runner).await
    }
}

/// Task body whose outcome is delivered to a callback.
#[async_trait]
pub trait AsyncCallable: Send + Sync {
    type Output: Serialize + Send;

    async fn call(
        &self,
        runner: Arc<dyn TransactionRunner>,
    ) -> std::result::Result<Self::Output, TaskFailure>;
}

#[async_trait]
impl<F, Fut, T> AsyncCallable for F
where
    F: Fn(Arc<dyn TransactionRunner>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, TaskFailure>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    type Output = T;

    async fn call(&self, runner: Arc<dyn TransactionRunner>) -> std::result::Result<T, TaskFailure> {
        (self)(runner).await
    }
}

/// Receives the outcome of a task, inside the delivery transaction.
///
/// An error aborts the delivery transaction; conflicts are retried, anything
/// else leaves the pending record in place.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn notify_result(&self, txn: &Transaction, result: serde_json::Value) -> Result<()>;

    /// `failure` is `None` when the node running the task failed.
    async fn notify_failed(&self, txn: &Transaction, failure: Option<TaskFailure>) -> Result<()>;
}

/// Durable description of a callback: the kind it was registered under plus
/// whatever state its factory needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub kind: String,
    #[serde(default)]
    pub state: serde_json::Value,
}

impl CallbackSpec {
    pub fn new(kind: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            state,
        }
    }

    pub fn from_state<T: Serialize>(kind: impl Into<String>, state: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(state)?))
    }
}

pub type CallbackFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn TaskCallback>> + Send + Sync>;

/// Registration table mapping callback kinds to factories.
#[derive(Default)]
pub struct CallbackCatalog {
    factories: RwLock<HashMap<String, CallbackFactory>>,
}

impl CallbackCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn TaskCallback>> + Send + Sync + 'static,
    {
        self.factories.write()?.insert(kind.into(), Arc::new(factory));
        Ok(())
    }

    /// Registers a callback that ignores its state and is shared by every record.
    pub fn register_shared(&self, kind: impl Into<String>, callback: Arc<dyn TaskCallback>) -> Result<()> {
        self.register(kind, move |_state: &serde_json::Value| Ok(callback.clone()))
    }

    pub fn contains(&self, kind: &str) -> Result<bool> {
        Ok(self.factories.read()?.contains_key(kind))
    }

    pub fn kinds(&self) -> Result<Vec<String>> {
        let mut kinds: Vec<String> = self.factories.read()?.keys().cloned().collect();
        kinds.sort();
        Ok(kinds)
    }

    pub fn instantiate(&self, spec: &CallbackSpec) -> Result<Arc<dyn TaskCallback>> {
        let factory = self
            .factories
            .read()?
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| TaskError::UnknownCallbackKind(spec.kind.clone()))?;
        factory(&spec.state)
    }
}
