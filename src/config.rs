use crate::core::{Identity, NodeId, Result, TaskError};
use crate::storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_NAMESPACE_ROOT: &str = "memotask.callback.";

/// Configuration for retry behavior on transient transaction failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 2,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Admission limits of the two worker pools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerPolicy {
    /// Reserved plus running task bodies on the non-transactional pool.
    pub max_reserved_tasks: usize,
    /// Scheduled plus running transactions on the transactional pool.
    pub max_inflight_transactions: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            max_reserved_tasks: 256,
            max_inflight_transactions: 256,
        }
    }
}

/// Where and how the binding store persists its state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoragePolicy {
    /// Directory for the log and snapshot files; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub durability: DurabilityMode,
    /// Commits between automatic checkpoints.
    pub checkpoint_threshold: usize,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::Sync,
            checkpoint_threshold: 1000,
        }
    }
}

/// Configuration of one node's asynchronous task service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AsyncTaskConfig {
    pub node_id: NodeId,
    #[serde(default = "default_namespace_root")]
    pub namespace_root: String,
    #[serde(default = "default_app_identity")]
    pub app_identity: Identity,
    #[serde(default)]
    pub scheduler: SchedulerPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub storage: StoragePolicy,
    /// Startup task id, resolved against the startup task registry.
    #[serde(default)]
    pub startup_task: Option<String>,
}

fn default_namespace_root() -> String {
    DEFAULT_NAMESPACE_ROOT.to_string()
}

fn default_app_identity() -> Identity {
    Identity::new("app")
}

impl AsyncTaskConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            namespace_root: default_namespace_root(),
            app_identity: default_app_identity(),
            scheduler: SchedulerPolicy::default(),
            retry: RetryPolicy::default(),
            storage: StoragePolicy::default(),
            startup_task: None,
        }
    }

    pub fn namespace_root(mut self, root: impl Into<String>) -> Self {
        self.namespace_root = root.into();
        self
    }

    pub fn app_identity(mut self, identity: impl Into<String>) -> Self {
        self.app_identity = Identity::new(identity);
        self
    }

    pub fn max_reserved_tasks(mut self, max: usize) -> Self {
        self.scheduler.max_reserved_tasks = max;
        self
    }

    pub fn max_inflight_transactions(mut self, max: usize) -> Self {
        self.scheduler.max_inflight_transactions = max;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = Some(dir.into());
        self
    }

    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.storage.durability = durability;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.storage.checkpoint_threshold = threshold;
        self
    }

    pub fn startup_task(mut self, task_id: impl Into<String>) -> Self {
        self.startup_task = Some(task_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(TaskError::Configuration("node_id must not be empty".into()));
        }
        if self.node_id.as_str().contains('.') {
            return Err(TaskError::Configuration(format!(
                "node_id '{}' must not contain '.'",
                self.node_id
            )));
        }
        if self.namespace_root.is_empty() {
            return Err(TaskError::Configuration(
                "namespace_root must not be empty".into(),
            ));
        }
        if self.scheduler.max_reserved_tasks == 0 {
            return Err(TaskError::Configuration(
                "scheduler.max_reserved_tasks must be greater than 0".into(),
            ));
        }
        if self.scheduler.max_inflight_transactions == 0 {
            return Err(TaskError::Configuration(
                "scheduler.max_inflight_transactions must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(TaskError::Configuration(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.storage.checkpoint_threshold == 0 {
            return Err(TaskError::Configuration(
                "storage.checkpoint_threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TaskError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TaskError::Configuration(format!(
                "Failed to read configuration '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&contents)
    }
}
