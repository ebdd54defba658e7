use super::callback::AsyncRunnable;
use super::dispatcher::AsyncTaskService;
use crate::config::AsyncTaskConfig;
use crate::core::{Identity, Result, TaskError};
use crate::transaction::{Transaction, TransactionScheduler};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

pub type StartupTaskFactory = Arc<dyn Fn() -> Arc<dyn AsyncRunnable> + Send + Sync>;

/// Startup tasks that configuration may name, keyed by id.
#[derive(Default, Clone)]
pub struct StartupTaskRegistry {
    factories: HashMap<String, StartupTaskFactory>,
}

impl StartupTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn AsyncRunnable> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, id: &str) -> Option<StartupTaskFactory> {
        self.factories.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Starts the configured startup task once the node is ready.
pub struct NodeStartupTaskService {
    task: Option<(String, Arc<dyn AsyncRunnable>)>,
    service: AsyncTaskService,
    transaction_scheduler: Arc<dyn TransactionScheduler>,
    identity: Identity,
}

impl NodeStartupTaskService {
    pub fn new(
        config: &AsyncTaskConfig,
        registry: &StartupTaskRegistry,
        service: AsyncTaskService,
        transaction_scheduler: Arc<dyn TransactionScheduler>,
    ) -> Result<Self> {
        let task = match &config.startup_task {
            Some(id) => {
                let factory = registry.get(id).ok_or_else(|| {
                    TaskError::Configuration(format!(
                        "unknown startup task '{}' (known: {:?})",
                        id,
                        registry.ids()
                    ))
                })?;
                Some((id.clone(), factory()))
            }
            None => {
                log::warn!(
                    "No startup task configured for node {}; nothing will run at startup",
                    config.node_id
                );
                None
            }
        };
        Ok(Self {
            task,
            service,
            transaction_scheduler,
            identity: config.app_identity.clone(),
        })
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task.as_ref().map(|(id, _)| id.as_str())
    }

    /// Starts the startup task in its own transaction. Returns whether a
    /// task was started.
    pub async fn ready(&self) -> Result<bool> {
        let Some((id, body)) = &self.task else {
            return Ok(false);
        };
        let service = self.service.clone();
        let body = body.clone();
        let start = move |txn: Transaction| {
            let service = service.clone();
            let body = body.clone();
            async move { service.start_shared_task(&txn, body) }
        };
        self.transaction_scheduler
            .run_task(Arc::new(start), &self.identity)
            .await?;
        event!(Level::INFO, task = %id, node = %self.service.node_id(), "startup task started");
        Ok(true)
    }
}
