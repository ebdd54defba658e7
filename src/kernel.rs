// ============================================================================
// Task Kernel: wiring of one node
// ============================================================================
//
// Every component receives its collaborators here. Several kernels may share
// one store, transaction manager and watchdog to model a cluster in one
// process.
//
// ============================================================================

use crate::config::AsyncTaskConfig;
use crate::core::{Node, Result};
use crate::scheduler::LocalTaskScheduler;
use crate::service::{
    AsyncTaskService, CallbackCatalog, FailureHook, LoggingFailureHook, NodeStartupTaskService,
    RecoveryCoordinator, ServiceComponents, StartupTaskRegistry,
};
use crate::storage::MemoryDataStore;
use crate::transaction::{LocalTransactionScheduler, TransactionManager};
use crate::watchdog::LocalWatchdog;
use std::sync::Arc;
use tokio::time::{Duration, sleep, timeout};
use tracing::{Level, event};

pub struct TaskKernelBuilder {
    config: AsyncTaskConfig,
    catalog: Option<Arc<CallbackCatalog>>,
    store: Option<Arc<MemoryDataStore>>,
    transactions: Option<Arc<TransactionManager>>,
    watchdog: Option<Arc<LocalWatchdog>>,
    failure_hook: Option<Arc<dyn FailureHook>>,
    startup_tasks: StartupTaskRegistry,
}

impl TaskKernelBuilder {
    pub fn new(config: AsyncTaskConfig) -> Self {
        Self {
            config,
            catalog: None,
            store: None,
            transactions: None,
            watchdog: None,
            failure_hook: None,
            startup_tasks: StartupTaskRegistry::new(),
        }
    }

    pub fn catalog(mut self, catalog: Arc<CallbackCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Uses an existing store instead of opening one from the configuration.
    pub fn store(mut self, store: Arc<MemoryDataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transactions(mut self, transactions: Arc<TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn watchdog(mut self, watchdog: Arc<LocalWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.failure_hook = Some(hook);
        self
    }

    pub fn startup_tasks(mut self, registry: StartupTaskRegistry) -> Self {
        self.startup_tasks = registry;
        self
    }

    pub async fn build(self) -> Result<TaskKernel> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => match &config.storage.data_dir {
                Some(dir) => MemoryDataStore::open(
                    dir,
                    config.storage.durability,
                    config.storage.checkpoint_threshold,
                )?,
                None => MemoryDataStore::in_memory(),
            },
        };
        let transactions = self
            .transactions
            .unwrap_or_else(|| Arc::new(TransactionManager::new()));
        let watchdog = self
            .watchdog
            .unwrap_or_else(|| Arc::new(LocalWatchdog::new()));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(CallbackCatalog::new()));
        let failure_hook = self
            .failure_hook
            .unwrap_or_else(|| Arc::new(LoggingFailureHook) as Arc<dyn FailureHook>);

        let transaction_scheduler = LocalTransactionScheduler::new(
            transactions.clone(),
            config.retry.clone(),
            config.scheduler.max_inflight_transactions,
        );
        let task_scheduler = LocalTaskScheduler::new(config.scheduler.max_reserved_tasks);

        let components = ServiceComponents::new(
            config.node_id.clone(),
            Arc::new(task_scheduler.clone()),
            Arc::new(transaction_scheduler.clone()),
            store.clone(),
            catalog.clone(),
        )
        .namespace_root(config.namespace_root.clone())
        .failure_hook(failure_hook);
        let service = AsyncTaskService::open(components, &config.app_identity).await?;

        watchdog
            .add_recovery_listener(Arc::new(RecoveryCoordinator::new(
                &service,
                config.app_identity.clone(),
            )))
            .await;

        let startup = NodeStartupTaskService::new(
            &config,
            &self.startup_tasks,
            service.clone(),
            Arc::new(transaction_scheduler.clone()),
        )?;

        event!(
            Level::INFO,
            node = %config.node_id,
            persistent = store.is_persistent(),
            "task kernel started"
        );

        Ok(TaskKernel {
            config,
            store,
            transactions,
            transaction_scheduler,
            task_scheduler,
            catalog,
            watchdog,
            service,
            startup,
        })
    }
}

/// All collaborators of one node, wired together.
pub struct TaskKernel {
    config: AsyncTaskConfig,
    store: Arc<MemoryDataStore>,
    transactions: Arc<TransactionManager>,
    transaction_scheduler: LocalTransactionScheduler,
    task_scheduler: LocalTaskScheduler,
    catalog: Arc<CallbackCatalog>,
    watchdog: Arc<LocalWatchdog>,
    service: AsyncTaskService,
    startup: NodeStartupTaskService,
}

impl TaskKernel {
    pub fn builder(config: AsyncTaskConfig) -> TaskKernelBuilder {
        TaskKernelBuilder::new(config)
    }

    pub async fn open(config: AsyncTaskConfig) -> Result<Self> {
        TaskKernelBuilder::new(config).build().await
    }

    pub fn config(&self) -> &AsyncTaskConfig {
        &self.config
    }

    pub fn node(&self) -> Node {
        Node::new(self.config.node_id.clone())
    }

    pub fn store(&self) -> &Arc<MemoryDataStore> {
        &self.store
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn transaction_scheduler(&self) -> &LocalTransactionScheduler {
        &self.transaction_scheduler
    }

    pub fn task_scheduler(&self) -> &LocalTaskScheduler {
        &self.task_scheduler
    }

    pub fn catalog(&self) -> &Arc<CallbackCatalog> {
        &self.catalog
    }

    pub fn watchdog(&self) -> &Arc<LocalWatchdog> {
        &self.watchdog
    }

    pub fn service(&self) -> &AsyncTaskService {
        &self.service
    }

    pub fn startup(&self) -> &NodeStartupTaskService {
        &self.startup
    }

    /// Waits until no task body and no scheduled transaction is outstanding.
    ///
    /// Polls every millisecond and never times out; a body that never
    /// finishes keeps it waiting forever. Use
    /// [`wait_idle_for`](TaskKernel::wait_idle_for) to bound the wait.
    pub async fn wait_idle(&self) {
        // A body holds its slot until it has scheduled its delivery, so the
        // two counters never read zero in between.
        while self.task_scheduler.outstanding() > 0 || self.transaction_scheduler.inflight() > 0 {
            sleep(Duration::from_millis(1)).await;
        }
    }

    /// [`wait_idle`](TaskKernel::wait_idle) with a deadline. Returns whether
    /// the node went idle in time.
    pub async fn wait_idle_for(&self, limit: Duration) -> bool {
        timeout(limit, self.wait_idle()).await.is_ok()
    }

    pub fn shutdown(&self) {
        self.service.shutdown();
    }
}
