//! Failure recovery across nodes sharing one binding store

mod common;

use common::{CollectingHook, Delivered, RECORDER, Recorder, recording_catalog, wait_until};
use memotask::service::UnresolvedFailure;
use memotask::watchdog::LocalWatchdog;
use memotask::{
    AsyncTaskConfig, CallbackCatalog, CallbackSpec, CallbackTarget, DataStore, Identity,
    MemoryDataStore, Node, NodeId, TaskError, TaskKernel, TransactionManager,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

struct Cluster {
    store: Arc<MemoryDataStore>,
    transactions: Arc<TransactionManager>,
    catalog: Arc<CallbackCatalog>,
}

impl Cluster {
    fn new(recorder: &Arc<Recorder>) -> Self {
        Self {
            store: MemoryDataStore::in_memory(),
            transactions: Arc::new(TransactionManager::new()),
            catalog: recording_catalog(recorder),
        }
    }

    async fn node(&self, id: &str, watchdog: &Arc<LocalWatchdog>) -> TaskKernel {
        self.node_with_hook(id, watchdog, Arc::new(CollectingHook::default()))
            .await
    }

    async fn node_with_hook(
        &self,
        id: &str,
        watchdog: &Arc<LocalWatchdog>,
        hook: Arc<CollectingHook>,
    ) -> TaskKernel {
        TaskKernel::builder(AsyncTaskConfig::new(id))
            .store(self.store.clone())
            .transactions(self.transactions.clone())
            .catalog(self.catalog.clone())
            .watchdog(watchdog.clone())
            .failure_hook(hook)
            .build()
            .await
            .unwrap()
    }
}

/// Writes `count` pending records into `kernel`'s namespace without starting
/// any task body, as if the node died right after submitting them.
async fn orphan_records(kernel: &TaskKernel, count: usize) -> Vec<String> {
    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let mut names = Vec::new();
    for i in 0..count {
        let target = CallbackTarget::owned(CallbackSpec::new(RECORDER, json!(i)));
        names.push(
            kernel
                .service()
                .registry()
                .create(&txn, target, txn.owner())
                .unwrap(),
        );
    }
    kernel.transactions().commit(&txn).await.unwrap();
    names
}

fn records_of(kernel: &TaskKernel, node: &str) -> Vec<String> {
    let namespace = kernel.service().registry().namespace(&node.into());
    kernel.store().committed_names(&namespace).unwrap()
}

#[tokio::test]
async fn test_failed_node_records_are_migrated_and_failed() {
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::new(&recorder);
    let watchdog = Arc::new(LocalWatchdog::new());
    let n1 = cluster.node("n1", &watchdog).await;
    let n2 = cluster.node("n2", &watchdog).await;

    let orphaned = orphan_records(&n1, 3).await;
    assert_eq!(records_of(&n1, "n1"), orphaned);

    let completed = watchdog.report_node_failure(&Node::new("n1")).await.unwrap();
    assert!(completed);
    assert!(records_of(&n2, "n1").is_empty());

    wait_until(|| recorder.count() == 3).await;
    n2.wait_idle().await;
    assert!(records_of(&n2, "n2").is_empty());

    let notifications = recorder.notifications();
    assert!(
        notifications
            .iter()
            .all(|n| n.delivered == Delivered::Failed(None))
    );
    assert!(
        notifications
            .iter()
            .all(|n| n.owner == Identity::new("alice"))
    );
    let tags: BTreeSet<String> = notifications.iter().map(|n| n.tag.to_string()).collect();
    assert_eq!(tags.len(), 3);
    assert_eq!(n2.service().stats().records_recovered, 3);
    assert_eq!(n1.service().stats().records_recovered, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_recoveries_move_each_record_once() {
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::new(&recorder);
    let w1 = Arc::new(LocalWatchdog::new());
    let w2 = Arc::new(LocalWatchdog::new());
    let w3 = Arc::new(LocalWatchdog::new());
    let n1 = cluster.node("n1", &w1).await;
    let n2 = cluster.node("n2", &w2).await;
    let n3 = cluster.node("n3", &w3).await;

    orphan_records(&n1, 8).await;
    let failed = Node::new("n1");
    let (r2, r3) = tokio::join!(
        w2.report_node_failure(&failed),
        w3.report_node_failure(&failed)
    );
    assert!(r2.unwrap());
    assert!(r3.unwrap());

    wait_until(|| recorder.count() == 8).await;
    n2.wait_idle().await;
    n3.wait_idle().await;

    let notifications = recorder.notifications();
    assert_eq!(notifications.len(), 8);
    let tags: BTreeSet<String> = notifications.iter().map(|n| n.tag.to_string()).collect();
    assert_eq!(tags.len(), 8);

    let recovered =
        n2.service().stats().records_recovered + n3.service().stats().records_recovered;
    assert_eq!(recovered, 8);
    assert!(records_of(&n1, "n1").is_empty());
    assert!(records_of(&n2, "n2").is_empty());
    assert!(records_of(&n3, "n3").is_empty());
}

#[tokio::test]
async fn test_recovering_an_empty_namespace_completes() {
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::new(&recorder);
    let watchdog = Arc::new(LocalWatchdog::new());
    let n2 = cluster.node("n2", &watchdog).await;

    assert!(watchdog.report_node_failure(&Node::new("ghost")).await.unwrap());
    n2.wait_idle().await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(n2.service().stats().records_recovered, 0);
}

#[tokio::test]
async fn test_recovered_records_keep_being_numbered_locally() {
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::new(&recorder);
    let watchdog = Arc::new(LocalWatchdog::new());
    let n1 = cluster.node("n1", &watchdog).await;
    let n2 = cluster.node("n2", &watchdog).await;

    let local = orphan_records(&n2, 1).await;
    orphan_records(&n1, 2).await;
    watchdog.report_node_failure(&Node::new("n1")).await.unwrap();

    // n2's own record has no body behind it and stays; the migrated ones
    // were renamed past it and delivered.
    wait_until(|| recorder.count() == 2).await;
    n2.wait_idle().await;
    assert_eq!(records_of(&n2, "n2"), local);
}

#[tokio::test]
async fn test_failed_migration_is_reported_and_retried_on_next_report() {
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::new(&recorder);
    let hook = Arc::new(CollectingHook::default());
    let n1_watchdog = Arc::new(LocalWatchdog::new());
    let watchdog = Arc::new(LocalWatchdog::new());
    let n1 = cluster.node("n1", &n1_watchdog).await;
    let n2 = cluster.node_with_hook("n2", &watchdog, hook.clone()).await;

    orphan_records(&n1, 2).await;
    let malformed = format!("{}{:020}", n1.service().registry().namespace(&"n1".into()), 99);
    let txn = n1.transactions().begin(Identity::new("app")).await;
    n1.store()
        .set_binding(&txn, &malformed, json!("not a record"))
        .unwrap();
    n1.transactions().commit(&txn).await.unwrap();

    let failed = Node::new("n1");
    assert!(!watchdog.report_node_failure(&failed).await.unwrap());
    n2.wait_idle().await;
    // Nothing moved: the migration is all or nothing.
    assert_eq!(records_of(&n2, "n1").len(), 3);
    assert!(records_of(&n2, "n2").is_empty());
    assert_eq!(recorder.count(), 0);
    match &hook.failures()[..] {
        [UnresolvedFailure::RecoveryFailed { node, error }] => {
            assert_eq!(node, &NodeId::new("n1"));
            assert!(matches!(error, TaskError::Serialization(_)));
        }
        other => panic!("unexpected failures: {:?}", other),
    }
    assert_eq!(n2.service().stats().unresolved_failures, 1);
    assert_eq!(n2.service().stats().records_recovered, 0);

    // Once the bad record is gone, reporting the failure again completes it.
    let txn = n1.transactions().begin(Identity::new("app")).await;
    assert!(n1.store().remove_binding(&txn, &malformed).unwrap());
    n1.transactions().commit(&txn).await.unwrap();

    assert!(watchdog.report_node_failure(&failed).await.unwrap());
    wait_until(|| recorder.count() == 2).await;
    n2.wait_idle().await;
    assert!(records_of(&n2, "n1").is_empty());
    assert!(records_of(&n2, "n2").is_empty());
    assert_eq!(n2.service().stats().records_recovered, 2);
    assert_eq!(hook.failures().len(), 1);
}

#[tokio::test]
async fn test_recovering_the_local_node_is_a_no_op() {
    let recorder = Arc::new(Recorder::default());
    let cluster = Cluster::new(&recorder);
    let watchdog = Arc::new(LocalWatchdog::new());
    let n1 = cluster.node("n1", &watchdog).await;

    let names = orphan_records(&n1, 2).await;
    assert!(watchdog.report_node_failure(&n1.node()).await.unwrap());
    n1.wait_idle().await;

    assert_eq!(records_of(&n1, "n1"), names);
    assert_eq!(recorder.count(), 0);
    assert_eq!(n1.service().stats().records_recovered, 0);
    assert_eq!(n1.service().stats().unresolved_failures, 0);
}
