//! End-to-end tests of task submission and callback delivery on one node

mod common;

use common::{CollectingHook, Delivered, RECORDER, Recorder, recording_catalog, wait_until};
use memotask::service::UnresolvedFailure;
use memotask::transaction::TransactionScheduler;
use async_trait::async_trait;
use memotask::{
    AsyncTaskConfig, CallbackSpec, CallbackTarget, DataStore, Identity, RetryPolicy, TaskCallback,
    TaskError, TaskFailure, TaskKernel, Transaction, TransactionRunner,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

async fn kernel(config: AsyncTaskConfig, recorder: &Arc<Recorder>) -> TaskKernel {
    TaskKernel::builder(config)
        .catalog(recording_catalog(recorder))
        .build()
        .await
        .unwrap()
}

fn recorder_target(tag: serde_json::Value) -> CallbackTarget {
    CallbackTarget::owned(CallbackSpec::new(RECORDER, tag))
}

fn local_records(kernel: &TaskKernel) -> Vec<String> {
    let namespace = kernel.service().registry().namespace(&kernel.config().node_id);
    kernel.store().committed_names(&namespace).unwrap()
}

#[tokio::test]
async fn test_committed_task_delivers_result_once() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let record = kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async {
                Ok::<_, TaskFailure>(json!({"answer": 42}))
            },
            recorder_target(json!("a")),
        )
        .unwrap();
    assert_eq!(kernel.store().committed_value(&record).unwrap(), None);
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| recorder.count() == 1).await;
    kernel.wait_idle().await;

    let notifications = recorder.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].delivered, Delivered::Result(json!({"answer": 42})));
    assert_eq!(notifications[0].owner, Identity::new("alice"));
    assert!(local_records(&kernel).is_empty());

    let stats = kernel.service().stats();
    assert_eq!(stats.tasks_submitted, 1);
    assert_eq!(stats.callbacks_registered, 1);
    assert_eq!(stats.callbacks_delivered, 1);
    assert_eq!(stats.unresolved_failures, 0);
}

#[tokio::test]
async fn test_aborted_task_never_runs() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;
    let ran = Arc::new(AtomicBool::new(false));

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let flag = ran.clone();
    kernel
        .service()
        .start_task_with_callback(
            &txn,
            move |_runner: Arc<dyn TransactionRunner>| {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, TaskFailure>(1)
                }
            },
            recorder_target(json!("b")),
        )
        .unwrap();
    kernel.transactions().abort(&txn, false).await.unwrap();
    kernel.wait_idle().await;

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(recorder.count(), 0);
    assert!(local_records(&kernel).is_empty());
    assert_eq!(kernel.task_scheduler().cancelled(), 1);
    assert_eq!(kernel.service().gate().open_contexts(), 0);
}

#[tokio::test]
async fn test_failing_body_delivers_failure() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async {
                Err::<i32, _>(TaskFailure::new("disk on fire"))
            },
            recorder_target(json!("c")),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| recorder.count() == 1).await;
    kernel.wait_idle().await;
    assert_eq!(
        recorder.notifications()[0].delivered,
        Delivered::Failed(Some(TaskFailure::new("disk on fire")))
    );
    assert!(local_records(&kernel).is_empty());
}

#[tokio::test]
async fn test_panicking_body_delivers_failure() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<i32, TaskFailure>(0)
            },
            recorder_target(json!("p")),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| recorder.count() == 1).await;
    match &recorder.notifications()[0].delivered {
        Delivered::Failed(Some(failure)) => assert!(failure.message.contains("kaboom")),
        other => panic!("unexpected delivery: {:?}", other),
    }
}

#[tokio::test]
async fn test_fire_and_forget_body_opens_transactions() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;
    let store = kernel.store().clone();

    let txn = kernel.transactions().begin(Identity::new("bob")).await;
    kernel
        .service()
        .start_task(&txn, move |runner: Arc<dyn TransactionRunner>| {
            let store = store.clone();
            async move {
                runner
                    .run_transaction(Arc::new(move |txn: Transaction| {
                        let store = store.clone();
                        async move {
                            store.set_binding(&txn, "side.effect", json!(txn.owner().name()))
                        }
                    }))
                    .await
                    .map_err(TaskFailure::from)
            }
        })
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    let store = kernel.store().clone();
    wait_until(|| store.committed_value("side.effect").unwrap().is_some()).await;
    assert_eq!(store.committed_value("side.effect").unwrap(), Some(json!("bob")));
    assert_eq!(kernel.service().stats().callbacks_registered, 0);
}

#[tokio::test]
async fn test_full_scheduler_rejects_synchronously() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1").max_reserved_tasks(1), &recorder).await;
    let release = Arc::new(Notify::new());

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let gate = release.clone();
    assert_ok!(kernel.service().start_task_with_callback(
        &txn,
        move |_runner: Arc<dyn TransactionRunner>| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, TaskFailure>("done")
            }
        },
        recorder_target(json!("first")),
    ));
    kernel.transactions().commit(&txn).await.unwrap();

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let err = assert_err!(kernel.service().start_task_with_callback(
        &txn,
        |_runner: Arc<dyn TransactionRunner>| async { Ok::<_, TaskFailure>("never") },
        recorder_target(json!("second")),
    ));
    assert!(matches!(err, TaskError::Rejected(_)));
    // Committing anyway must not leave the rejected task's record behind.
    kernel.transactions().commit(&txn).await.unwrap();
    assert_eq!(local_records(&kernel).len(), 1);

    release.notify_one();
    wait_until(|| recorder.count() == 1).await;
    kernel.wait_idle().await;
    assert_eq!(recorder.notifications()[0].tag, json!("first"));
    assert!(local_records(&kernel).is_empty());
}

#[tokio::test]
async fn test_shutdown_refuses_new_tasks() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;
    kernel.shutdown();
    assert!(kernel.service().is_shut_down());

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let err = kernel
        .service()
        .start_task(&txn, |_runner: Arc<dyn TransactionRunner>| async {
            Ok::<(), TaskFailure>(())
        })
        .unwrap_err();
    assert_eq!(err, TaskError::ShutDown);
    let err = kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async { Ok::<_, TaskFailure>(1) },
            recorder_target(json!("s")),
        )
        .unwrap_err();
    assert_eq!(err, TaskError::ShutDown);
    kernel.transactions().commit(&txn).await.unwrap();
    assert!(local_records(&kernel).is_empty());
}

#[tokio::test]
async fn test_referenced_target_is_notified_and_kept() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;
    let spec = serde_json::to_value(CallbackSpec::new(RECORDER, json!("ref"))).unwrap();

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    kernel.store().set_binding(&txn, "app.listener", spec).unwrap();
    kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async { Ok::<_, TaskFailure>(7) },
            CallbackTarget::referenced("app.listener"),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| recorder.count() == 1).await;
    kernel.wait_idle().await;
    assert_eq!(recorder.notifications()[0].delivered, Delivered::Result(json!(7)));
    assert!(local_records(&kernel).is_empty());
    assert!(kernel.store().committed_value("app.listener").unwrap().is_some());
}

#[tokio::test]
async fn test_removed_referenced_target_is_silently_skipped() {
    let recorder = Arc::new(Recorder::default());
    let kernel = kernel(AsyncTaskConfig::new("n1"), &recorder).await;
    let spec = serde_json::to_value(CallbackSpec::new(RECORDER, json!("gone"))).unwrap();
    let release = Arc::new(Notify::new());

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    kernel.store().set_binding(&txn, "app.listener", spec).unwrap();
    let gate = release.clone();
    kernel
        .service()
        .start_task_with_callback(
            &txn,
            move |_runner: Arc<dyn TransactionRunner>| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<_, TaskFailure>(7)
                }
            },
            CallbackTarget::referenced("app.listener"),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    assert!(kernel.store().remove_binding(&txn, "app.listener").unwrap());
    kernel.transactions().commit(&txn).await.unwrap();

    release.notify_one();
    kernel.wait_idle().await;
    assert_eq!(recorder.count(), 0);
    assert!(local_records(&kernel).is_empty());
    assert_eq!(kernel.service().stats().unresolved_failures, 0);
}

#[tokio::test]
async fn test_rejected_delivery_is_reported_and_left_pending() {
    let recorder = Arc::new(Recorder::default());
    let hook = Arc::new(CollectingHook::default());
    let kernel = TaskKernel::builder(AsyncTaskConfig::new("n1").max_inflight_transactions(1))
        .catalog(recording_catalog(&recorder))
        .failure_hook(hook.clone())
        .build()
        .await
        .unwrap();

    // Occupy the only transactional slot.
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    kernel
        .transaction_scheduler()
        .schedule_task(
            Arc::new(move |_txn: Transaction| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<(), TaskError>(())
                }
            }),
            &Identity::new("app"),
        )
        .unwrap();

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let record = kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async { Ok::<_, TaskFailure>(1) },
            recorder_target(json!("lost")),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| !hook.failures().is_empty()).await;
    match &hook.failures()[0] {
        UnresolvedFailure::DeliveryRejected { record: failed, error } => {
            assert_eq!(failed, &record);
            assert!(matches!(error, TaskError::Rejected(_)));
        }
        other => panic!("unexpected failure: {:?}", other),
    }

    release.notify_one();
    kernel.wait_idle().await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(local_records(&kernel), vec![record]);
    assert_eq!(kernel.service().stats().unresolved_failures, 1);
}

#[tokio::test]
async fn test_unknown_callback_kind_keeps_record() {
    let recorder = Arc::new(Recorder::default());
    let hook = Arc::new(CollectingHook::default());
    let kernel = TaskKernel::builder(AsyncTaskConfig::new("n1"))
        .catalog(recording_catalog(&recorder))
        .failure_hook(hook.clone())
        .build()
        .await
        .unwrap();

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let record = kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async { Ok::<_, TaskFailure>(1) },
            CallbackTarget::owned(CallbackSpec::new("unregistered", json!(null))),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| !hook.failures().is_empty()).await;
    kernel.wait_idle().await;
    assert_eq!(hook.failures().len(), 1);
    assert!(matches!(
        hook.failures()[0].error(),
        TaskError::UnknownCallbackKind(kind) if kind == "unregistered"
    ));
    assert_eq!(local_records(&kernel), vec![record]);
}

/// Callback whose delivery transaction always loses a conflict.
struct AlwaysConflicts;

#[async_trait]
impl TaskCallback for AlwaysConflicts {
    async fn notify_result(&self, _txn: &Transaction, _result: serde_json::Value) -> memotask::Result<()> {
        Err(TaskError::Conflict("listener busy".into()))
    }

    async fn notify_failed(&self, _txn: &Transaction, _failure: Option<TaskFailure>) -> memotask::Result<()> {
        Err(TaskError::Conflict("listener busy".into()))
    }
}

#[tokio::test]
async fn test_delivery_out_of_retries_is_reported() {
    let recorder = Arc::new(Recorder::default());
    let hook = Arc::new(CollectingHook::default());
    let catalog = recording_catalog(&recorder);
    catalog
        .register_shared("conflicting", Arc::new(AlwaysConflicts))
        .unwrap();
    let config = AsyncTaskConfig::new("n1").retry(RetryPolicy {
        max_attempts: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
    });
    let kernel = TaskKernel::builder(config)
        .catalog(catalog)
        .failure_hook(hook.clone())
        .build()
        .await
        .unwrap();

    let txn = kernel.transactions().begin(Identity::new("alice")).await;
    let record = kernel
        .service()
        .start_task_with_callback(
            &txn,
            |_runner: Arc<dyn TransactionRunner>| async { Ok::<_, TaskFailure>(1) },
            CallbackTarget::owned(CallbackSpec::new("conflicting", json!(null))),
        )
        .unwrap();
    kernel.transactions().commit(&txn).await.unwrap();

    wait_until(|| !hook.failures().is_empty()).await;
    kernel.wait_idle().await;
    let failures = hook.failures();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        UnresolvedFailure::DeliveryFailed { record: failed, error } => {
            assert_eq!(failed, &record);
            assert!(matches!(error, TaskError::Conflict(_)));
        }
        other => panic!("unexpected failure: {:?}", other),
    }
    assert_eq!(kernel.service().stats().unresolved_failures, 1);
    assert_eq!(kernel.service().stats().callbacks_delivered, 0);
    assert_eq!(local_records(&kernel), vec![record]);
}
