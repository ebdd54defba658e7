#![allow(dead_code)]

use async_trait::async_trait;
use memotask::service::UnresolvedFailure;
use memotask::{
    CallbackCatalog, FailureHook, Identity, Result, TaskCallback, TaskFailure, Transaction,
};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant, sleep};

pub const RECORDER: &str = "recorder";

#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    Result(serde_json::Value),
    Failed(Option<TaskFailure>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub tag: serde_json::Value,
    pub owner: Identity,
    pub delivered: Delivered,
}

/// Collects every notification made to callbacks of kind [`RECORDER`].
#[derive(Default)]
pub struct Recorder {
    notifications: Mutex<Vec<Notification>>,
}

impl Recorder {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    fn push(&self, tag: &serde_json::Value, txn: &Transaction, delivered: Delivered) {
        self.notifications.lock().unwrap().push(Notification {
            tag: tag.clone(),
            owner: txn.owner().clone(),
            delivered,
        });
    }
}

struct TaggedCallback {
    tag: serde_json::Value,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl TaskCallback for TaggedCallback {
    async fn notify_result(&self, txn: &Transaction, result: serde_json::Value) -> Result<()> {
        self.recorder.push(&self.tag, txn, Delivered::Result(result));
        Ok(())
    }

    async fn notify_failed(&self, txn: &Transaction, failure: Option<TaskFailure>) -> Result<()> {
        self.recorder.push(&self.tag, txn, Delivered::Failed(failure));
        Ok(())
    }
}

/// Catalog whose [`RECORDER`] kind reports into `recorder`, tagged with the
/// callback state.
pub fn recording_catalog(recorder: &Arc<Recorder>) -> Arc<CallbackCatalog> {
    let catalog = Arc::new(CallbackCatalog::new());
    let recorder = recorder.clone();
    catalog
        .register(RECORDER, move |state: &serde_json::Value| {
            Ok(Arc::new(TaggedCallback {
                tag: state.clone(),
                recorder: recorder.clone(),
            }) as Arc<dyn TaskCallback>)
        })
        .unwrap();
    catalog
}

#[derive(Default)]
pub struct CollectingHook {
    failures: Mutex<Vec<UnresolvedFailure>>,
}

impl CollectingHook {
    pub fn failures(&self) -> Vec<UnresolvedFailure> {
        self.failures.lock().unwrap().clone()
    }
}

impl FailureHook for CollectingHook {
    fn report(&self, failure: &UnresolvedFailure) {
        self.failures.lock().unwrap().push(failure.clone());
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(2)).await;
    }
}
