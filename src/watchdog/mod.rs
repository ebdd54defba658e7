//! Node-failure notification.
//!
//! The watchdog tells every registered [`RecoveryListener`] when a node has
//! failed. Each listener receives a [`CompletionHandle`] and must complete it
//! once recovery for that node has been issued.

use crate::core::{Node, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{RwLock, oneshot};
use tracing::{Level, event};

#[async_trait]
pub trait RecoveryListener: Send + Sync {
    /// Recovers the state owned by `node`. Calls `handle.completed()` once
    /// recovery has been issued; dropping the handle leaves it incomplete.
    async fn recover(&self, node: &Node, handle: CompletionHandle);
}

/// One-shot completion signal for a single recovery call.
pub struct CompletionHandle {
    node: Node,
    sender: oneshot::Sender<()>,
}

impl CompletionHandle {
    fn new(node: Node) -> (Self, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        (Self { node, sender }, receiver)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn completed(self) {
        // The watchdog may have stopped waiting; nothing to do then.
        let _ = self.sender.send(());
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("node", &self.node)
            .finish()
    }
}

/// In-process failure notifier. Failures are reported explicitly by whoever
/// detects them; re-reporting the same node retries its recovery.
#[derive(Default)]
pub struct LocalWatchdog {
    listeners: RwLock<Vec<Arc<dyn RecoveryListener>>>,
}

impl LocalWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_recovery_listener(&self, listener: Arc<dyn RecoveryListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Runs every listener's recovery for `node`. Returns `true` when all of
    /// them completed their handle.
    pub async fn report_node_failure(&self, node: &Node) -> Result<bool> {
        let listeners = self.listeners.read().await.clone();
        event!(Level::INFO, node = %node.id(), listeners = listeners.len(), "node failure reported");

        let mut all_completed = true;
        for listener in listeners {
            let (handle, receiver) = CompletionHandle::new(node.clone());
            listener.recover(node, handle).await;
            if receiver.await.is_err() {
                all_completed = false;
            }
        }

        if all_completed {
            event!(Level::INFO, node = %node.id(), "node recovery completed");
        } else {
            event!(Level::WARN, node = %node.id(), "node recovery incomplete; report the failure again to retry");
        }
        Ok(all_completed)
    }
}
