use super::delivery::Outcome;
use super::dispatcher::{AsyncTaskService, ServiceInner};
use super::failure::UnresolvedFailure;
use crate::core::{Identity, Node, Result, TaskError};
use crate::transaction::Transaction;
use crate::watchdog::{CompletionHandle, RecoveryListener};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{Instrument, Level, event, info_span};

/// Takes over the pending callbacks of failed nodes.
///
/// All of a failed node's records are moved into the local namespace in one
/// transaction; each moved record then gets its own delivery reporting that
/// the owning node failed. Two coordinators recovering the same node race on
/// the source records, and the store lets only one of them move each record.
pub struct RecoveryCoordinator {
    inner: Arc<ServiceInner>,
    identity: Identity,
}

impl RecoveryCoordinator {
    /// `identity` runs the scan transaction; deliveries run as each record's owner.
    pub fn new(service: &AsyncTaskService, identity: Identity) -> Self {
        Self {
            inner: service.inner.clone(),
            identity,
        }
    }

    /// Moves every record of `node` into the local namespace. Returns the
    /// new names with their owners.
    async fn migrate_node(&self, node: &Node) -> Result<Vec<(String, Identity)>> {
        let migrated = Arc::new(Mutex::new(Vec::new()));
        let registry = self.inner.registry.clone();
        let failed_node = node.id().clone();
        let collected = migrated.clone();
        let task = move |txn: Transaction| {
            let registry = registry.clone();
            let failed_node = failed_node.clone();
            let collected = collected.clone();
            async move {
                let mut moved = Vec::new();
                let names = registry
                    .list_namespace(&txn, &failed_node)
                    .collect::<Result<Vec<String>>>()?;
                for name in names {
                    if let Some((new_name, record)) = registry.migrate(&txn, &name)? {
                        moved.push((new_name, record.owner));
                    }
                }
                // Only the last, committed attempt counts.
                *collected.lock()? = moved;
                Ok::<(), TaskError>(())
            }
        };
        self.inner
            .transaction_scheduler
            .run_task(Arc::new(task), &self.identity)
            .await?;
        let moved = std::mem::take(&mut *migrated.lock()?);
        Ok(moved)
    }
}

#[async_trait]
impl RecoveryListener for RecoveryCoordinator {
    async fn recover(&self, node: &Node, handle: CompletionHandle) {
        if node.id() == &self.inner.node_id {
            event!(Level::WARN, node = %node.id(), "asked to recover the local node; nothing to do");
            handle.completed();
            return;
        }

        let span = info_span!("recovery", failed = %node.id(), local = %self.inner.node_id);
        async {
            event!(Level::INFO, "recovering pending callbacks");
            let migrated = match self.migrate_node(node).await {
                Ok(migrated) => migrated,
                Err(error) => {
                    self.inner.report(UnresolvedFailure::RecoveryFailed {
                        node: node.id().clone(),
                        error,
                    });
                    // Leaving the handle incomplete asks for another attempt.
                    return;
                }
            };

            let count = migrated.len();
            for (record, owner) in migrated {
                self.inner.schedule_delivery(record, &owner, Outcome::NodeFailed);
            }
            self.inner.note_recovered(count);
            event!(Level::INFO, records = count, "recovery issued");
            handle.completed();
        }
        .instrument(span)
        .await
    }
}
