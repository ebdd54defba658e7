// ============================================================================
// Durable Callback Registry
// ============================================================================
//
// Pending callback records live in the binding store under
// `<root><node-id>.<sequence>`, one namespace per owning node. A record
// exists from task submission until its outcome has been delivered.
//
// ============================================================================

use super::callback::{CallbackCatalog, CallbackSpec, TaskCallback};
use crate::core::{Identity, NodeId, Result, TaskError};
use crate::storage::DataStore;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

/// Width of the zero-padded sequence so lexical order is numeric order.
const SEQUENCE_WIDTH: usize = 20;

/// What a pending record delivers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallbackTarget {
    /// Application-owned callback stored as a [`CallbackSpec`] under
    /// `binding`. The registry never deletes it.
    Referenced { binding: String },
    /// Callback owned by the record and destroyed with it.
    Owned(CallbackSpec),
}

impl CallbackTarget {
    pub fn referenced(binding: impl Into<String>) -> Self {
        Self::Referenced {
            binding: binding.into(),
        }
    }

    pub fn owned(spec: CallbackSpec) -> Self {
        Self::Owned(spec)
    }

    pub fn kind_label(&self) -> &str {
        match self {
            CallbackTarget::Referenced { .. } => "referenced",
            CallbackTarget::Owned(spec) => &spec.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallbackRecord {
    pub target: CallbackTarget,
    /// Identity the delivery transaction runs as.
    pub owner: Identity,
    pub created_at: DateTime<Utc>,
}

impl PendingCallbackRecord {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            TaskError::Serialization(format!("Malformed pending callback record: {}", e))
        })
    }
}

pub struct CallbackRegistry {
    store: Arc<dyn DataStore>,
    catalog: Arc<CallbackCatalog>,
    namespace_root: String,
    local_node: NodeId,
    next_sequence: AtomicU64,
}

impl CallbackRegistry {
    pub fn new(
        store: Arc<dyn DataStore>,
        catalog: Arc<CallbackCatalog>,
        namespace_root: impl Into<String>,
        local_node: NodeId,
    ) -> Self {
        Self {
            store,
            catalog,
            namespace_root: namespace_root.into(),
            local_node,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn catalog(&self) -> &Arc<CallbackCatalog> {
        &self.catalog
    }

    /// Prefix shared by every record owned by `node`.
    pub fn namespace(&self, node: &NodeId) -> String {
        namespace_prefix(&self.namespace_root, node)
    }

    fn next_local_name(&self) -> String {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}{:0width$}",
            self.namespace(&self.local_node),
            sequence,
            width = SEQUENCE_WIDTH
        )
    }

    /// Continues local numbering after the highest record already stored in
    /// the local namespace. Returns the next sequence number.
    pub fn seed_sequence(&self, txn: &Transaction) -> Result<u64> {
        let prefix = self.namespace(&self.local_node);
        let mut highest = 0u64;
        for name in self.list_namespace(txn, &self.local_node) {
            let name = name?;
            if let Some(sequence) = name
                .strip_prefix(&prefix)
                .and_then(|suffix| suffix.parse::<u64>().ok())
            {
                highest = highest.max(sequence);
            }
        }
        let next = highest + 1;
        self.next_sequence.fetch_max(next, Ordering::SeqCst);
        Ok(self.next_sequence.load(Ordering::SeqCst))
    }

    /// Stores a new pending record in the local namespace and returns its name.
    pub fn create(&self, txn: &Transaction, target: CallbackTarget, owner: &Identity) -> Result<String> {
        let name = self.next_local_name();
        let record = PendingCallbackRecord {
            target,
            owner: owner.clone(),
            created_at: Utc::now(),
        };
        self.store
            .set_binding(txn, &name, serde_json::to_value(&record)?)?;
        event!(Level::DEBUG, record = %name, owner = %owner, "pending callback registered");
        Ok(name)
    }

    pub fn load(&self, txn: &Transaction, name: &str) -> Result<Option<PendingCallbackRecord>> {
        self.store
            .get_binding(txn, name)?
            .map(PendingCallbackRecord::from_value)
            .transpose()
    }

    /// Live callback for the record, or `None` if the record or its
    /// referenced target is gone.
    pub fn resolve(&self, txn: &Transaction, name: &str) -> Result<Option<Arc<dyn TaskCallback>>> {
        let Some(record) = self.load(txn, name)? else {
            return Ok(None);
        };
        let spec = match record.target {
            CallbackTarget::Owned(spec) => spec,
            CallbackTarget::Referenced { binding } => match self.store.get_binding(txn, &binding)? {
                Some(value) => serde_json::from_value(value).map_err(|e| {
                    TaskError::Serialization(format!(
                        "Binding '{}' does not hold a callback: {}",
                        binding, e
                    ))
                })?,
                None => {
                    event!(Level::DEBUG, record = %name, binding = %binding, "callback target removed");
                    return Ok(None);
                }
            },
        };
        self.catalog.instantiate(&spec).map(Some)
    }

    /// Removes the record. Removing a missing record is a no-op.
    pub fn delete(&self, txn: &Transaction, name: &str) -> Result<()> {
        if self.store.remove_binding(txn, name)? {
            event!(Level::DEBUG, record = %name, "pending callback removed");
        }
        Ok(())
    }

    /// Lazily lists every record name in `node`'s namespace, in order.
    pub fn list_namespace<'a>(&'a self, txn: &'a Transaction, node: &NodeId) -> NamespaceScan<'a> {
        NamespaceScan {
            store: self.store.as_ref(),
            txn,
            prefix: self.namespace(node),
            cursor: None,
            done: false,
        }
    }

    /// Moves the record to a fresh name in the local namespace, keeping its
    /// contents. Returns the new name and the record, or `None` if the
    /// record no longer exists.
    pub fn migrate(&self, txn: &Transaction, name: &str) -> Result<Option<(String, PendingCallbackRecord)>> {
        let Some(value) = self.store.get_binding(txn, name)? else {
            return Ok(None);
        };
        let record = PendingCallbackRecord::from_value(value.clone())?;
        let new_name = self.next_local_name();
        self.store.remove_binding(txn, name)?;
        self.store.set_binding(txn, &new_name, value)?;
        event!(Level::DEBUG, from = %name, to = %new_name, "pending callback migrated");
        Ok(Some((new_name, record)))
    }
}

pub(crate) fn namespace_prefix(root: &str, node: &NodeId) -> String {
    format!("{}{}.", root, node)
}

/// One-shot ordered scan of a namespace. Restarting means listing again.
pub struct NamespaceScan<'a> {
    store: &'a dyn DataStore,
    txn: &'a Transaction,
    prefix: String,
    cursor: Option<String>,
    done: bool,
}

impl Iterator for NamespaceScan<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let after = self.cursor.as_deref().unwrap_or(self.prefix.as_str());
        match self.store.next_bound_name(self.txn, Some(after)) {
            Ok(Some(name)) if name.starts_with(&self.prefix) => {
                self.cursor = Some(name.clone());
                Some(Ok(name))
            }
            Ok(_) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
