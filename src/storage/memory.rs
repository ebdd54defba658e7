use super::DataStore;
use super::persistence::{BindingWrite, Bindings, DurabilityMode, PersistenceManager, WalEntry};
use crate::core::{Result, TaskError};
use crate::transaction::{Transaction, TransactionId, TransactionParticipant};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use tracing::{Level, event};

/// Reads and buffered writes of one transaction.
#[derive(Default)]
struct WriteSet {
    /// Version of every name the transaction looked at (0 = never bound).
    observed: HashMap<String, u64>,
    /// `None` marks a removal.
    writes: BTreeMap<String, Option<serde_json::Value>>,
}

struct StoreState {
    committed: Bindings,
    /// Last committed version of every bound name. Removal drops the entry;
    /// versions are never reused, so a rebind still differs from what an
    /// earlier reader saw.
    versions: HashMap<String, u64>,
    next_version: u64,
    pending: HashMap<TransactionId, WriteSet>,
}

impl StoreState {
    fn version_of(&self, name: &str) -> u64 {
        self.versions.get(name).copied().unwrap_or(0)
    }
}

/// Optimistic transactional binding store.
///
/// Writes are buffered per transaction and applied at commit, after checking
/// that nothing the transaction read has been changed by a concurrent commit.
/// A failed check vetoes the commit with a retryable
/// [`TaskError::Conflict`]. With a data directory every commit is logged to
/// the WAL before it becomes visible.
pub struct MemoryDataStore {
    state: Mutex<StoreState>,
    persistence: Option<Mutex<PersistenceManager>>,
    self_ref: Weak<MemoryDataStore>,
}

impl MemoryDataStore {
    /// Store without any on-disk state.
    pub fn in_memory() -> Arc<Self> {
        Self::build(Bindings::new(), None)
    }

    /// Opens (or creates) a store persisted under `data_dir`, replaying the
    /// last snapshot and the WAL.
    pub fn open<P: AsRef<Path>>(
        data_dir: P,
        durability: DurabilityMode,
        checkpoint_threshold: usize,
    ) -> Result<Arc<Self>> {
        let mut persistence = PersistenceManager::new(data_dir.as_ref(), durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(checkpoint_threshold);
        let committed = persistence.recover()?;
        event!(
            Level::INFO,
            dir = %data_dir.as_ref().display(),
            bindings = committed.len(),
            "binding store recovered"
        );
        Ok(Self::build(committed, Some(persistence)))
    }

    fn build(committed: Bindings, persistence: Option<PersistenceManager>) -> Arc<Self> {
        let mut versions = HashMap::with_capacity(committed.len());
        for name in committed.keys() {
            versions.insert(name.clone(), 1);
        }
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(StoreState {
                committed,
                versions,
                next_version: 2,
                pending: HashMap::new(),
            }),
            persistence: persistence.map(Mutex::new),
            self_ref: self_ref.clone(),
        })
    }

    fn enlist(&self, txn: &Transaction) -> Result<()> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| TaskError::Storage("binding store has been dropped".into()))?;
        txn.join(this)
    }

    /// Committed names starting with `prefix`, in order. Reads outside any
    /// transaction.
    pub fn committed_names(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock()?;
        Ok(state
            .committed
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    pub fn committed_value(&self, name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.state.lock()?.committed.get(name).cloned())
    }

    pub fn binding_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.committed.len())
    }

    /// Writes a snapshot of the committed bindings and truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let state = self.state.lock()?;
        persistence.lock()?.checkpoint(&state.committed)?;
        event!(Level::INFO, bindings = state.committed.len(), "binding store checkpointed");
        Ok(())
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }
}

impl DataStore for MemoryDataStore {
    fn get_binding(&self, txn: &Transaction, name: &str) -> Result<Option<serde_json::Value>> {
        self.enlist(txn)?;
        let mut state = self.state.lock()?;
        let version = state.version_of(name);
        let committed = state.committed.get(name).cloned();
        let write_set = state.pending.entry(txn.id()).or_default();
        if let Some(buffered) = write_set.writes.get(name) {
            return Ok(buffered.clone());
        }
        write_set.observed.entry(name.to_string()).or_insert(version);
        Ok(committed)
    }

    fn set_binding(&self, txn: &Transaction, name: &str, value: serde_json::Value) -> Result<()> {
        self.enlist(txn)?;
        let mut state = self.state.lock()?;
        state
            .pending
            .entry(txn.id())
            .or_default()
            .writes
            .insert(name.to_string(), Some(value));
        Ok(())
    }

    fn remove_binding(&self, txn: &Transaction, name: &str) -> Result<bool> {
        let existed = self.get_binding(txn, name)?.is_some();
        let mut state = self.state.lock()?;
        state
            .pending
            .entry(txn.id())
            .or_default()
            .writes
            .insert(name.to_string(), None);
        Ok(existed)
    }

    fn next_bound_name(&self, txn: &Transaction, after: Option<&str>) -> Result<Option<String>> {
        self.enlist(txn)?;
        let mut state = self.state.lock()?;
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };

        let write_set = state.pending.get(&txn.id());
        let removed = |name: &String| {
            write_set.is_some_and(|ws| matches!(ws.writes.get(name), Some(None)))
        };

        let committed_next = state
            .committed
            .range((lower.clone(), Bound::Unbounded))
            .map(|(name, _)| name)
            .find(|name| !removed(*name))
            .cloned();
        let written_next = write_set.and_then(|ws| {
            ws.writes
                .range((lower, Bound::Unbounded))
                .find(|(_, value)| value.is_some())
                .map(|(name, _)| name.clone())
        });

        let next = match (committed_next, written_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(name) = &next {
            let version = state.version_of(name);
            state
                .pending
                .entry(txn.id())
                .or_default()
                .observed
                .entry(name.clone())
                .or_insert(version);
        }
        Ok(next)
    }
}

impl TransactionParticipant for MemoryDataStore {
    fn name(&self) -> &str {
        "memory-data-store"
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn prepare(&self, txn: &Transaction) -> Result<()> {
        let state = self.state.lock()?;
        let Some(write_set) = state.pending.get(&txn.id()) else {
            return Ok(());
        };
        for (name, seen) in &write_set.observed {
            if state.version_of(name) != *seen {
                return Err(TaskError::Conflict(format!(
                    "binding '{}' changed since transaction {} read it",
                    name,
                    txn.id()
                )));
            }
        }
        Ok(())
    }

    fn prepare_and_commit(&self, txn: &Transaction) -> Result<()> {
        let mut state = self.state.lock()?;
        let Some(write_set) = state.pending.remove(&txn.id()) else {
            return Ok(());
        };
        for (name, seen) in &write_set.observed {
            if state.version_of(name) != *seen {
                return Err(TaskError::Conflict(format!(
                    "binding '{}' changed since transaction {} read it",
                    name,
                    txn.id()
                )));
            }
        }
        if write_set.writes.is_empty() {
            return Ok(());
        }

        let entry = WalEntry {
            txn_id: txn.id().as_u64(),
            writes: write_set
                .writes
                .iter()
                .map(|(name, value)| match value {
                    Some(value) => BindingWrite::Set {
                        name: name.clone(),
                        value: value.clone(),
                    },
                    None => BindingWrite::Remove { name: name.clone() },
                })
                .collect(),
        };
        if let Some(persistence) = &self.persistence {
            persistence.lock()?.log(&entry)?;
        }

        for (name, value) in write_set.writes {
            match value {
                Some(value) => {
                    let version = state.next_version;
                    state.next_version += 1;
                    state.versions.insert(name.clone(), version);
                    state.committed.insert(name, value);
                }
                None => {
                    state.versions.remove(&name);
                    state.committed.remove(&name);
                }
            }
        }

        if let Some(persistence) = &self.persistence {
            let mut persistence = persistence.lock()?;
            if persistence.needs_checkpoint() {
                if let Err(err) = persistence.checkpoint(&state.committed) {
                    event!(Level::ERROR, error = %err, "automatic checkpoint failed");
                }
            }
        }
        Ok(())
    }

    fn commit(&self, txn: &Transaction) {
        // Durable participants commit through prepare_and_commit.
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(&txn.id());
        }
    }

    fn abort(&self, txn: &Transaction, _retryable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(&txn.id());
        }
    }
}
