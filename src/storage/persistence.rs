//! Write-Ahead Logging (WAL) and snapshot persistence for the binding store

use crate::core::{Result, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{Level, event};

pub type Bindings = BTreeMap<String, serde_json::Value>;

const WAL_FILE: &str = "memotask.wal";
const SNAPSHOT_FILE: &str = "memotask.snapshot";

// ============================================================================
// WAL Entry Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BindingWrite {
    Set { name: String, value: serde_json::Value },
    Remove { name: String },
}

/// Write-Ahead Log entry: the full write set of one committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub txn_id: u64,
    pub writes: Vec<BindingWrite>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// Store Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub bindings: Bindings,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: u64,
    pub binding_count: usize,
}

impl StoreSnapshot {
    pub fn new(bindings: Bindings) -> Self {
        let binding_count = bindings.len();
        Self {
            version: 1,
            bindings,
            metadata: SnapshotMetadata {
                created_at: unix_millis(),
                binding_count,
            },
        }
    }
}

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurabilityMode {
    /// Every commit is fsynced before it is acknowledged.
    #[default]
    Sync,
    /// Commits are flushed to the OS but not fsynced.
    Async,
    /// Nothing is written to disk.
    None,
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TaskError::Storage(format!("Failed to create WAL directory: {}", e))
            })?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| TaskError::Storage(format!("Failed to open WAL file: {}", e)))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| TaskError::Storage("WAL file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(entry)
            .map_err(|e| TaskError::Serialization(format!("Failed to serialize WAL entry: {}", e)))?;
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes())
            .map_err(|e| TaskError::Storage(format!("Failed to write WAL: {}", e)))?;
        file.write_all(&serialized)
            .map_err(|e| TaskError::Storage(format!("Failed to write WAL: {}", e)))?;
        file.flush()
            .map_err(|e| TaskError::Storage(format!("Failed to flush WAL: {}", e)))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| TaskError::Storage(format!("Failed to sync WAL: {}", e)))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Reads every complete entry. A torn entry at the tail (crash during
    /// append) ends the log.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| TaskError::Storage(format!("Failed to open WAL for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(TaskError::Storage(format!(
                        "Failed to read WAL entry length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    event!(
                        Level::WARN,
                        wal = %self.wal_path.display(),
                        recovered = entries.len(),
                        "ignoring torn WAL entry at end of log"
                    );
                    break;
                }
                Err(e) => {
                    return Err(TaskError::Storage(format!(
                        "Failed to read WAL entry data: {}",
                        e
                    )));
                }
            }
            let entry: WalEntry = rmp_serde::from_slice(&data).map_err(|e| {
                TaskError::Serialization(format!("Failed to deserialize WAL entry: {}", e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| TaskError::Storage(format!("Failed to truncate WAL: {}", e)))?;
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.wal_path)
            .map_err(|e| TaskError::Storage(format!("Failed to reopen WAL: {}", e)))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold.max(1);
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Writes the snapshot to a temporary file next to the target and
    /// renames it into place.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = self
            .snapshot_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir).map_err(|e| {
            TaskError::Storage(format!("Failed to create snapshot directory: {}", e))
        })?;
        let serialized = rmp_serde::to_vec(snapshot)
            .map_err(|e| TaskError::Serialization(format!("Failed to serialize snapshot: {}", e)))?;
        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| TaskError::Storage(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| TaskError::Storage(format!("Failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| TaskError::Storage(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| TaskError::Storage(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| TaskError::Storage(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| TaskError::Storage(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            TaskError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        Ok(Some(snapshot))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(data_dir.join(WAL_FILE), durability_mode)?;
        let snapshot = SnapshotManager::new(data_dir.join(SNAPSHOT_FILE));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn checkpoint(&mut self, bindings: &Bindings) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.snapshot.save(&StoreSnapshot::new(bindings.clone()))?;
        self.wal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    /// Rebuilds the committed bindings from the snapshot plus the log.
    pub fn recover(&self) -> Result<Bindings> {
        let mut bindings = match self.snapshot.load()? {
            Some(snapshot) => snapshot.bindings,
            None => Bindings::new(),
        };
        for entry in self.wal.read_all()? {
            for write in entry.writes {
                match write {
                    BindingWrite::Set { name, value } => {
                        bindings.insert(name, value);
                    }
                    BindingWrite::Remove { name } => {
                        bindings.remove(&name);
                    }
                }
            }
        }
        Ok(bindings)
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }
    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }
    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }
    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }
}
