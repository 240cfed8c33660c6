//! Persisted state of each unit's last successful execution

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheKey, OriginMetadata};
use crate::fingerprint::FileCollectionFingerprint;
use crate::hash::Digest;
use crate::unit::UnitId;

/// Snapshot of the last successful execution of a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousExecutionState {
    pub unit: UnitId,
    /// Digest of the implementation identity
    pub implementation: Digest,
    /// Digest of each scalar input's canonical JSON
    pub scalar_inputs: BTreeMap<String, Digest>,
    pub input_files: BTreeMap<String, FileCollectionFingerprint>,
    pub output_files: BTreeMap<String, FileCollectionFingerprint>,
    /// Cache key the outputs were produced or loaded under
    pub cache_key: Option<CacheKey>,
    pub origin: OriginMetadata,
    pub recorded_at: DateTime<Utc>,
}

/// History persistence errors
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt history record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("history of {0} is already checked out by another attempt")]
    AlreadyCheckedOut(UnitId),
}

/// Read and write access to previous execution states
pub trait ExecutionHistory: Send + Sync {
    fn load(&self, unit: &UnitId) -> Result<Option<PreviousExecutionState>, HistoryError>;

    /// Replace the record for `state.unit`
    fn store(&self, state: &PreviousExecutionState) -> Result<(), HistoryError>;

    /// Remove a record, returning whether one existed
    fn remove(&self, unit: &UnitId) -> Result<bool, HistoryError>;

    fn list(&self) -> Result<Vec<PreviousExecutionState>, HistoryError>;

    /// Remove every record
    fn clear(&self) -> Result<usize, HistoryError> {
        let mut removed = 0;
        for state in self.list()? {
            if self.remove(&state.unit)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One JSON file per unit in a directory
#[derive(Debug, Clone)]
pub struct FileExecutionHistory {
    dir: PathBuf,
}

impl FileExecutionHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, unit: &UnitId) -> PathBuf {
        let name = Digest::of(unit.to_string().as_bytes());
        self.dir.join(format!("{}.json", name))
    }

    fn read(path: &Path) -> Result<PreviousExecutionState, HistoryError> {
        let content = fs::read_to_string(path).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| HistoryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ExecutionHistory for FileExecutionHistory {
    fn load(&self, unit: &UnitId) -> Result<Option<PreviousExecutionState>, HistoryError> {
        let path = self.record_path(unit);
        if !path.exists() {
            return Ok(None);
        }
        let state = Self::read(&path)?;
        debug!(unit = %unit, recorded_at = %state.recorded_at, "loaded execution history");
        Ok(Some(state))
    }

    fn store(&self, state: &PreviousExecutionState) -> Result<(), HistoryError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| HistoryError::Io { path, source }
        };
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let path = self.record_path(&state.unit);
        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(state).map_err(|source| HistoryError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&tmp, json).map_err(io_error(&tmp))?;
        if let Err(source) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(HistoryError::Io { path, source });
        }
        debug!(unit = %state.unit, "stored execution history");
        Ok(())
    }

    fn remove(&self, unit: &UnitId) -> Result<bool, HistoryError> {
        let path = self.record_path(unit);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(HistoryError::Io { path, source }),
        }
    }

    fn list(&self) -> Result<Vec<PreviousExecutionState>, HistoryError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| HistoryError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut states = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match Self::read(&path) {
                    Ok(state) => states.push(state),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable history record"),
                }
            }
        }
        states.sort_by(|a, b| a.unit.cmp(&b.unit));
        Ok(states)
    }
}

/// History kept in memory for a single process
#[derive(Debug, Default)]
pub struct InMemoryExecutionHistory {
    records: Mutex<HashMap<UnitId, PreviousExecutionState>>,
}

impl InMemoryExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionHistory for InMemoryExecutionHistory {
    fn load(&self, unit: &UnitId) -> Result<Option<PreviousExecutionState>, HistoryError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(unit).cloned())
    }

    fn store(&self, state: &PreviousExecutionState) -> Result<(), HistoryError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(state.unit.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, unit: &UnitId) -> Result<bool, HistoryError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.remove(unit).is_some())
    }

    fn list(&self) -> Result<Vec<PreviousExecutionState>, HistoryError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut states: Vec<_> = records.values().cloned().collect();
        states.sort_by(|a, b| a.unit.cmp(&b.unit));
        Ok(states)
    }
}

/// Tracks which unit histories are held by a running attempt
#[derive(Debug, Default)]
pub struct HistoryCheckouts {
    held: Mutex<HashSet<UnitId>>,
}

impl HistoryCheckouts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Check out the history record of `unit` until the returned guard drops
    pub fn checkout(self: &Arc<Self>, unit: &UnitId) -> Result<HistoryCheckout, HistoryError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(unit.clone()) {
            return Err(HistoryError::AlreadyCheckedOut(unit.clone()));
        }
        Ok(HistoryCheckout {
            owner: Arc::clone(self),
            unit: unit.clone(),
        })
    }

    pub fn is_checked_out(&self, unit: &UnitId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(unit)
    }
}

/// Exclusive hold on one unit's history record
#[derive(Debug)]
pub struct HistoryCheckout {
    owner: Arc<HistoryCheckouts>,
    unit: UnitId,
}

impl HistoryCheckout {
    pub fn unit(&self) -> &UnitId {
        &self.unit
    }
}

impl Drop for HistoryCheckout {
    fn drop(&mut self) {
        self.owner
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.unit);
    }
}
