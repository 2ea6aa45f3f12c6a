//! Durable storage for execution records.
//!
//! Every record lives under its instruction id together with a bounded stack of
//! prior revisions. Updates are optimistic: the mutator runs against a snapshot
//! without holding any lock, and the result is committed only if the stored
//! revision is still the one the snapshot was taken from. A conflicting commit
//! re-reads and re-applies the mutator up to the configured retry count.
//!
//! [`JsonRecordStore`] keeps one `{id}.json` file per record and replaces it
//! atomically (temporary file, `fsync`, rename). [`InMemoryRecordStore`] keeps
//! the same semantics in memory for tests and ephemeral runs.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use cadence_types::{ExecutionRecord, RecordError, RecordFilter, is_valid_instruction_id};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{DEFAULT_STORE_CONFLICT_RETRIES, EngineConfig};

/// Number of prior revisions retained per record for rollback.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

const RECORD_EXTENSION: &str = "json";

/// Mutation applied to a record snapshot; may run more than once on conflict.
pub type RecordMutator<'a> = dyn FnMut(&mut ExecutionRecord) -> Result<(), RecordError> + 'a;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no execution record '{id}'")]
    NotFound { id: String },

    #[error("execution record '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("'{id}' is not a valid record id")]
    InvalidId { id: String },

    #[error("execution record '{id}' was modified concurrently; gave up after {attempts} attempts")]
    ConcurrentUpdate { id: String, attempts: u32 },

    #[error("'{name}' is not a valid capability name")]
    InvalidCapabilityName { name: String },

    #[error("execution record '{id}' has no previous revision")]
    NoPreviousRevision { id: String },

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Storage abstraction for execution records.
pub trait RecordStore: Send + Sync {
    /// Persist a brand-new record at revision 1.
    fn create(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StoreError>;

    /// Current revision of a record.
    fn get(&self, id: &str) -> Result<ExecutionRecord, StoreError>;

    /// Read-modify-write with conflict detection; returns the committed record.
    fn update(&self, id: &str, mutator: &mut RecordMutator<'_>) -> Result<ExecutionRecord, StoreError>;

    /// Records matching `filter`, newest first.
    fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Restore the previous revision under a new, higher revision number.
    fn rollback(&self, id: &str) -> Result<ExecutionRecord, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordFile {
    current: ExecutionRecord,
    #[serde(default)]
    history: Vec<ExecutionRecord>,
}

impl RecordFile {
    fn push_history(&mut self, previous: ExecutionRecord, limit: usize) {
        self.history.push(previous);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

/// Where record files physically live. Commits happen under `commit_guard`.
trait RecordBackend {
    type Guard<'a>
    where
        Self: 'a;

    fn commit_guard(&self) -> Self::Guard<'_>;
    fn load(&self, id: &str) -> Result<Option<RecordFile>, StoreError>;
    fn save(&self, id: &str, file: &RecordFile) -> Result<(), StoreError>;
    fn ids(&self) -> Result<Vec<String>, StoreError>;
}

fn create_record<B: RecordBackend>(backend: &B, mut record: ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
    ensure_valid_id(&record.id)?;
    let _guard = backend.commit_guard();
    if backend.load(&record.id)?.is_some() {
        return Err(StoreError::AlreadyExists { id: record.id });
    }
    record.revision = 1;
    record.updated_at = Utc::now();
    let file = RecordFile {
        current: record,
        history: Vec::new(),
    };
    backend.save(&file.current.id, &file)?;
    Ok(file.current)
}

fn load_current<B: RecordBackend>(backend: &B, id: &str) -> Result<RecordFile, StoreError> {
    ensure_valid_id(id)?;
    backend.load(id)?.ok_or_else(|| StoreError::NotFound { id: id.to_string() })
}

fn update_record<B: RecordBackend>(
    backend: &B,
    id: &str,
    conflict_retries: u32,
    history_limit: usize,
    mutator: &mut RecordMutator<'_>,
) -> Result<ExecutionRecord, StoreError> {
    let max_attempts = conflict_retries.saturating_add(1);
    for attempt in 1..=max_attempts {
        let snapshot = load_current(backend, id)?;
        let base_revision = snapshot.current.revision;
        let mut next = snapshot.current.clone();
        mutator(&mut next)?;

        let _guard = backend.commit_guard();
        let mut latest = load_current(backend, id)?;
        if latest.current.revision != base_revision {
            debug!(
                instruction_id = id,
                revision = base_revision,
                stored_revision = latest.current.revision,
                attempt,
                "record revision moved during update; retrying"
            );
            continue;
        }

        next.id = latest.current.id.clone();
        next.revision = base_revision + 1;
        next.updated_at = Utc::now();
        let previous = std::mem::replace(&mut latest.current, next);
        latest.push_history(previous, history_limit);
        backend.save(id, &latest)?;
        return Ok(latest.current);
    }

    warn!(instruction_id = id, attempts = max_attempts, "record update abandoned after repeated conflicts");
    Err(StoreError::ConcurrentUpdate {
        id: id.to_string(),
        attempts: max_attempts,
    })
}

fn rollback_record<B: RecordBackend>(backend: &B, id: &str) -> Result<ExecutionRecord, StoreError> {
    let _guard = backend.commit_guard();
    let mut file = load_current(backend, id)?;
    let mut restored = file.history.pop().ok_or_else(|| StoreError::NoPreviousRevision { id: id.to_string() })?;
    restored.revision = file.current.revision + 1;
    restored.updated_at = Utc::now();
    debug!(instruction_id = id, revision = restored.revision, "rolled back execution record");
    file.current = restored;
    backend.save(id, &file)?;
    Ok(file.current)
}

fn list_records<B: RecordBackend>(backend: &B, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
    let mut records = Vec::new();
    for id in backend.ids()? {
        if let Some(file) = backend.load(&id)?
            && filter.matches(&file.current)
        {
            records.push(file.current);
        }
    }
    records.sort_by(|left, right| right.created_at.cmp(&left.created_at).then_with(|| left.id.cmp(&right.id)));
    Ok(records)
}

fn ensure_valid_id(id: &str) -> Result<(), StoreError> {
    if is_valid_instruction_id(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidId { id: id.to_string() })
    }
}

/// Directory-backed store with one JSON file per record.
#[derive(Debug)]
pub struct JsonRecordStore {
    directory: PathBuf,
    conflict_retries: u32,
    history_limit: usize,
    commit_lock: Mutex<()>,
}

impl JsonRecordStore {
    /// Open (creating if needed) a store rooted at `directory`.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            conflict_retries: DEFAULT_STORE_CONFLICT_RETRIES,
            history_limit: DEFAULT_HISTORY_LIMIT,
            commit_lock: Mutex::new(()),
        })
    }

    /// Open the store configured by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, StoreError> {
        Ok(Self::open(&config.state_dir)?.with_conflict_retries(config.store_conflict_retries))
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{id}.{RECORD_EXTENSION}"))
    }

}

/// Replace `path` inside `directory` with `content` via a synced temporary file.
pub(crate) fn write_atomic(directory: &Path, path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let temporary_path = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
    {
        let mut file = File::create(&temporary_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&temporary_path, path)?;
    sync_directory(directory)?;
    Ok(())
}

#[cfg(unix)]
fn sync_directory(directory: &Path) -> Result<(), StoreError> {
    File::open(directory)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_directory: &Path) -> Result<(), StoreError> {
    Ok(())
}

impl RecordBackend for JsonRecordStore {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn commit_guard(&self) -> Self::Guard<'_> {
        self.commit_lock.lock().expect("record store commit lock poisoned")
    }

    fn load(&self, id: &str) -> Result<Option<RecordFile>, StoreError> {
        match fs::read(self.record_path(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn save(&self, id: &str, file: &RecordFile) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(file)?;
        write_atomic(&self.directory, &self.record_path(id), &content)
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(error) => return Err(error.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                && is_valid_instruction_id(stem)
            {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }
}

impl RecordStore for JsonRecordStore {
    fn create(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
        create_record(self, record)
    }

    fn get(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        Ok(load_current(self, id)?.current)
    }

    fn update(&self, id: &str, mutator: &mut RecordMutator<'_>) -> Result<ExecutionRecord, StoreError> {
        update_record(self, id, self.conflict_retries, self.history_limit, mutator)
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        list_records(self, filter)
    }

    fn rollback(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        rollback_record(self, id)
    }
}

/// In-memory store used for tests and ephemeral runs.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    files: Mutex<HashMap<String, RecordFile>>,
    conflict_retries: u32,
    commit_lock: Mutex<()>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            conflict_retries: DEFAULT_STORE_CONFLICT_RETRIES,
            commit_lock: Mutex::new(()),
        }
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }
}

impl RecordBackend for InMemoryRecordStore {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn commit_guard(&self) -> Self::Guard<'_> {
        self.commit_lock.lock().expect("record store commit lock poisoned")
    }

    fn load(&self, id: &str) -> Result<Option<RecordFile>, StoreError> {
        Ok(self.files.lock().expect("record store lock poisoned").get(id).cloned())
    }

    fn save(&self, id: &str, file: &RecordFile) -> Result<(), StoreError> {
        self.files
            .lock()
            .expect("record store lock poisoned")
            .insert(id.to_string(), file.clone());
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.files.lock().expect("record store lock poisoned").keys().cloned().collect())
    }
}

impl RecordStore for InMemoryRecordStore {
    fn create(&self, record: ExecutionRecord) -> Result<ExecutionRecord, StoreError> {
        create_record(self, record)
    }

    fn get(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        Ok(load_current(self, id)?.current)
    }

    fn update(&self, id: &str, mutator: &mut RecordMutator<'_>) -> Result<ExecutionRecord, StoreError> {
        update_record(self, id, self.conflict_retries, DEFAULT_HISTORY_LIMIT, mutator)
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        list_records(self, filter)
    }

    fn rollback(&self, id: &str) -> Result<ExecutionRecord, StoreError> {
        rollback_record(self, id)
    }
}
