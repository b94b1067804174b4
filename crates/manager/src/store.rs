//! Durable storage of transfer records.
//!
//! [`JsonFileStore`] keeps one JSON file per record and survives process
//! restarts; [`MemoryStore`] is for tests and short-lived managers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use blobxfer_transfer::{TransferError, TransferRecord};

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        TransferError::Store(e.to_string())
    }
}

/// Create/read/update/delete access to persisted transfer records.
///
/// Writes to different records may happen concurrently; callers serialize
/// writes to the same record.
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces a record.
    fn put(&self, record: &TransferRecord) -> Result<(), StoreError>;

    fn get(&self, id: Uuid) -> Result<Option<TransferRecord>, StoreError>;

    /// Removes a record. Removing an unknown id is not an error.
    fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// All records, oldest first.
    fn list(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Records matching `predicate`, oldest first.
    fn query(
        &self,
        predicate: &dyn Fn(&TransferRecord) -> bool,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.list()?.into_iter().filter(|r| predicate(r)).collect())
    }
}

fn sorted(records: impl Iterator<Item = TransferRecord>) -> Vec<TransferRecord> {
    let mut records: Vec<_> = records.collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    records
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Non-durable store.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, TransferRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, record: &TransferRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sorted(map.values().cloned()))
    }
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Persistent store with one pretty-printed `<id>.json` file per record.
///
/// Records are cached in memory and every write goes to a temporary file
/// that is then renamed over the record's file.
pub struct JsonFileStore {
    dir: PathBuf,
    records: RwLock<HashMap<Uuid, TransferRecord>>,
}

impl JsonFileStore {
    /// Opens a store directory, creating it if needed and loading every
    /// readable record in it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let records = load_records(&dir)?;
        Ok(Self {
            dir,
            records: RwLock::new(records),
        })
    }

    /// Opens the store in the default per-user location.
    pub fn open_default() -> Result<Self, StoreError> {
        let dir = default_store_dir().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no configuration directory for this platform",
            )
        })?;
        Self::open(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_record(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(record)?;
        let path = self.record_path(record.id);
        let tmp = self.dir.join(format!("{}.json.tmp", record.id));
        if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, &path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(transfer = %record.id, state = %record.state, "persisted record to {:?}", path);
        Ok(())
    }
}

impl RecordStore for JsonFileStore {
    fn put(&self, record: &TransferRecord) -> Result<(), StoreError> {
        self.write_record(record)?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned())
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        debug!(transfer = %id, "deleted record");
        Ok(())
    }

    fn list(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sorted(map.values().cloned()))
    }
}

/// Loads every `*.json` record in `dir`. Unreadable files are skipped.
fn load_records(dir: &Path) -> Result<HashMap<Uuid, TransferRecord>, StoreError> {
    let mut records = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(StoreError::from)
            .and_then(|data| Ok(serde_json::from_str::<TransferRecord>(&data)?));
        match parsed {
            Ok(record) => {
                records.insert(record.id, record);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable transfer record"),
        }
    }
    debug!("loaded {} record(s) from {:?}", records.len(), dir);
    Ok(records)
}

/// Returns the default record directory: `<config>/blobxfer/transfers`.
pub fn default_store_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("blobxfer").join("transfers"))
}

/// Returns the platform-specific config directory.
pub(crate) fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
