use crate::data_store::DataStore;
use crate::StorageError;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::NamedTempFile;

/// Durable home of a [`DataStore`] snapshot.
pub trait Persistence: Send + Sync {
    /// Read the last persisted snapshot, `None` if nothing was written yet.
    fn load(&self) -> Result<Option<DataStore>, StorageError>;

    fn persist(&self, store: &DataStore) -> Result<(), StorageError>;
}

/// Stores the snapshot as a JSON document, replaced atomically on each write.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<store_name>.json`
    pub fn in_dir(dir: &Path, store_name: &str) -> Self {
        Self::new(dir.join(format!("{store_name}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<DataStore>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&self.path)?;
        let store = serde_json::from_slice(&raw)?;
        Ok(Some(store))
    }

    fn persist(&self, store: &DataStore) -> Result<(), StorageError> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        let encoded = serde_json::to_vec(store)?;
        let mut temp = NamedTempFile::new_in(&parent)?;
        temp.write_all(&encoded)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

/// Keeps the last snapshot in memory and counts writes.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshot: Mutex<Option<DataStore>>,
    writes: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(store: DataStore) -> Self {
        Self {
            snapshot: Mutex::new(Some(store)),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<DataStore> {
        self.snapshot.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Option<DataStore>, StorageError> {
        Ok(self.snapshot.lock().clone())
    }

    fn persist(&self, store: &DataStore) -> Result<(), StorageError> {
        *self.snapshot.lock() = Some(store.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
