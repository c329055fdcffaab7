use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use super::CheckpointStore;
use crate::domain::Checkpoint;
use crate::error::CheckpointError;

/// Checkpoints kept as one JSON document.
///
/// Every update rewrites the whole map into a temporary file, fsyncs it and
/// renames it over the previous document.
pub struct FileCheckpointStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        };
        // Surface a corrupt document at startup instead of at first export.
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<BTreeMap<String, Checkpoint>, CheckpointError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn persist(&self, entries: &BTreeMap<String, Checkpoint>) -> Result<(), CheckpointError> {
        let tmp = crate::dataset::temp_sibling(&self.path);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let body = serde_json::to_vec_pretty(entries)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
            _ => sync_dir(Path::new(".")),
        }
    }
}

/// Flush a directory entry so a completed rename survives a crash.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CheckpointError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CheckpointError> {
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        let _guard = self.lock.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(self.load()?.get(key).map(|c| c.value.clone()))
    }

    fn update(&self, key: &str, value: &str) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        let mut entries = self.load()?;
        entries.insert(
            key.to_string(),
            Checkpoint {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Some(Utc::now()),
            },
        );
        self.persist(&entries)
    }

    fn entries(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let _guard = self.lock.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(self.load()?.into_values().collect())
    }
}
