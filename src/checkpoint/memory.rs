use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;

use super::CheckpointStore;
use crate::domain::Checkpoint;
use crate::error::CheckpointError;

/// Process-local store for tests and dry runs. Not durable.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: Mutex<BTreeMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        let entries = self.entries.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(entries.get(key).map(|c| c.value.clone()))
    }

    fn update(&self, key: &str, value: &str) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        entries.insert(
            key.to_string(),
            Checkpoint {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let entries = self.entries.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(entries.values().cloned().collect())
    }
}
