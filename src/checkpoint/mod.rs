//! Durable key -> watermark mapping.
//!
//! Stores are last-write-wins: `update` replaces whatever was stored, even a
//! larger value. Monotonicity is the caller's job; connectors only ever commit
//! the maximum of rows strictly newer than the previous watermark.

mod file;
mod memory;
mod sqlite;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use std::path::Path;
use std::sync::Arc;

use crate::domain::Checkpoint;
use crate::error::CheckpointError;

/// Storage contract for checkpoints.
///
/// `update` is atomic with respect to crashes: if it has not returned, the
/// next `get` observes the old value; once it returns, the new one.
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync {
    /// Last committed watermark for `key`, `None` if never committed.
    fn get(&self, key: &str) -> Result<Option<String>, CheckpointError>;

    /// Durably replace the watermark for `key`.
    fn update(&self, key: &str, value: &str) -> Result<(), CheckpointError>;

    /// Every committed checkpoint, ordered by key.
    fn entries(&self) -> Result<Vec<Checkpoint>, CheckpointError>;
}

/// Which backend a pipeline persists checkpoints in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    Sqlite,
    File,
}

/// Run a store call on the blocking pool; stores do synchronous I/O.
pub async fn blocking<T, F>(store: &Arc<dyn CheckpointStore>, call: F) -> Result<T, CheckpointError>
where
    T: Send + 'static,
    F: FnOnce(&dyn CheckpointStore) -> Result<T, CheckpointError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|e| CheckpointError::Backend(format!("checkpoint task failed: {e}")))?
}

pub fn open(backend: CheckpointBackend, path: &Path) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    Ok(match backend {
        CheckpointBackend::Sqlite => Arc::new(SqliteCheckpointStore::open(path)?),
        CheckpointBackend::File => Arc::new(FileCheckpointStore::open(path)?),
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn blocking_calls_reach_the_store() {
        let dir = tempdir().unwrap();
        let store = open(CheckpointBackend::File, &dir.path().join("checkpoints.json")).unwrap();

        blocking(&store, |s| s.update("erp.orders", "9")).await.unwrap();
        let value = blocking(&store, |s| s.get("erp.orders")).await.unwrap();

        assert_eq!(value.as_deref(), Some("9"));
    }
}
