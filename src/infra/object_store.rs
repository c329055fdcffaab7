use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::app::ports::ObjectStoreClient;
use crate::error::PublishError;

/// Object store backed by a local directory tree. Published objects are
/// addressed as `file://` URIs.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Keys stay under the root: no absolute paths, no `..`.
    fn object_path(&self, remote_path: &str) -> Option<PathBuf> {
        let key = Path::new(remote_path.trim_start_matches('/'));
        let safe = key
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        (safe && !remote_path.trim().is_empty()).then(|| self.root.join(key))
    }
}

/// Local path of a `file://` URI.
pub fn local_path(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[async_trait]
impl ObjectStoreClient for LocalObjectStore {
    async fn upload(&self, local: &Path, remote_path: &str) -> Result<String, PublishError> {
        let fail = |message: String| PublishError::Upload {
            local: local.to_path_buf(),
            remote: remote_path.to_string(),
            message,
        };
        let dest = self
            .object_path(remote_path)
            .ok_or_else(|| fail("object key escapes the store root".to_string()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| fail(e.to_string()))?;
        }
        // Copy beside the destination, then rename: readers never see a torn object.
        let tmp = dest.with_file_name(format!(".{}.upload", uuid::Uuid::new_v4()));
        fs::copy(local, &tmp).await.map_err(|e| fail(e.to_string()))?;
        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(fail(e.to_string()));
        }
        Ok(file_uri(&dest))
    }

    fn locate(&self, remote_path: &str) -> String {
        file_uri(&self.root.join(remote_path.trim_start_matches('/')))
    }
}
