//! Contracts with the collaborators the pipeline drives but does not own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{DedupSpec, InputRef, TransformSpec};
use crate::error::{DedupError, PublishError, TransformError};

/// A declared input and where its dataset was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputLocation {
    pub reference: InputRef,
    pub location: String,
}

/// Produces a candidate dataset for one transformation.
///
/// Each call must use its own engine session; concurrent calls never share
/// state.
#[async_trait]
pub trait TransformationRunner: Send + Sync {
    /// `output` is where the candidate is expected; the returned path is where
    /// it was actually written.
    async fn run(&self, spec: &TransformSpec, inputs: &[InputLocation], output: &Path)
        -> Result<PathBuf, TransformError>;
}

/// Record-linkage service collapsing duplicate records within a dataset.
#[async_trait]
pub trait DedupService: Send + Sync {
    async fn deduplicate(&self, location: &Path, spec: &DedupSpec) -> Result<PathBuf, DedupError>;
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Publish a local file at `remote_path`, returning its URI.
    async fn upload(&self, local: &Path, remote_path: &str) -> Result<String, PublishError>;

    /// URI an upload to `remote_path` publishes at, without uploading.
    fn locate(&self, remote_path: &str) -> String;
}
