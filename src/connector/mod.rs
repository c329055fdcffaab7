//! Checkpointed incremental extraction.
//!
//! Every variant implements [`Connector::extract`]; staging, watermark
//! computation and the checkpoint commit are shared provided methods so all
//! variants order them the same way: materialize first, commit after.

mod file_replay;
mod privacy;
mod sqlite;

pub use file_replay::FileReplayConnector;
pub use privacy::PrivacyConnector;
pub use sqlite::SqliteConnector;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::checkpoint::{self, CheckpointStore};
use crate::config::{SourceConfig, SourceKind};
use crate::dataset::Dataset;
use crate::domain::TableConfig;
use crate::error::{CheckpointError, ConnectorError};
use crate::observability::PipelineObserver;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Double-quoted SQL identifier. Only plain identifiers are accepted.
pub fn quote_identifier(name: &str) -> Result<String, ConnectorError> {
    if !is_identifier(name) {
        return Err(ConnectorError::Identifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

/// Lower bound of an incremental extraction: rows with `column > watermark`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalBound {
    pub column: String,
    pub watermark: String,
}

/// Watermark computed from an export, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCheckpoint {
    pub key: String,
    pub value: String,
}

/// A materialized export whose checkpoint has not been committed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedExport {
    pub table: String,
    pub location: PathBuf,
    pub rows: usize,
    pub pending: Option<PendingCheckpoint>,
}

impl StagedExport {
    /// Persist the pending watermark. Only call once whatever consumes the
    /// staged file has succeeded.
    pub async fn commit(
        &self,
        store: &Arc<dyn CheckpointStore>,
    ) -> Result<Option<&PendingCheckpoint>, CheckpointError> {
        match &self.pending {
            Some(pending) => {
                let (key, value) = (pending.key.clone(), pending.value.clone());
                checkpoint::blocking(store, move |s| s.update(&key, &value)).await?;
                Ok(Some(pending))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Source name, used in checkpoint keys and published paths.
    fn name(&self) -> &str;

    fn checkpoints(&self) -> &Arc<dyn CheckpointStore>;

    /// Read the rows of `table`, restricted to `bound` when given.
    async fn extract(&self, table: &TableConfig, bound: Option<&IncrementalBound>) -> Result<Dataset, ConnectorError>;

    /// Rewrite extracted rows before materialization.
    fn shape(&self, _table: &TableConfig, dataset: Dataset) -> Result<Dataset, ConnectorError> {
        Ok(dataset)
    }

    /// Extract and materialize `table` at `destination` without touching the
    /// checkpoint. The returned export carries the watermark to commit.
    async fn stage(
        &self,
        table: &TableConfig,
        destination: &Path,
        checkpoint_key: Option<&str>,
    ) -> Result<StagedExport, ConnectorError> {
        let incremental = match (checkpoint_key, table.incremental_column.as_deref()) {
            (Some(key), Some(column)) => {
                quote_identifier(column)?;
                Some((key, column))
            }
            _ => None,
        };

        let bound = match incremental {
            Some((key, column)) => {
                let key = key.to_string();
                checkpoint::blocking(self.checkpoints(), move |s| s.get(&key))
                    .await?
                    .map(|watermark| IncrementalBound {
                        column: column.to_string(),
                        watermark,
                    })
            }
            None => None,
        };
        debug!(source = self.name(), table = %table.name, bound = ?bound, "Extracting table");

        let dataset = self.extract(table, bound.as_ref()).await?;

        // Computed before shaping: the incremental column may be hashed or dropped.
        let pending = match incremental {
            Some((key, column)) => dataset.max_watermark(column)?.map(|value| PendingCheckpoint {
                key: key.to_string(),
                value,
            }),
            None => None,
        };

        let shaped = self.shape(table, dataset)?;
        shaped.write_atomic(destination)?;

        Ok(StagedExport {
            table: table.name.clone(),
            location: destination.to_path_buf(),
            rows: shaped.len(),
            pending,
        })
    }

    /// Stage, then commit the watermark.
    async fn export(
        &self,
        table: &TableConfig,
        destination: &Path,
        checkpoint_key: Option<&str>,
    ) -> Result<PathBuf, ConnectorError> {
        let staged = self.stage(table, destination, checkpoint_key).await?;
        staged.commit(self.checkpoints()).await?;
        Ok(staged.location)
    }
}

/// Build the connector variant a source is configured with, wrapped in the
/// privacy decorator when the source applies privacy rules.
pub fn build_connector(
    source: &SourceConfig,
    checkpoints: Arc<dyn CheckpointStore>,
    observer: Arc<dyn PipelineObserver>,
) -> Arc<dyn Connector> {
    let base: Arc<dyn Connector> = match &source.kind {
        SourceKind::Sqlite { database } => Arc::new(SqliteConnector::new(&source.name, database.clone(), checkpoints)),
        SourceKind::FileReplay { root } => Arc::new(FileReplayConnector::new(&source.name, root.clone(), checkpoints)),
    };
    if source.apply_privacy {
        Arc::new(PrivacyConnector::new(base, source.policy.clone(), observer))
    } else {
        base
    }
}
