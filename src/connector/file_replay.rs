use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use super::{Connector, IncrementalBound};
use crate::checkpoint::CheckpointStore;
use crate::dataset::{Column, DataType, Dataset};
use crate::domain::{TableConfig, TableSource};
use crate::error::ConnectorError;

pub const DEFAULT_PATTERN: &str = "**/*.ndjson";
pub const DEFAULT_PARTITION_COLUMN: &str = "dt";

/// Replays pre-materialized dataset files, typically a partitioned export
/// laid out as `<root>/<table>/dt=2024-01-02/part-0.ndjson`.
pub struct FileReplayConnector {
    name: String,
    root: PathBuf,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl FileReplayConnector {
    pub fn new(name: &str, root: PathBuf, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            name: name.to_string(),
            root,
            checkpoints,
        }
    }

    /// Directory to walk and the glob to match, relative to that directory
    /// unless the pattern is absolute.
    fn resolve_pattern(&self, table: &TableConfig, pattern: Option<&str>) -> (PathBuf, String) {
        let pattern = pattern.unwrap_or(DEFAULT_PATTERN).replace("{table}", &table.name);
        if Path::new(&pattern).is_absolute() {
            (literal_prefix(&pattern), pattern)
        } else {
            (self.root.join(table.name.to_lowercase()), pattern)
        }
    }
}

/// Longest leading run of path components with no glob metacharacters.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(component);
    }
    prefix
}

fn matching_files(base: &Path, matcher: &GlobMatcher, absolute: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(base)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            if absolute {
                matcher.is_match(path)
            } else {
                path.strip_prefix(base).map(|rel| matcher.is_match(rel)).unwrap_or(false)
            }
        })
        .collect();
    files.sort();
    files
}

/// Value of a `<column>=<value>` directory segment under `base`, if any.
fn partition_value(base: &Path, file: &Path, column: &str) -> Option<String> {
    let rel = file.strip_prefix(base).unwrap_or(file);
    let parent = rel.parent()?;
    parent.components().rev().find_map(|component| match component {
        Component::Normal(segment) => {
            let segment = segment.to_string_lossy();
            let (key, value) = segment.split_once('=')?;
            (key == column).then(|| value.to_string())
        }
        _ => None,
    })
}

fn load(base: &Path, files: &[PathBuf], partition_column: &str) -> Result<Dataset, ConnectorError> {
    let mut combined: Option<Dataset> = None;
    for file in files {
        let mut part = Dataset::read_from(file)?;
        if part.column_index(partition_column).is_none() {
            if let Some(value) = partition_value(base, file, partition_column) {
                part.columns.push(Column::new(partition_column, DataType::Text));
                for row in &mut part.rows {
                    row.push(Value::String(value.clone()));
                }
            }
        }
        match combined.as_mut() {
            Some(all) => all.union(part),
            None => combined = Some(part),
        }
    }
    Ok(combined.unwrap_or_default())
}

#[async_trait]
impl Connector for FileReplayConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    async fn extract(&self, table: &TableConfig, bound: Option<&IncrementalBound>) -> Result<Dataset, ConnectorError> {
        let pattern = match &table.source {
            TableSource::FilePattern(pattern) => pattern.as_deref(),
            TableSource::Query(_) => {
                return Err(ConnectorError::Unsupported {
                    connector: self.name.clone(),
                    table: table.name.clone(),
                    reason: "file replay tables need a source file pattern".to_string(),
                })
            }
        };
        let (base, pattern) = self.resolve_pattern(table, pattern);
        let absolute = Path::new(&pattern).is_absolute();
        let matcher = Glob::new(&pattern)
            .map_err(|e| ConnectorError::source_failure(&self.name, format!("bad pattern '{pattern}': {e}")))?
            .compile_matcher();
        let partition_column = table
            .partition_column
            .clone()
            .unwrap_or_else(|| DEFAULT_PARTITION_COLUMN.to_string());
        let bound = bound.cloned();
        let name = self.name.clone();

        tokio::task::spawn_blocking(move || {
            let files = matching_files(&base, &matcher, absolute);
            if files.is_empty() {
                return Err(ConnectorError::source_failure(
                    &name,
                    format!("no files match '{}' under {}", pattern, base.display()),
                ));
            }
            debug!(source = %name, files = files.len(), "Replaying files");
            let mut dataset = load(&base, &files, &partition_column)?;
            if let Some(bound) = bound {
                dataset.retain_after(&bound.column, &bound.watermark)?;
            }
            Ok(dataset)
        })
        .await
        .map_err(|e| ConnectorError::source_failure(&self.name, e))?
    }
}
