use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::Tier;
use crate::quality::GateReport;

/// Malformed table, privacy, contract or tier configuration. Fatal: the
/// pipeline never starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown {kind} reference '{name}' in {context}")]
    UnknownReference {
        kind: &'static str,
        name: String,
        context: String,
    },

    #[error("Invalid identifier '{0}': expected [A-Za-z_][A-Za-z0-9_]*")]
    Identifier(String),

    #[error("Unsupported hash algorithm '{0}' (expected sha256, sha512 or md5)")]
    HashAlgorithm(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Checkpoint store unreachable or corrupt. Callers fail closed.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint backend error: {0}")]
    Backend(String),

    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Checkpoint lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(e: rusqlite::Error) -> Self {
        CheckpointError::Backend(e.to_string())
    }
}

/// A privacy rule that cannot be applied to a table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("No columns to select after applying privacy rules for table {table}")]
    EmptyProjection { table: String },

    #[error("No privacy rule configured for table {table} and missing rules are rejected")]
    MissingRule { table: String },

    #[error("Column '{column}' referenced by projection is not present in table {table}")]
    UnknownColumn { table: String, column: String },
}

/// Extraction failure. The checkpoint is never touched when this is returned.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Source '{source_name}' failed: {message}")]
    Source { source_name: String, message: String },

    #[error("Table '{table}' is not supported by connector '{connector}': {reason}")]
    Unsupported {
        connector: String,
        table: String,
        reason: String,
    },

    #[error("Invalid identifier '{0}' in extraction query")]
    Identifier(String),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ConnectorError {
    pub fn source_failure(source_name: impl Into<String>, message: impl fmt::Display) -> Self {
        ConnectorError::Source {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }
}

/// Reading or writing a materialized dataset file failed.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed dataset {path} at line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Row {row} has {actual} values but the schema has {expected} columns")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Column '{0}' not found")]
    MissingColumn(String),

    #[error("Column '{column}' mixes incomparable values ({left} vs {right})")]
    Incomparable {
        column: String,
        left: String,
        right: String,
    },
}

/// The external transformation runner failed to produce a candidate.
#[derive(Error, Debug)]
#[error("Transformation '{transform}' failed: {message}")]
pub struct TransformError {
    pub transform: String,
    pub message: String,
}

impl TransformError {
    pub fn new(transform: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            transform: transform.into(),
            message: message.to_string(),
        }
    }
}

/// The external dedup service failed.
#[derive(Error, Debug)]
#[error("Deduplication of '{dataset}' failed: {message}")]
pub struct DedupError {
    pub dataset: String,
    pub message: String,
}

impl DedupError {
    pub fn new(dataset: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            dataset: dataset.into(),
            message: message.to_string(),
        }
    }
}

/// Upload to the object store failed.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Upload of {local} to '{remote}' failed: {message}")]
    Upload {
        local: PathBuf,
        remote: String,
        message: String,
    },

    #[error("Unknown placeholder '{{{0}}}' in remote path template")]
    Placeholder(String),
}

/// The gate could not evaluate the dataset at all (unreadable artifact).
#[derive(Error, Debug)]
#[error("Quality gate could not evaluate '{dataset}': {source}")]
pub struct QualityGateError {
    pub dataset: String,
    #[source]
    pub source: DatasetError,
}

/// A dataset failed one or more blocking checks.
#[derive(Debug, Clone)]
pub struct QualityGateFailure {
    pub dataset: String,
    pub failed_checks: Vec<String>,
}

impl fmt::Display for QualityGateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dataset '{}' failed quality checks: {}",
            self.dataset,
            self.failed_checks.join(", ")
        )
    }
}

impl std::error::Error for QualityGateFailure {}

/// Everything that can stop a tier.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    QualityGate(#[from] QualityGateFailure),

    #[error(transparent)]
    QualityGateEvaluation(#[from] QualityGateError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("Pipeline run cancelled during tier {0}")]
    Cancelled(Tier),

    #[error("Worker task failed: {0}")]
    Join(String),
}

/// Structured failure of a pipeline run.
#[derive(Debug)]
pub struct PipelineFailure {
    pub tier: Tier,
    pub transformation: Option<String>,
    pub error: PipelineError,
    /// Every quality report produced during the run, including passing ones.
    pub reports: Vec<GateReport>,
    /// Artifacts already published before the failure. They stay published.
    pub published: Vec<crate::domain::PublishedArtifact>,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transformation {
            Some(name) => write!(f, "tier {} failed at '{}': {}", self.tier, name, self.error),
            None => write!(f, "tier {} failed: {}", self.tier, self.error),
        }
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
