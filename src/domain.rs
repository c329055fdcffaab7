//! Configuration-owned data shapes shared by every pipeline component.
//!
//! Everything here is immutable once [`crate::config::resolve`] has built it.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One stage of the pipeline. Ordering follows the dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Cleaned,
    Aggregated,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Raw, Tier::Cleaned, Tier::Aggregated];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Cleaned => "cleaned",
            Tier::Aggregated => "aggregated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Tier::Raw),
            "cleaned" => Ok(Tier::Cleaned),
            "aggregated" => Ok(Tier::Aggregated),
            other => Err(ConfigError::invalid(format!("unknown tier '{other}'"))),
        }
    }
}

/// Where a table's rows come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TableSource {
    /// Base extraction query for a live database.
    Query(String),
    /// Glob over pre-materialized files. `None` means the connector default.
    FilePattern(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableConfig {
    pub name: String,
    pub source: TableSource,
    pub incremental_column: Option<String>,
    pub partition_column: Option<String>,
}

impl TableConfig {
    pub fn query(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: TableSource::Query(query.into()),
            incremental_column: None,
            partition_column: None,
        }
    }

    pub fn files(name: impl Into<String>, pattern: Option<String>) -> Self {
        Self {
            name: name.into(),
            source: TableSource::FilePattern(pattern),
            incremental_column: None,
            partition_column: None,
        }
    }

    pub fn with_incremental_column(mut self, column: impl Into<String>) -> Self {
        self.incremental_column = Some(column.into());
        self
    }

    pub fn with_partition_column(mut self, column: impl Into<String>) -> Self {
        self.partition_column = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Md5,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Md5 => "md5",
        })
    }
}

impl FromStr for HashAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "md5" => Ok(HashAlgorithm::Md5),
            other => Err(ConfigError::HashAlgorithm(other.to_string())),
        }
    }
}

/// Column-level privacy rule for one table.
///
/// Precedence when a column is listed more than once:
/// exclude > pseudonymize > retain-list > default-include.
/// When `retain_all` is set every other field is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PrivacyRule {
    pub exclude_columns: BTreeSet<String>,
    pub pseudonymize_columns: BTreeSet<String>,
    pub retain_columns: BTreeSet<String>,
    pub hash_algorithm: HashAlgorithm,
    pub retain_all: bool,
}

impl PrivacyRule {
    pub fn retain_all() -> Self {
        Self {
            retain_all: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        })
    }
}

/// The check a contract rule performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum CheckKind {
    MinRows { min: u64 },
    NotNull { column: String },
    RequiredColumns { columns: Vec<String> },
    Unique { column: String },
    Range {
        column: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        exclusive: bool,
    },
    Custom { predicate: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckRule {
    pub name: String,
    pub kind: CheckKind,
    pub severity: Severity,
}

/// Declarative schema and rule set a dataset must satisfy before publication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contract {
    pub dataset_name: String,
    pub required_columns: Vec<String>,
    pub rules: Vec<CheckRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Declarative,
    RuleBased,
}

/// Reference to a dataset produced by some tier: `raw:erp.orders`,
/// `cleaned:orders_clean`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InputRef {
    pub tier: Tier,
    pub name: String,
}

impl InputRef {
    pub fn new(tier: Tier, name: impl Into<String>) -> Self {
        Self {
            tier,
            name: name.into(),
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.name)
    }
}

impl FromStr for InputRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tier, name) = s.split_once(':').ok_or_else(|| {
            ConfigError::invalid(format!("input reference '{s}' must look like '<tier>:<name>'"))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::invalid(format!("input reference '{s}' has an empty name")));
        }
        Ok(InputRef::new(tier.parse()?, name))
    }
}

/// Opaque settings handed to the dedup service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupSpec {
    pub match_columns: Vec<String>,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformSpec {
    pub name: String,
    pub kind: TransformKind,
    /// Model/script the runner executes; defaults to `name`.
    pub model: String,
    pub inputs: Vec<InputRef>,
    pub privacy_rule: Option<PrivacyRule>,
    pub contract: Option<Contract>,
    pub dedup: Option<DedupSpec>,
}

impl TransformSpec {
    pub fn new(name: impl Into<String>, kind: TransformKind) -> Self {
        let name = name.into();
        Self {
            model: name.clone(),
            name,
            kind,
            inputs: Vec::new(),
            privacy_rule: None,
            contract: None,
            dedup: None,
        }
    }

    pub fn with_input(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn with_privacy_rule(mut self, rule: PrivacyRule) -> Self {
        self.privacy_rule = Some(rule);
        self
    }

    pub fn with_dedup(mut self, dedup: DedupSpec) -> Self {
        self.dedup = Some(dedup);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedArtifact {
    pub tier: Tier,
    /// Transformation name, or `<source>.<table>` for raw exports.
    pub name: String,
    pub published_location: String,
}

/// Ordered published artifacts of one tier; the only state handed to the
/// next tier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StageResult {
    pub artifacts: Vec<PublishedArtifact>,
}

impl StageResult {
    pub fn locations(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|a| a.published_location.clone())
            .collect()
    }
}

/// A committed watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: String,
    pub value: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_refs_parse_tier_and_name() {
        let r: InputRef = "raw:erp.orders".parse().unwrap();
        assert_eq!(r, InputRef::new(Tier::Raw, "erp.orders"));
        assert_eq!(r.to_string(), "raw:erp.orders");

        assert!("orders".parse::<InputRef>().is_err());
        assert!("gold:orders".parse::<InputRef>().is_err());
        assert!("cleaned:".parse::<InputRef>().is_err());
    }

    #[test]
    fn tiers_are_ordered_by_dependency() {
        assert!(Tier::Raw < Tier::Cleaned);
        assert!(Tier::Cleaned < Tier::Aggregated);
    }

    #[test]
    fn hash_algorithm_names() {
        assert_eq!("SHA512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!(matches!(
            "crc32".parse::<HashAlgorithm>(),
            Err(ConfigError::HashAlgorithm(_))
        ));
    }
}
