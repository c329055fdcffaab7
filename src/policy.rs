//! Column privacy policy.
//!
//! Pure functions from a source schema and a [`PrivacyRule`] to the list of
//! output column expressions. Each column runs through one ordered decision
//! table: exclude, pseudonymize, retain-list, default include.

use std::collections::HashMap;
use std::fmt;

use md5::Md5;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};

use crate::dataset::{Column, DataType, Dataset};
use crate::domain::{HashAlgorithm, PrivacyRule};
use crate::error::PolicyError;

/// Suffix appended to pseudonymized output columns.
pub const HASH_SUFFIX: &str = "_Hash";

/// Outcome of the decision table for one source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDecision {
    /// Listed in `exclude_columns`.
    Exclude,
    /// Listed in `pseudonymize_columns`; emitted as `<name>_Hash`.
    Pseudonymize,
    /// Listed in `retain_columns`.
    Retain,
    /// A retain-list exists and does not name this column.
    NotRetained,
    /// No retain-list; passed through.
    Include,
}

impl fmt::Display for ColumnDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColumnDecision::Exclude => "exclude",
            ColumnDecision::Pseudonymize => "pseudonymize",
            ColumnDecision::Retain => "retain",
            ColumnDecision::NotRetained => "drop (not in retain list)",
            ColumnDecision::Include => "include",
        })
    }
}

pub fn decide(column: &str, rule: &PrivacyRule) -> ColumnDecision {
    if rule.retain_all {
        return ColumnDecision::Include;
    }
    if rule.exclude_columns.contains(column) {
        ColumnDecision::Exclude
    } else if rule.pseudonymize_columns.contains(column) {
        ColumnDecision::Pseudonymize
    } else if rule.retain_columns.is_empty() {
        ColumnDecision::Include
    } else if rule.retain_columns.contains(column) {
        ColumnDecision::Retain
    } else {
        ColumnDecision::NotRetained
    }
}

/// One output column of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnExpr {
    Passthrough(Column),
    Hash {
        source: String,
        output: String,
        algorithm: HashAlgorithm,
    },
}

impl ColumnExpr {
    pub fn source(&self) -> &str {
        match self {
            ColumnExpr::Passthrough(c) => &c.name,
            ColumnExpr::Hash { source, .. } => source,
        }
    }

    pub fn output_name(&self) -> &str {
        match self {
            ColumnExpr::Passthrough(c) => &c.name,
            ColumnExpr::Hash { output, .. } => output,
        }
    }

    pub fn output_column(&self) -> Column {
        match self {
            ColumnExpr::Passthrough(c) => c.clone(),
            ColumnExpr::Hash { output, .. } => Column::new(output.clone(), DataType::Text),
        }
    }
}

impl fmt::Display for ColumnExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnExpr::Passthrough(c) => write!(f, "{}", c.name),
            ColumnExpr::Hash {
                source,
                output,
                algorithm,
            } => write!(f, "{algorithm}({source}) AS {output}"),
        }
    }
}

/// Per-column decisions in source order, for previews and audits.
pub fn explain(columns: &[Column], rule: &PrivacyRule) -> Vec<(String, ColumnDecision)> {
    columns
        .iter()
        .map(|c| (c.name.clone(), decide(&c.name, rule)))
        .collect()
}

/// Project `columns` through `rule`.
///
/// Fails with [`PolicyError::EmptyProjection`] when nothing survives: a
/// dataset with zero output columns is never valid.
pub fn apply(table: &str, columns: &[Column], rule: &PrivacyRule) -> Result<Vec<ColumnExpr>, PolicyError> {
    if rule.retain_all {
        if columns.is_empty() {
            return Err(PolicyError::EmptyProjection {
                table: table.to_string(),
            });
        }
        return Ok(columns.iter().cloned().map(ColumnExpr::Passthrough).collect());
    }

    let exprs: Vec<ColumnExpr> = columns
        .iter()
        .filter_map(|column| match decide(&column.name, rule) {
            ColumnDecision::Pseudonymize => Some(ColumnExpr::Hash {
                source: column.name.clone(),
                output: format!("{}{}", column.name, HASH_SUFFIX),
                algorithm: rule.hash_algorithm,
            }),
            ColumnDecision::Retain | ColumnDecision::Include => Some(ColumnExpr::Passthrough(column.clone())),
            ColumnDecision::Exclude | ColumnDecision::NotRetained => None,
        })
        .collect();

    if exprs.is_empty() {
        return Err(PolicyError::EmptyProjection {
            table: table.to_string(),
        });
    }
    Ok(exprs)
}

/// Evaluate a projection over a materialized dataset.
pub fn project(table: &str, dataset: &Dataset, exprs: &[ColumnExpr]) -> Result<Dataset, PolicyError> {
    let mut indices = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let idx = dataset
            .column_index(expr.source())
            .ok_or_else(|| PolicyError::UnknownColumn {
                table: table.to_string(),
                column: expr.source().to_string(),
            })?;
        indices.push(idx);
    }

    let columns = exprs.iter().map(ColumnExpr::output_column).collect();
    let rows = dataset
        .rows
        .iter()
        .map(|row| {
            exprs
                .iter()
                .zip(&indices)
                .map(|(expr, idx)| match expr {
                    ColumnExpr::Passthrough(_) => row[*idx].clone(),
                    ColumnExpr::Hash { algorithm, .. } => pseudonymize(&row[*idx], *algorithm)
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                })
                .collect()
        })
        .collect();
    Ok(Dataset { columns, rows })
}

/// Apply `rule` to a whole dataset.
pub fn enforce(table: &str, dataset: &Dataset, rule: &PrivacyRule) -> Result<Dataset, PolicyError> {
    let exprs = apply(table, &dataset.columns, rule)?;
    project(table, dataset, &exprs)
}

/// Canonical string form used as hash input. `None` for null.
pub fn canonical_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Deterministic one-way hash of a value: lowercase hex digest of the UTF-8
/// bytes of its canonical string form. Null and empty values hash to `None`
/// so that they never collapse into one shared digest.
pub fn pseudonymize(value: &Value, algorithm: HashAlgorithm) -> Option<String> {
    canonical_string(value).and_then(|s| hash_str(&s, algorithm))
}

pub fn hash_str(value: &str, algorithm: HashAlgorithm) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    let bytes = value.as_bytes();
    Some(match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        HashAlgorithm::Md5 => hex::encode(Md5::digest(bytes)),
    })
}

/// What to do for a table that has no privacy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRulePolicy {
    /// Copy every column and report the default through the observer.
    #[default]
    RetainAll,
    /// Refuse to export the table.
    Reject,
}

/// Rule lookup for one source.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    rules: HashMap<String, PrivacyRule>,
    missing: MissingRulePolicy,
}

/// Rule chosen for a table.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleLookup {
    Configured(PrivacyRule),
    /// No rule exists; `retain_all` applied by default.
    Defaulted(PrivacyRule),
}

impl RuleLookup {
    pub fn rule(&self) -> &PrivacyRule {
        match self {
            RuleLookup::Configured(rule) | RuleLookup::Defaulted(rule) => rule,
        }
    }
}

impl PolicyRegistry {
    pub fn new(missing: MissingRulePolicy) -> Self {
        Self {
            rules: HashMap::new(),
            missing,
        }
    }

    pub fn with_rule(mut self, table: &str, rule: PrivacyRule) -> Self {
        self.insert(table, rule);
        self
    }

    pub fn insert(&mut self, table: &str, rule: PrivacyRule) {
        self.rules.insert(table.to_ascii_lowercase(), rule);
    }

    /// Table names match case-insensitively.
    pub fn lookup(&self, table: &str) -> Result<RuleLookup, PolicyError> {
        match self.rules.get(&table.to_ascii_lowercase()) {
            Some(rule) => Ok(RuleLookup::Configured(rule.clone())),
            None => match self.missing {
                MissingRulePolicy::RetainAll => Ok(RuleLookup::Defaulted(PrivacyRule::retain_all())),
                MissingRulePolicy::Reject => Err(PolicyError::MissingRule {
                    table: table.to_string(),
                }),
            },
        }
    }
}
