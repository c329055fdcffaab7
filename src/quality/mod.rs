//! Quality gate: evaluate a materialized dataset against its contract.
//!
//! Every check runs, failing or not, so one report shows all problems. Only
//! failed checks of severity `error` block publication.

mod checks;

pub use checks::evaluate_check;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::dataset::Dataset;
use crate::domain::{CheckKind, CheckRule, Contract, Severity};
use crate::error::{QualityGateError, QualityGateFailure};

/// Name of the implicit check built from a contract's required columns.
pub const REQUIRED_COLUMNS_CHECK: &str = "required_columns";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub check_name: String,
    pub passed: bool,
    pub severity: Severity,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub dataset_name: String,
    pub passed: bool,
    pub checks: Vec<CheckOutcome>,
}

impl GateReport {
    pub fn new(dataset_name: impl Into<String>, checks: Vec<CheckOutcome>) -> Self {
        let passed = !checks.iter().any(|c| !c.passed && c.severity == Severity::Error);
        Self {
            dataset_name: dataset_name.into(),
            passed,
            checks,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.failed().filter(|c| c.severity == Severity::Warning)
    }

    /// Blocking failures, or `None` when the dataset may be published.
    pub fn failure(&self) -> Option<QualityGateFailure> {
        if self.passed {
            return None;
        }
        Some(QualityGateFailure {
            dataset: self.dataset_name.clone(),
            failed_checks: self
                .failed()
                .filter(|c| c.severity == Severity::Error)
                .map(|c| format!("{} ({})", c.check_name, c.detail))
                .collect(),
        })
    }
}

/// A named predicate referenced by `custom` rules. `Err` carries the detail.
pub trait CustomCheck: Send + Sync {
    fn check(&self, dataset: &Dataset) -> Result<String, String>;
}

impl<F> CustomCheck for F
where
    F: Fn(&Dataset) -> Result<String, String> + Send + Sync,
{
    fn check(&self, dataset: &Dataset) -> Result<String, String> {
        self(dataset)
    }
}

#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn CustomCheck>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, check: impl CustomCheck + 'static) {
        self.checks.insert(name.into(), Arc::new(check));
    }

    pub fn with(mut self, name: impl Into<String>, check: impl CustomCheck + 'static) -> Self {
        self.register(name, check);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomCheck>> {
        self.checks.get(name)
    }
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.checks.keys().collect();
        names.sort();
        f.debug_struct("CheckRegistry").field("checks", &names).finish()
    }
}

#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn evaluate(&self, contract: &Contract, location: &Path, dataset_name: &str)
        -> Result<GateReport, QualityGateError>;
}

/// Gate that reads the dataset file and runs the contract's checks.
#[derive(Debug, Clone, Default)]
pub struct ContractQualityGate {
    registry: CheckRegistry,
}

impl ContractQualityGate {
    pub fn new(registry: CheckRegistry) -> Self {
        Self { registry }
    }

    pub fn evaluate_dataset(&self, contract: &Contract, dataset: &Dataset, dataset_name: &str) -> GateReport {
        let mut outcomes = Vec::with_capacity(contract.rules.len() + 1);
        if !contract.required_columns.is_empty() {
            let implicit = CheckRule {
                name: REQUIRED_COLUMNS_CHECK.to_string(),
                kind: CheckKind::RequiredColumns {
                    columns: contract.required_columns.clone(),
                },
                severity: Severity::Error,
            };
            outcomes.push(evaluate_check(&implicit, dataset, &self.registry));
        }
        for rule in &contract.rules {
            outcomes.push(evaluate_check(rule, dataset, &self.registry));
        }
        GateReport::new(dataset_name, outcomes)
    }
}

#[async_trait]
impl QualityGate for ContractQualityGate {
    async fn evaluate(
        &self,
        contract: &Contract,
        location: &Path,
        dataset_name: &str,
    ) -> Result<GateReport, QualityGateError> {
        let dataset = Dataset::read_from(location).map_err(|source| QualityGateError {
            dataset: dataset_name.to_string(),
            source,
        })?;
        let report = self.evaluate_dataset(contract, &dataset, dataset_name);
        debug!(dataset = dataset_name, passed = report.passed, checks = report.checks.len(), "Quality gate evaluated");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, DataType};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn rule(name: &str, kind: CheckKind, severity: Severity) -> CheckRule {
        CheckRule {
            name: name.to_string(),
            kind,
            severity,
        }
    }

    fn orders(rows: Vec<Vec<Value>>) -> Dataset {
        Dataset::with_rows(
            vec![
                Column::new("order_id", DataType::Integer),
                Column::new("order_total", DataType::Real),
            ],
            rows,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_dataset_fails_min_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.ndjson");
        orders(vec![]).write_atomic(&path).unwrap();
        let contract = Contract {
            dataset_name: "orders".into(),
            required_columns: vec![],
            rules: vec![rule("has_rows", CheckKind::MinRows { min: 1 }, Severity::Error)],
        };

        let report = ContractQualityGate::default()
            .evaluate(&contract, &path, "orders")
            .await
            .unwrap();

        assert!(!report.passed);
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.checks[0].check_name, "has_rows");
        assert!(!report.checks[0].passed);
        assert!(report.failure().is_some());
    }

    #[test]
    fn warnings_never_block_but_are_reported() {
        let ds = orders(vec![vec![json!(1), json!(0.0)], vec![json!(2), json!(5.0)]]);
        let contract = Contract {
            dataset_name: "orders".into(),
            required_columns: vec!["order_id".into()],
            rules: vec![
                rule("unique_ids", CheckKind::Unique { column: "order_id".into() }, Severity::Error),
                rule(
                    "positive_totals",
                    CheckKind::Range {
                        column: "order_total".into(),
                        min: Some(0.0),
                        max: None,
                        exclusive: true,
                    },
                    Severity::Warning,
                ),
            ],
        };

        let report = ContractQualityGate::default().evaluate_dataset(&contract, &ds, "orders");

        assert!(report.passed);
        assert_eq!(report.checks.len(), 3);
        assert_eq!(report.checks[0].check_name, REQUIRED_COLUMNS_CHECK);
        assert_eq!(report.warnings().count(), 1);
        assert!(report.failure().is_none());
    }

    #[test]
    fn all_checks_run_after_a_failure() {
        let ds = orders(vec![vec![Value::Null, json!(1.0)], vec![Value::Null, json!(2.0)]]);
        let contract = Contract {
            dataset_name: "orders".into(),
            required_columns: vec!["customer_id".into()],
            rules: vec![
                rule("ids_present", CheckKind::NotNull { column: "order_id".into() }, Severity::Error),
                rule("enough", CheckKind::MinRows { min: 1 }, Severity::Error),
            ],
        };

        let report = ContractQualityGate::default().evaluate_dataset(&contract, &ds, "orders");

        assert!(!report.passed);
        let failed: Vec<&str> = report.failed().map(|c| c.check_name.as_str()).collect();
        assert_eq!(failed, vec![REQUIRED_COLUMNS_CHECK, "ids_present"]);
        assert_eq!(report.failure().unwrap().failed_checks.len(), 2);
    }

    #[test]
    fn custom_predicates_resolve_through_the_registry() {
        let registry = CheckRegistry::new().with("even_rows", |ds: &Dataset| {
            if ds.len() % 2 == 0 {
                Ok(format!("{} rows", ds.len()))
            } else {
                Err(format!("{} rows is odd", ds.len()))
            }
        });
        let ds = orders(vec![vec![json!(1), json!(1.0)]]);
        let contract = Contract {
            dataset_name: "orders".into(),
            required_columns: vec![],
            rules: vec![
                rule("even", CheckKind::Custom { predicate: "even_rows".into() }, Severity::Error),
                rule("unknown", CheckKind::Custom { predicate: "nope".into() }, Severity::Warning),
            ],
        };

        let report = ContractQualityGate::new(registry).evaluate_dataset(&contract, &ds, "orders");

        assert!(!report.passed);
        assert_eq!(report.checks[0].detail, "1 rows is odd");
        assert!(!report.checks[1].passed);
        assert!(report.checks[1].detail.contains("nope"));
    }

    #[tokio::test]
    async fn unreadable_dataset_is_an_evaluation_error() {
        let dir = tempdir().unwrap();
        let contract = Contract {
            dataset_name: "x".into(),
            required_columns: vec![],
            rules: vec![],
        };
        let err = ContractQualityGate::default()
            .evaluate(&contract, &dir.path().join("missing.ndjson"), "x")
            .await
            .unwrap_err();
        assert_eq!(err.dataset, "x");
    }
}
