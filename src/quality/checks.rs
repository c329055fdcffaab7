use std::collections::HashSet;

use serde_json::Value;

use super::{CheckOutcome, CheckRegistry};
use crate::dataset::Dataset;
use crate::domain::{CheckKind, CheckRule};

/// Run one rule. Never short-circuits the caller; failures become outcomes.
pub fn evaluate_check(rule: &CheckRule, dataset: &Dataset, registry: &CheckRegistry) -> CheckOutcome {
    let result = match &rule.kind {
        CheckKind::MinRows { min } => min_rows(dataset, *min),
        CheckKind::NotNull { column } => not_null(dataset, column),
        CheckKind::RequiredColumns { columns } => required_columns(dataset, columns),
        CheckKind::Unique { column } => unique(dataset, column),
        CheckKind::Range {
            column,
            min,
            max,
            exclusive,
        } => range(dataset, column, *min, *max, *exclusive),
        CheckKind::Custom { predicate } => match registry.get(predicate) {
            Some(check) => check.check(dataset),
            None => Err(format!("no custom check registered as '{predicate}'")),
        },
    };
    let (passed, detail) = match result {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    };
    CheckOutcome {
        check_name: rule.name.clone(),
        passed,
        severity: rule.severity,
        detail,
    }
}

type CheckResult = Result<String, String>;

fn min_rows(dataset: &Dataset, min: u64) -> CheckResult {
    let rows = dataset.len() as u64;
    if rows >= min {
        Ok(format!("{rows} rows"))
    } else {
        Err(format!("{rows} rows, expected at least {min}"))
    }
}

fn column<'a>(dataset: &'a Dataset, name: &str) -> Result<impl Iterator<Item = &'a Value>, String> {
    dataset
        .column_values(name)
        .map_err(|_| format!("column '{name}' is missing"))
}

fn not_null(dataset: &Dataset, name: &str) -> CheckResult {
    let nulls = column(dataset, name)?.filter(|v| v.is_null()).count();
    match nulls {
        0 => Ok(format!("no nulls in '{name}'")),
        n => Err(format!("{n} null values in '{name}'")),
    }
}

fn required_columns(dataset: &Dataset, columns: &[String]) -> CheckResult {
    let missing: Vec<&str> = columns
        .iter()
        .filter(|c| dataset.column_index(c).is_none())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok("all required columns present".to_string())
    } else {
        Err(format!("missing columns: {}", missing.join(", ")))
    }
}

fn unique(dataset: &Dataset, name: &str) -> CheckResult {
    let mut seen = HashSet::new();
    let mut duplicates = 0usize;
    for value in column(dataset, name)? {
        if value.is_null() {
            continue;
        }
        if !seen.insert(value.to_string()) {
            duplicates += 1;
        }
    }
    match duplicates {
        0 => Ok(format!("{} distinct values in '{name}'", seen.len())),
        n => Err(format!("{n} duplicate values in '{name}'")),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn range(dataset: &Dataset, name: &str, min: Option<f64>, max: Option<f64>, exclusive: bool) -> CheckResult {
    let in_range = |x: f64| {
        let above = match min {
            Some(lo) if exclusive => x > lo,
            Some(lo) => x >= lo,
            None => true,
        };
        let below = match max {
            Some(hi) if exclusive => x < hi,
            Some(hi) => x <= hi,
            None => true,
        };
        above && below
    };
    let mut violations = 0usize;
    for value in column(dataset, name)? {
        if value.is_null() {
            continue;
        }
        match numeric(value) {
            Some(x) if in_range(x) => {}
            _ => violations += 1,
        }
    }
    let bounds = format!(
        "{}{}, {}{}",
        if exclusive { "(" } else { "[" },
        min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".into()),
        max.map(|v| v.to_string()).unwrap_or_else(|| "inf".into()),
        if exclusive { ")" } else { "]" },
    );
    match violations {
        0 => Ok(format!("'{name}' within {bounds}")),
        n => Err(format!("{n} values of '{name}' outside {bounds}")),
    }
}
