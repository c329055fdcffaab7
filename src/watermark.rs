//! Ordering of column values against watermarks.
//!
//! Watermarks are persisted as strings. Numeric columns compare numerically
//! against a numeric watermark; everything else compares as text, which keeps
//! ISO-8601 timestamps and dates correctly ordered.

use std::cmp::Ordering;

use serde_json::Value;

/// Order two non-null values of the same column. `None` when the values are
/// of incomparable kinds.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Watermark string for a value, `None` for nulls and nested values.
pub fn render(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Compare a value with a stored watermark.
pub fn compare_to_watermark(value: &Value, watermark: &str) -> Option<Ordering> {
    match value {
        Value::Null => None,
        Value::Number(n) => {
            let watermark = watermark.trim();
            if let (Some(v), Ok(w)) = (n.as_i64(), watermark.parse::<i64>()) {
                return Some(v.cmp(&w));
            }
            match (n.as_f64(), watermark.parse::<f64>()) {
                (Some(v), Ok(w)) => v.partial_cmp(&w),
                _ => Some(n.to_string().as_str().cmp(watermark)),
            }
        }
        Value::String(s) => Some(s.as_str().cmp(watermark)),
        Value::Bool(b) => Some(b.to_string().as_str().cmp(watermark)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Strictly greater than the watermark. A row equal to the watermark was
/// already extracted by the run that committed it.
pub fn is_after(value: &Value, watermark: &str) -> bool {
    matches!(compare_to_watermark(value, watermark), Some(Ordering::Greater))
}
