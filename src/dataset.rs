//! Materialized datasets.
//!
//! On disk a dataset is NDJSON: the first line is the schema header
//! `{"columns":[{"name":..,"data_type":..}]}`, every following line is one row
//! as a JSON array aligned with the columns.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DatasetError;
use crate::watermark;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Real,
    Text,
    Boolean,
    Blob,
    #[default]
    Unknown,
}

impl DataType {
    /// Best-effort type of a JSON value.
    pub fn of(value: &Value) -> DataType {
        match value {
            Value::Null => DataType::Unknown,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Integer,
            Value::Number(_) => DataType::Real,
            Value::String(_) => DataType::Text,
            Value::Array(_) | Value::Object(_) => DataType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a dataset, rejecting rows whose width does not match the schema.
    pub fn with_rows(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self, DatasetError> {
        let dataset = Self { columns, rows };
        dataset.check_widths()?;
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Values of one column in row order.
    pub fn column_values<'a>(&'a self, name: &str) -> Result<impl Iterator<Item = &'a Value>, DatasetError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Highest non-null value of `column`, rendered as a watermark string.
    /// `None` when the dataset has no non-null value in that column.
    pub fn max_watermark(&self, column: &str) -> Result<Option<String>, DatasetError> {
        let mut best: Option<&Value> = None;
        for value in self.column_values(column)? {
            if value.is_null() {
                continue;
            }
            best = match best {
                None => Some(value),
                Some(current) => match watermark::compare_values(value, current) {
                    Some(Ordering::Greater) => Some(value),
                    Some(_) => Some(current),
                    None => {
                        return Err(DatasetError::Incomparable {
                            column: column.to_string(),
                            left: value.to_string(),
                            right: current.to_string(),
                        })
                    }
                },
            };
        }
        Ok(best.and_then(watermark::render))
    }

    /// Keep only rows whose `column` value is strictly greater than `watermark`.
    pub fn retain_after(&mut self, column: &str, watermark: &str) -> Result<(), DatasetError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| DatasetError::MissingColumn(column.to_string()))?;
        self.rows
            .retain(|row| watermark::is_after(&row[idx], watermark));
        Ok(())
    }

    /// Append rows of `other`, aligning columns by name. Columns missing on
    /// either side are filled with nulls.
    pub fn union(&mut self, other: Dataset) {
        let mut mapping = Vec::with_capacity(other.columns.len());
        for column in &other.columns {
            let idx = match self.column_index(&column.name) {
                Some(idx) => idx,
                None => {
                    self.columns.push(column.clone());
                    for row in &mut self.rows {
                        row.push(Value::Null);
                    }
                    self.columns.len() - 1
                }
            };
            mapping.push(idx);
        }
        let width = self.columns.len();
        for row in other.rows {
            let mut aligned = vec![Value::Null; width];
            for (value, idx) in row.into_iter().zip(&mapping) {
                aligned[*idx] = value;
            }
            self.rows.push(aligned);
        }
    }

    fn check_widths(&self) -> Result<(), DatasetError> {
        let expected = self.columns.len();
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != expected {
                return Err(DatasetError::RowWidth {
                    row: i,
                    expected,
                    actual: row.len(),
                });
            }
        }
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, DatasetError> {
        let io_err = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines().enumerate();

        let header: Header = match lines.next() {
            Some((_, line)) => {
                let line = line.map_err(io_err)?;
                serde_json::from_str(&line).map_err(|e| malformed(path, 1, e))?
            }
            None => return Err(malformed(path, 1, "missing schema header")),
        };

        let mut dataset = Dataset::new(header.columns);
        for (i, line) in lines {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Vec<Value> = serde_json::from_str(&line).map_err(|e| malformed(path, i + 1, e))?;
            if row.len() != dataset.columns.len() {
                return Err(malformed(
                    path,
                    i + 1,
                    format!("expected {} values, found {}", dataset.columns.len(), row.len()),
                ));
            }
            dataset.rows.push(row);
        }
        Ok(dataset)
    }

    /// Write to `path` through a sibling temporary file and an atomic rename,
    /// so readers never observe a partially written dataset.
    pub fn write_atomic(&self, path: &Path) -> Result<(), DatasetError> {
        self.check_widths()?;
        let io_err = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = temp_sibling(path);
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            let header = Header {
                columns: self.columns.clone(),
            };
            let line = serde_json::to_string(&header).map_err(|e| malformed(path, 1, e))?;
            writeln!(writer, "{}", line).map_err(io_err)?;
            for (i, row) in self.rows.iter().enumerate() {
                let line = serde_json::to_string(row).map_err(|e| malformed(path, i + 2, e))?;
                writeln!(writer, "{}", line).map_err(io_err)?;
            }
            writer.flush().map_err(io_err)?;
            writer.get_ref().sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

/// `orders.ndjson` -> `.orders.ndjson.tmp` in the same directory.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn malformed(path: &Path, line: usize, message: impl std::fmt::Display) -> DatasetError {
    DatasetError::Malformed {
        path: path.to_path_buf(),
        line,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn orders() -> Dataset {
        Dataset::with_rows(
            vec![
                Column::new("id", DataType::Integer),
                Column::new("updated_at", DataType::Text),
            ],
            vec![
                vec![json!(1), json!("2024-01-03")],
                vec![json!(2), json!("2024-01-05")],
                vec![json!(3), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn written_dataset_reads_back_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("orders.ndjson");
        let ds = orders();
        ds.write_atomic(&path).unwrap();

        assert_eq!(Dataset::read_from(&path).unwrap(), ds);
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn max_watermark_skips_nulls() {
        assert_eq!(orders().max_watermark("updated_at").unwrap().as_deref(), Some("2024-01-05"));
        assert_eq!(orders().max_watermark("id").unwrap().as_deref(), Some("3"));
        assert!(matches!(
            orders().max_watermark("missing"),
            Err(DatasetError::MissingColumn(_))
        ));
    }

    #[test]
    fn union_aligns_columns_by_name() {
        let mut left = orders();
        let right = Dataset::with_rows(
            vec![Column::new("dt", DataType::Text), Column::new("id", DataType::Integer)],
            vec![vec![json!("2024-02-01"), json!(9)]],
        )
        .unwrap();
        left.union(right);

        assert_eq!(left.column_names(), vec!["id", "updated_at", "dt"]);
        assert_eq!(left.rows[0], vec![json!(1), json!("2024-01-03"), Value::Null]);
        assert_eq!(left.rows[3], vec![json!(9), Value::Null, json!("2024-02-01")]);
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = Dataset::with_rows(vec![Column::new("id", DataType::Integer)], vec![vec![json!(1), json!(2)]]);
        assert!(matches!(err, Err(DatasetError::RowWidth { row: 0, expected: 1, actual: 2 })));
    }

    #[test]
    fn malformed_header_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.ndjson");
        std::fs::write(&path, "not json\n").unwrap();
        assert!(matches!(
            Dataset::read_from(&path),
            Err(DatasetError::Malformed { line: 1, .. })
        ));
    }
}
