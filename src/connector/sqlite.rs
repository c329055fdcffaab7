use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;

use super::{quote_identifier, Connector, IncrementalBound};
use crate::checkpoint::CheckpointStore;
use crate::dataset::{Column, DataType, Dataset};
use crate::domain::{TableConfig, TableSource};
use crate::error::ConnectorError;

/// Live database connector over a SQLite file.
///
/// Each extraction opens its own read-only connection on a blocking thread,
/// so concurrent table exports never share a session.
pub struct SqliteConnector {
    name: String,
    database: PathBuf,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl SqliteConnector {
    pub fn new(name: &str, database: PathBuf, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            name: name.to_string(),
            database,
            checkpoints,
        }
    }
}

/// Wrap the trusted base query with the incremental predicate. The watermark
/// is never interpolated; it binds as `?1`.
pub(crate) fn incremental_sql(query: &str, bound: Option<&IncrementalBound>) -> Result<String, ConnectorError> {
    let query = query.trim().trim_end_matches(';');
    match bound {
        Some(bound) => Ok(format!(
            "SELECT * FROM ({query}) AS src WHERE {} > ?1",
            quote_identifier(&bound.column)?
        )),
        None => Ok(query.to_string()),
    }
}

/// Bind numeric watermarks as numbers so SQLite compares them numerically.
pub(crate) fn typed_watermark(watermark: &str) -> SqlValue {
    let trimmed = watermark.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        SqlValue::Integer(i)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        SqlValue::Real(f)
    } else {
        SqlValue::Text(watermark.to_string())
    }
}

fn to_json(value: ValueRef<'_>) -> (Value, DataType) {
    match value {
        ValueRef::Null => (Value::Null, DataType::Unknown),
        ValueRef::Integer(i) => (Value::from(i), DataType::Integer),
        ValueRef::Real(f) => (
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            DataType::Real,
        ),
        ValueRef::Text(t) => (Value::String(String::from_utf8_lossy(t).into_owned()), DataType::Text),
        ValueRef::Blob(b) => (Value::String(hex::encode(b)), DataType::Blob),
    }
}

fn run_query(database: &Path, sql: &str, param: Option<SqlValue>) -> rusqlite::Result<Dataset> {
    let conn = Connection::open_with_flags(
        database,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut types = vec![DataType::Unknown; names.len()];

    let mut rows = match &param {
        Some(p) => stmt.query([p])?,
        None => stmt.query([])?,
    };
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(names.len());
        for (i, ty) in types.iter_mut().enumerate() {
            let (value, data_type) = to_json(row.get_ref(i)?);
            if *ty == DataType::Unknown {
                *ty = data_type;
            }
            values.push(value);
        }
        out.push(values);
    }

    let columns = names
        .into_iter()
        .zip(types)
        .map(|(name, data_type)| Column::new(name, data_type))
        .collect();
    Ok(Dataset { columns, rows: out })
}

#[async_trait]
impl Connector for SqliteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    async fn extract(&self, table: &TableConfig, bound: Option<&IncrementalBound>) -> Result<Dataset, ConnectorError> {
        let query = match &table.source {
            TableSource::Query(query) => query,
            TableSource::FilePattern(_) => {
                return Err(ConnectorError::Unsupported {
                    connector: self.name.clone(),
                    table: table.name.clone(),
                    reason: "live database tables need a query".to_string(),
                })
            }
        };
        let sql = incremental_sql(query, bound)?;
        let param = bound.map(|b| typed_watermark(&b.watermark));
        let database = self.database.clone();

        tokio::task::spawn_blocking(move || run_query(&database, &sql, param))
            .await
            .map_err(|e| ConnectorError::source_failure(&self.name, e))?
            .map_err(|e| ConnectorError::source_failure(&self.name, e))
    }
}
