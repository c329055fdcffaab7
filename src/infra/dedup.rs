use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::app::ports::DedupService;
use crate::dataset::Dataset;
use crate::domain::DedupSpec;
use crate::error::DedupError;

/// Collapses rows that agree exactly on `match_columns` (every column when
/// none are given), keeping the first occurrence. Rewrites the file in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchDedup;

pub fn dedup_exact(dataset: &mut Dataset, match_columns: &[String]) -> Result<usize, String> {
    let indices: Vec<usize> = if match_columns.is_empty() {
        (0..dataset.columns.len()).collect()
    } else {
        match_columns
            .iter()
            .map(|c| dataset.column_index(c).ok_or_else(|| format!("match column '{c}' not found")))
            .collect::<Result<_, _>>()?
    };
    let before = dataset.len();
    let mut seen = HashSet::new();
    dataset.rows.retain(|row| {
        let key: Vec<String> = indices.iter().map(|i| row[*i].to_string()).collect();
        seen.insert(key)
    });
    Ok(before - dataset.len())
}

#[async_trait]
impl DedupService for ExactMatchDedup {
    async fn deduplicate(&self, location: &Path, spec: &DedupSpec) -> Result<PathBuf, DedupError> {
        let name = location.display().to_string();
        let path = location.to_path_buf();
        let columns = spec.match_columns.clone();
        tokio::task::spawn_blocking(move || {
            let mut dataset = Dataset::read_from(&path).map_err(|e| DedupError::new(&name, e))?;
            let removed = dedup_exact(&mut dataset, &columns).map_err(|e| DedupError::new(&name, e))?;
            if removed > 0 {
                dataset.write_atomic(&path).map_err(|e| DedupError::new(&name, e))?;
            }
            tracing::debug!(dataset = %name, removed, "Deduplicated");
            Ok(path)
        })
        .await
        .map_err(|e| DedupError::new(location.display().to_string(), e))?
    }
}
