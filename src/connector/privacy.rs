use std::sync::Arc;

use async_trait::async_trait;

use super::{Connector, IncrementalBound};
use crate::checkpoint::CheckpointStore;
use crate::dataset::Dataset;
use crate::domain::TableConfig;
use crate::error::ConnectorError;
use crate::observability::PipelineObserver;
use crate::policy::{self, PolicyRegistry, RuleLookup};

/// Wraps any connector and rewrites the exported projection through the
/// policy engine before materialization. Unprojected rows never reach disk.
pub struct PrivacyConnector {
    inner: Arc<dyn Connector>,
    registry: PolicyRegistry,
    observer: Arc<dyn PipelineObserver>,
}

impl PrivacyConnector {
    pub fn new(inner: Arc<dyn Connector>, registry: PolicyRegistry, observer: Arc<dyn PipelineObserver>) -> Self {
        Self {
            inner,
            registry,
            observer,
        }
    }
}

#[async_trait]
impl Connector for PrivacyConnector {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        self.inner.checkpoints()
    }

    async fn extract(&self, table: &TableConfig, bound: Option<&IncrementalBound>) -> Result<Dataset, ConnectorError> {
        // Rejected tables fail before any row is read.
        self.registry.lookup(&table.name)?;
        self.inner.extract(table, bound).await
    }

    fn shape(&self, table: &TableConfig, dataset: Dataset) -> Result<Dataset, ConnectorError> {
        let dataset = self.inner.shape(table, dataset)?;
        let lookup = self.registry.lookup(&table.name)?;
        if let RuleLookup::Defaulted(_) = lookup {
            self.observer.privacy_default_applied(self.name(), &table.name);
        }
        Ok(policy::enforce(&table.name, &dataset, lookup.rule())?)
    }
}
