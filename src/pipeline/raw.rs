//! Raw tier: checkpointed table exports published to the object store.
//!
//! The watermark of a table is committed only after its export has been
//! uploaded; a failed upload re-reads the same rows on the next run.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::stage::{StageFailure, StageOutcome};
use super::{template, Services};
use crate::connector::Connector;
use crate::domain::{PublishedArtifact, StageResult, TableConfig, Tier};
use crate::error::PipelineError;

/// One table of one source.
#[derive(Clone)]
pub struct RawExport {
    pub connector: Arc<dyn Connector>,
    pub table: TableConfig,
    pub checkpoint_key: Option<String>,
}

impl RawExport {
    /// `<source>.<table>`, the artifact name cleaned inputs refer to.
    pub fn artifact_name(&self) -> String {
        format!("{}.{}", self.connector.name(), self.table.name)
    }
}

pub struct RawTier {
    exports: Vec<RawExport>,
    local_path: PathBuf,
    remote_path_template: String,
    max_concurrency: usize,
    services: Services,
}

impl RawTier {
    pub fn new(
        exports: Vec<RawExport>,
        local_path: PathBuf,
        remote_path_template: String,
        max_concurrency: usize,
        services: Services,
    ) -> Self {
        Self {
            exports,
            local_path,
            remote_path_template,
            max_concurrency,
            services,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<StageOutcome, StageFailure> {
        let limit = self.max_concurrency.max(1);
        let mut set: JoinSet<(usize, String, Result<PublishedArtifact, PipelineError>)> = JoinSet::new();
        let mut next = 0usize;
        let mut failure: Option<(Option<String>, PipelineError)> = None;
        let mut published: Vec<(usize, PublishedArtifact)> = Vec::new();

        loop {
            while failure.is_none() && !cancel.is_cancelled() && set.len() < limit && next < self.exports.len() {
                let export = self.exports[next].clone();
                let index = next;
                next += 1;
                let local = self
                    .local_path
                    .join(export.connector.name())
                    .join(format!("{}.ndjson", export.table.name));
                let template = self.remote_path_template.clone();
                let services = self.services.clone();
                set.spawn(async move {
                    let name = export.artifact_name();
                    let result = export_one(&export, local, &template, &services).await;
                    (index, name, result)
                });
            }

            let Some(joined) = set.join_next().await else { break };
            match joined {
                Ok((index, _, Ok(artifact))) => published.push((index, artifact)),
                Ok((_, name, Err(error))) => {
                    if failure.is_none() {
                        failure = Some((Some(name), error));
                    }
                }
                Err(e) => {
                    failure.get_or_insert((None, PipelineError::Join(e.to_string())));
                }
            }
        }

        published.sort_by_key(|(i, _)| *i);
        let artifacts: Vec<PublishedArtifact> = published.into_iter().map(|(_, a)| a).collect();
        if failure.is_none() && artifacts.len() < self.exports.len() && cancel.is_cancelled() {
            failure = Some((None, PipelineError::Cancelled(Tier::Raw)));
        }
        match failure {
            Some((transformation, error)) => Err(StageFailure {
                transformation,
                error,
                reports: Vec::new(),
                published: artifacts,
            }),
            None => Ok(StageOutcome {
                result: StageResult { artifacts },
                reports: Vec::new(),
            }),
        }
    }
}

async fn export_one(
    export: &RawExport,
    local: PathBuf,
    remote_path_template: &str,
    services: &Services,
) -> Result<PublishedArtifact, PipelineError> {
    let source = export.connector.name();
    let table = &export.table.name;
    let observer = &services.observer;

    let staged = match export.connector.stage(&export.table, &local, export.checkpoint_key.as_deref()).await {
        Ok(staged) => staged,
        Err(e) => {
            observer.export_failed(source, table, &e);
            return Err(e.into());
        }
    };
    observer.table_exported(source, table, staged.rows);

    let remote = template::render(remote_path_template, Tier::Raw.as_str(), source, table)?;
    let uri = services.store.upload(&staged.location, &remote).await?;

    if let Some(pending) = staged.commit(export.connector.checkpoints()).await? {
        observer.checkpoint_committed(&pending.key, &pending.value);
    }

    Ok(PublishedArtifact {
        tier: Tier::Raw,
        name: export.artifact_name(),
        published_location: uri,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::app::ports::ObjectStoreClient;
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::connector::FileReplayConnector;
    use crate::dataset::{Column, DataType, Dataset};
    use crate::error::PublishError;
    use crate::infra::{CommandTransformationRunner, ExactMatchDedup, LocalObjectStore};
    use crate::observability::RecordingObserver;
    use crate::quality::ContractQualityGate;

    struct DownStore;

    #[async_trait]
    impl ObjectStoreClient for DownStore {
        async fn upload(&self, local: &Path, remote_path: &str) -> Result<String, PublishError> {
            Err(PublishError::Upload {
                local: local.to_path_buf(),
                remote: remote_path.to_string(),
                message: "down".to_string(),
            })
        }

        fn locate(&self, remote_path: &str) -> String {
            format!("mem://{remote_path}")
        }
    }

    struct Setup {
        dir: TempDir,
        checkpoints: Arc<dyn CheckpointStore>,
        observer: Arc<RecordingObserver>,
    }

    /// File replay source `src` with table `t` holding ids 1..=3, previously
    /// exported up to id 1.
    fn setup() -> Setup {
        let dir = tempdir().unwrap();
        let rows = (1..=3).map(|i| vec![json!(i)]).collect();
        Dataset::with_rows(vec![Column::new("id", DataType::Integer)], rows)
            .unwrap()
            .write_atomic(&dir.path().join("files/t/part.ndjson"))
            .unwrap();
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        checkpoints.update("src.t", "1").unwrap();
        Setup {
            dir,
            checkpoints,
            observer: Arc::new(RecordingObserver::default()),
        }
    }

    impl Setup {
        fn tier(&self, store: Arc<dyn ObjectStoreClient>) -> RawTier {
            let connector = Arc::new(FileReplayConnector::new(
                "src",
                self.dir.path().join("files"),
                self.checkpoints.clone(),
            ));
            let export = RawExport {
                connector,
                table: TableConfig::files("t", None).with_incremental_column("id"),
                checkpoint_key: Some("src.t".to_string()),
            };
            let services = Services {
                runner: Arc::new(CommandTransformationRunner::new()),
                gate: Arc::new(ContractQualityGate::default()),
                dedup: Arc::new(ExactMatchDedup),
                store,
                checkpoints: self.checkpoints.clone(),
                observer: self.observer.clone(),
            };
            RawTier::new(
                vec![export],
                self.dir.path().join("raw"),
                template::DEFAULT_TEMPLATE.to_string(),
                1,
                services,
            )
        }
    }

    #[tokio::test]
    async fn failed_upload_keeps_the_previous_watermark() {
        let setup = setup();

        let failure = setup.tier(Arc::new(DownStore)).run(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(failure.transformation.as_deref(), Some("src.t"));
        assert!(matches!(failure.error, PipelineError::Publish(_)));
        assert!(failure.published.is_empty());
        assert_eq!(setup.checkpoints.get("src.t").unwrap().as_deref(), Some("1"));
        let events = setup.observer.events();
        assert!(events.contains(&"exported src.t 2".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("checkpoint ")));
    }

    #[tokio::test]
    async fn successful_upload_commits_the_new_watermark() {
        let setup = setup();
        let store = Arc::new(LocalObjectStore::new(setup.dir.path().join("lake")));

        let outcome = setup.tier(store).run(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.result.artifacts.len(), 1);
        assert_eq!(outcome.result.artifacts[0].name, "src.t");
        assert_eq!(setup.checkpoints.get("src.t").unwrap().as_deref(), Some("3"));
        assert!(setup.observer.events().contains(&"checkpoint src.t=3".to_string()));
        let published = Dataset::read_from(&setup.dir.path().join("lake/raw/src/t.ndjson")).unwrap();
        assert_eq!(published.len(), 2);
    }
}
