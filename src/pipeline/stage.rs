//! Stage runner for the cleaned and aggregated tiers.
//!
//! Each transformation moves through
//! `Pending -> Produced -> Checked -> {Published | Rejected}`. Transformations
//! that do not read each other's outputs run concurrently up to the tier's
//! worker limit; the first rejection stops scheduling, and work already in
//! flight finishes its own lifecycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::template;
use super::Services;
use crate::app::ports::InputLocation;
use crate::dataset::Dataset;
use crate::domain::{InputRef, PublishedArtifact, StageResult, Tier, TransformSpec};
use crate::error::{ConfigError, PipelineError};
use crate::policy;
use crate::quality::GateReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    Pending,
    Produced,
    Checked,
    Published,
    Rejected,
}

impl fmt::Display for TransformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransformState::Pending => "pending",
            TransformState::Produced => "produced",
            TransformState::Checked => "checked",
            TransformState::Published => "published",
            TransformState::Rejected => "rejected",
        })
    }
}

/// A tier that published everything it declared.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub result: StageResult,
    pub reports: Vec<GateReport>,
}

/// A tier stopped by its first failure. Reports and artifacts produced before
/// or alongside the failure are kept.
#[derive(Debug)]
pub struct StageFailure {
    pub transformation: Option<String>,
    pub error: PipelineError,
    pub reports: Vec<GateReport>,
    pub published: Vec<PublishedArtifact>,
}

impl StageFailure {
    pub fn new(transformation: Option<String>, error: PipelineError) -> Self {
        Self {
            transformation,
            error,
            reports: Vec::new(),
            published: Vec::new(),
        }
    }
}

/// Indices of `transforms` in an order where every same-tier input is
/// produced before it is read. Fails on unknown same-tier inputs and cycles.
pub fn execution_order(tier: Tier, transforms: &[TransformSpec]) -> Result<Vec<usize>, ConfigError> {
    let index: HashMap<&str, usize> = transforms.iter().enumerate().map(|(i, t)| (t.name.as_str(), i)).collect();
    let mut pending: Vec<usize> = vec![0; transforms.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); transforms.len()];

    for (i, spec) in transforms.iter().enumerate() {
        let mut deps = HashSet::new();
        for input in spec.inputs.iter().filter(|r| r.tier == tier) {
            let dep = *index.get(input.name.as_str()).ok_or_else(|| ConfigError::UnknownReference {
                kind: "input",
                name: input.to_string(),
                context: format!("transformation '{}'", spec.name),
            })?;
            if deps.insert(dep) {
                dependents[dep].push(i);
                pending[i] += 1;
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..transforms.len()).filter(|i| pending[*i] == 0).collect();
    let mut order = Vec::with_capacity(transforms.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() != transforms.len() {
        let stuck: Vec<&str> = (0..transforms.len())
            .filter(|i| pending[*i] > 0)
            .map(|i| transforms[i].name.as_str())
            .collect();
        return Err(ConfigError::invalid(format!(
            "dependency cycle among {tier} transformations: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// Per-tier settings for a [`StageRunner`].
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub tier: Tier,
    pub local_path: PathBuf,
    /// `{source}` of published paths, e.g. `refined` or `metrics`.
    pub source_label: String,
    pub remote_path_template: String,
    pub max_concurrency: usize,
}

pub struct StageRunner {
    settings: Arc<StageSettings>,
    transforms: Vec<TransformSpec>,
    services: Services,
}

struct TaskOutcome {
    index: usize,
    name: String,
    report: Option<GateReport>,
    result: Result<PublishedArtifact, PipelineError>,
}

impl StageRunner {
    pub fn new(settings: StageSettings, transforms: Vec<TransformSpec>, services: Services) -> Self {
        Self {
            settings: Arc::new(settings),
            transforms,
            services,
        }
    }

    pub fn tier(&self) -> Tier {
        self.settings.tier
    }

    pub fn transforms(&self) -> &[TransformSpec] {
        &self.transforms
    }

    /// Run the tier. `upstream` maps every input from earlier tiers to its
    /// published location.
    pub async fn run(
        &self,
        upstream: &HashMap<InputRef, String>,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, StageFailure> {
        let tier = self.settings.tier;
        execution_order(tier, &self.transforms).map_err(|e| StageFailure::new(None, e.into()))?;

        let mut waiting: Vec<HashSet<String>> = self
            .transforms
            .iter()
            .map(|t| {
                t.inputs
                    .iter()
                    .filter(|r| r.tier == tier)
                    .map(|r| r.name.clone())
                    .collect()
            })
            .collect();
        let mut ready: VecDeque<usize> = (0..self.transforms.len()).filter(|i| waiting[*i].is_empty()).collect();
        let mut locations = upstream.clone();
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut failure: Option<(Option<String>, PipelineError)> = None;
        let mut reports = Vec::new();
        let mut published: Vec<(usize, PublishedArtifact)> = Vec::new();
        let limit = self.settings.max_concurrency.max(1);

        loop {
            while failure.is_none() && !cancel.is_cancelled() && set.len() < limit {
                let Some(index) = ready.pop_front() else { break };
                let spec = self.transforms[index].clone();
                let inputs = match resolve_inputs(&spec, &locations) {
                    Ok(inputs) => inputs,
                    Err(e) => {
                        failure = Some((Some(spec.name.clone()), e));
                        break;
                    }
                };
                self.services.observer.transform_state(tier, &spec.name, TransformState::Pending);
                let settings = self.settings.clone();
                let services = self.services.clone();
                set.spawn(async move {
                    let name = spec.name.clone();
                    let (report, result) = process(&settings, &services, &spec, &inputs).await;
                    TaskOutcome {
                        index,
                        name,
                        report,
                        result,
                    }
                });
            }

            let Some(joined) = set.join_next().await else { break };
            match joined {
                Ok(outcome) => {
                    reports.extend(outcome.report);
                    match outcome.result {
                        Ok(artifact) => {
                            locations.insert(
                                InputRef::new(tier, artifact.name.clone()),
                                artifact.published_location.clone(),
                            );
                            for (i, deps) in waiting.iter_mut().enumerate() {
                                if deps.remove(&outcome.name) && deps.is_empty() {
                                    ready.push_back(i);
                                }
                            }
                            published.push((outcome.index, artifact));
                        }
                        Err(error) => {
                            if failure.is_none() {
                                failure = Some((Some(outcome.name), error));
                            } else {
                                warn!(tier = %tier, transform = %outcome.name, error = %error, "Additional rejection after stage failure");
                            }
                        }
                    }
                }
                Err(e) => {
                    failure.get_or_insert((None, PipelineError::Join(e.to_string())));
                }
            }
        }

        published.sort_by_key(|(i, _)| *i);
        let artifacts: Vec<PublishedArtifact> = published.into_iter().map(|(_, a)| a).collect();

        if failure.is_none() && artifacts.len() < self.transforms.len() && cancel.is_cancelled() {
            failure = Some((None, PipelineError::Cancelled(tier)));
        }
        match failure {
            Some((transformation, error)) => Err(StageFailure {
                transformation,
                error,
                reports,
                published: artifacts,
            }),
            None => Ok(StageOutcome {
                result: StageResult { artifacts },
                reports,
            }),
        }
    }
}

fn resolve_inputs(spec: &TransformSpec, locations: &HashMap<InputRef, String>) -> Result<Vec<InputLocation>, PipelineError> {
    spec.inputs
        .iter()
        .map(|reference| {
            locations
                .get(reference)
                .map(|location| InputLocation {
                    reference: reference.clone(),
                    location: location.clone(),
                })
                .ok_or_else(|| {
                    PipelineError::Config(ConfigError::UnknownReference {
                        kind: "published input",
                        name: reference.to_string(),
                        context: format!("transformation '{}'", spec.name),
                    })
                })
        })
        .collect()
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to discard candidate");
        }
    }
}

/// One transformation's full lifecycle. Returns its quality report, if a
/// contract was evaluated, and the published artifact or the rejection.
async fn process(
    settings: &StageSettings,
    services: &Services,
    spec: &TransformSpec,
    inputs: &[InputLocation],
) -> (Option<GateReport>, Result<PublishedArtifact, PipelineError>) {
    let tier = settings.tier;
    let observer = &services.observer;
    let reject = |error: PipelineError, staged: &[&Path]| -> Result<PublishedArtifact, PipelineError> {
        for path in staged {
            discard(path);
        }
        observer.transform_state(tier, &spec.name, TransformState::Rejected);
        Err(error)
    };

    let output = settings.local_path.join(format!("{}.ndjson", spec.name));
    let candidate = match services.runner.run(spec, inputs, &output).await {
        Ok(path) => path,
        Err(e) => return (None, reject(e.into(), &[])),
    };
    observer.transform_state(tier, &spec.name, TransformState::Produced);

    if let Some(rule) = &spec.privacy_rule {
        let shaped = Dataset::read_from(&candidate)
            .map_err(PipelineError::from)
            .and_then(|ds| policy::enforce(&spec.name, &ds, rule).map_err(PipelineError::from))
            .and_then(|ds| ds.write_atomic(&candidate).map_err(PipelineError::from));
        if let Err(e) = shaped {
            return (None, reject(e, &[candidate.as_path()]));
        }
    }

    let report = match &spec.contract {
        Some(contract) => match services.gate.evaluate(contract, &candidate, &spec.name).await {
            Ok(report) => {
                observer.quality_report(tier, &report);
                Some(report)
            }
            Err(e) => return (None, reject(e.into(), &[candidate.as_path()])),
        },
        None => None,
    };
    observer.transform_state(tier, &spec.name, TransformState::Checked);

    if let Some(failure) = report.as_ref().and_then(GateReport::failure) {
        return (report, reject(failure.into(), &[candidate.as_path()]));
    }

    let publishable = match &spec.dedup {
        Some(dedup) => match services.dedup.deduplicate(&candidate, dedup).await {
            Ok(path) => path,
            Err(e) => return (report, reject(e.into(), &[candidate.as_path()])),
        },
        None => candidate.clone(),
    };
    let staged: Vec<&Path> = if publishable == candidate {
        vec![candidate.as_path()]
    } else {
        vec![candidate.as_path(), publishable.as_path()]
    };

    let remote = match template::render(&settings.remote_path_template, tier.as_str(), &settings.source_label, &spec.name) {
        Ok(remote) => remote,
        Err(e) => return (report, reject(e.into(), &staged)),
    };
    debug!(tier = %tier, transform = %spec.name, remote = %remote, "Publishing");
    match services.store.upload(&publishable, &remote).await {
        Ok(uri) => {
            observer.transform_state(tier, &spec.name, TransformState::Published);
            (
                report,
                Ok(PublishedArtifact {
                    tier,
                    name: spec.name.clone(),
                    published_location: uri,
                }),
            )
        }
        Err(e) => (report, reject(e.into(), &staged)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::app::ports::{DedupService, ObjectStoreClient, TransformationRunner};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::dataset::{Column, DataType};
    use crate::domain::{Contract, DedupSpec, PrivacyRule, TransformKind};
    use crate::error::{DedupError, PublishError, TransformError};
    use crate::infra::object_store::local_path;
    use crate::infra::{ExactMatchDedup, LocalObjectStore};
    use crate::observability::RecordingObserver;
    use crate::quality::ContractQualityGate;

    fn spec(name: &str, inputs: &[&str]) -> TransformSpec {
        inputs.iter().fold(TransformSpec::new(name, TransformKind::Declarative), |s, i| {
            s.with_input(i.parse().unwrap())
        })
    }

    #[test]
    fn order_respects_same_tier_inputs() {
        let transforms = vec![
            spec("summary", &["cleaned:orders", "cleaned:customers"]),
            spec("orders", &["raw:erp.orders"]),
            spec("customers", &["raw:erp.customers"]),
        ];
        assert_eq!(execution_order(Tier::Cleaned, &transforms).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn cycles_are_config_errors() {
        let transforms = vec![spec("a", &["cleaned:b"]), spec("b", &["cleaned:a"]), spec("c", &[])];
        let err = execution_order(Tier::Cleaned, &transforms).unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn unknown_same_tier_input_is_reported() {
        let transforms = vec![spec("a", &["cleaned:ghost"])];
        assert!(matches!(
            execution_order(Tier::Cleaned, &transforms),
            Err(ConfigError::UnknownReference { .. })
        ));
    }

    /// Writes a small `id, email, ssn` dataset; records calls and the peak
    /// number of runs in flight.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail: Vec<&'static str>,
        cancel_on: Option<(&'static str, CancellationToken)>,
    }

    impl ScriptedRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransformationRunner for ScriptedRunner {
        async fn run(
            &self,
            spec: &TransformSpec,
            _inputs: &[InputLocation],
            output: &Path,
        ) -> Result<PathBuf, TransformError> {
            self.calls.lock().unwrap().push(spec.name.clone());
            if let Some((name, token)) = &self.cancel_on {
                if spec.name == *name {
                    token.cancel();
                }
            }
            if self.fail.iter().any(|name| *name == spec.name) {
                return Err(TransformError::new(&spec.name, "engine exploded"));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let dataset = Dataset::with_rows(
                vec![
                    Column::new("id", DataType::Integer),
                    Column::new("email", DataType::Text),
                    Column::new("ssn", DataType::Text),
                ],
                vec![
                    vec![json!(1), json!("a@example.com"), json!("111-11-1111")],
                    vec![json!(2), json!("b@example.com"), json!("222-22-2222")],
                ],
            )
            .map_err(|e| TransformError::new(&spec.name, e))?;
            dataset.write_atomic(output).map_err(|e| TransformError::new(&spec.name, e))?;
            Ok(output.to_path_buf())
        }
    }

    struct BrokenDedup;

    #[async_trait]
    impl DedupService for BrokenDedup {
        async fn deduplicate(&self, location: &Path, _spec: &DedupSpec) -> Result<PathBuf, DedupError> {
            Err(DedupError::new(location.display().to_string(), "linkage service unavailable"))
        }
    }

    /// Writes its output beside the candidate instead of in place.
    struct SidecarDedup;

    #[async_trait]
    impl DedupService for SidecarDedup {
        async fn deduplicate(&self, location: &Path, _spec: &DedupSpec) -> Result<PathBuf, DedupError> {
            let out = location.with_extension("dedup.ndjson");
            tokio::fs::copy(location, &out)
                .await
                .map_err(|e| DedupError::new(location.display().to_string(), e))?;
            Ok(out)
        }
    }

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

    struct Harness {
        dir: tempfile::TempDir,
        runner: Arc<ScriptedRunner>,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        fn new(runner: ScriptedRunner) -> Self {
            Self {
                dir: tempdir().unwrap(),
                runner: Arc::new(runner),
                observer: Arc::new(RecordingObserver::default()),
            }
        }

        fn staging(&self) -> PathBuf {
            self.dir.path().join("cleaned")
        }

        fn stage_with(
            &self,
            transforms: Vec<TransformSpec>,
            max_concurrency: usize,
            dedup: Arc<dyn DedupService>,
            store: Arc<dyn ObjectStoreClient>,
        ) -> StageRunner {
            let settings = StageSettings {
                tier: Tier::Cleaned,
                local_path: self.staging(),
                source_label: "refined".to_string(),
                remote_path_template: template::DEFAULT_TEMPLATE.to_string(),
                max_concurrency,
            };
            let services = Services {
                runner: self.runner.clone(),
                gate: Arc::new(ContractQualityGate::default()),
                dedup,
                store,
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
                observer: self.observer.clone(),
            };
            StageRunner::new(settings, transforms, services)
        }

        fn stage(&self, transforms: Vec<TransformSpec>, max_concurrency: usize) -> StageRunner {
            let store = Arc::new(LocalObjectStore::new(self.dir.path().join("lake")));
            self.stage_with(transforms, max_concurrency, Arc::new(ExactMatchDedup), store)
        }
    }

    async fn run(stage: &StageRunner) -> Result<StageOutcome, StageFailure> {
        stage.run(&HashMap::new(), &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn bounded_pool_stops_scheduling_after_first_rejection() {
        let harness = Harness::new(ScriptedRunner {
            fail: vec!["bad"],
            ..ScriptedRunner::default()
        });
        let names = ["a", "b", "c", "bad", "d", "e", "f"];
        let stage = harness.stage(names.iter().map(|n| spec(n, &[])).collect(), 2);

        let failure = run(&stage).await.unwrap_err();

        assert_eq!(harness.runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(failure.transformation.as_deref(), Some("bad"));
        assert!(matches!(failure.error, PipelineError::Transform(_)));
        let mut calls = harness.runner.calls();
        calls.sort();
        assert_eq!(calls, vec!["a", "b", "bad", "c"]);
        let mut published: Vec<&str> = failure.published.iter().map(|a| a.name.as_str()).collect();
        published.sort();
        assert_eq!(published, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn runner_failure_rejects_without_publishing() {
        let harness = Harness::new(ScriptedRunner {
            fail: vec!["bad"],
            ..ScriptedRunner::default()
        });
        let stage = harness.stage(vec![spec("bad", &[])], 1);

        let failure = run(&stage).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::Transform(_)));
        assert!(failure.published.is_empty());
        let events = harness.observer.events();
        assert!(events.contains(&"cleaned:bad rejected".to_string()));
        assert!(!events.iter().any(|e| e.ends_with("published")));
        assert!(!harness.dir.path().join("lake/cleaned").exists());
    }

    #[tokio::test]
    async fn dedup_failure_rejects_and_discards_the_candidate() {
        let harness = Harness::new(ScriptedRunner::default());
        let orders = spec("orders", &[]).with_dedup(DedupSpec {
            match_columns: vec!["id".to_string()],
            settings: json!({}),
        });
        let store = Arc::new(LocalObjectStore::new(harness.dir.path().join("lake")));
        let stage = harness.stage_with(vec![orders], 1, Arc::new(BrokenDedup), store);

        let failure = run(&stage).await.unwrap_err();

        assert_eq!(failure.transformation.as_deref(), Some("orders"));
        assert!(matches!(failure.error, PipelineError::Dedup(_)));
        assert!(!harness.staging().join("orders.ndjson").exists());
    }

    #[tokio::test]
    async fn failed_upload_discards_candidate_and_dedup_output() {
        let harness = Harness::new(ScriptedRunner::default());
        let orders = spec("orders", &[]).with_dedup(DedupSpec {
            match_columns: vec!["id".to_string()],
            settings: json!({}),
        });
        let stage = harness.stage_with(vec![orders], 1, Arc::new(SidecarDedup), Arc::new(DownStore));

        let failure = run(&stage).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::Publish(_)));
        assert!(!harness.staging().join("orders.ndjson").exists());
        assert!(!harness.staging().join("orders.dedup.ndjson").exists());
    }

    fn masking_rule() -> PrivacyRule {
        PrivacyRule {
            exclude_columns: ["ssn".to_string()].into(),
            pseudonymize_columns: ["email".to_string()].into(),
            ..PrivacyRule::default()
        }
    }

    fn requiring(columns: &[&str]) -> Contract {
        Contract {
            dataset_name: "customers".to_string(),
            required_columns: columns.iter().map(|c| c.to_string()).collect(),
            rules: Vec::new(),
        }
    }

    #[tokio::test]
    async fn privacy_rule_shapes_the_candidate_before_the_gate() {
        let harness = Harness::new(ScriptedRunner::default());
        let customers = spec("customers", &[])
            .with_privacy_rule(masking_rule())
            .with_contract(requiring(&["id", "email_Hash"]));
        let stage = harness.stage(vec![customers], 1);

        let outcome = run(&stage).await.unwrap();

        assert!(outcome.reports[0].passed);
        let uri = &outcome.result.artifacts[0].published_location;
        let published = Dataset::read_from(&local_path(uri).unwrap()).unwrap();
        assert_eq!(published.column_names(), vec!["id", "email_Hash"]);

        let leaky = spec("customers", &[])
            .with_privacy_rule(masking_rule())
            .with_contract(requiring(&["ssn"]));
        let failure = run(&harness.stage(vec![leaky], 1)).await.unwrap_err();
        assert!(matches!(failure.error, PipelineError::QualityGate(_)));
        assert!(!failure.reports[0].passed);
    }

    #[tokio::test]
    async fn cancellation_lets_in_flight_work_finish() {
        let token = CancellationToken::new();
        let harness = Harness::new(ScriptedRunner {
            cancel_on: Some(("a", token.clone())),
            ..ScriptedRunner::default()
        });
        let stage = harness.stage(vec![spec("a", &[]), spec("b", &[]), spec("c", &[])], 1);

        let failure = stage.run(&HashMap::new(), &token).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::Cancelled(Tier::Cleaned)));
        assert_eq!(harness.runner.calls(), vec!["a"]);
        assert_eq!(failure.published.len(), 1);
        assert_eq!(failure.published[0].name, "a");
    }
}
