//! Pipeline driver: runs tiers in dependency order and stops at the first
//! tier that fails.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::raw::{RawExport, RawTier};
use super::stage::{StageFailure, StageOutcome, StageRunner, StageSettings};
use super::{template, Services};
use crate::config::PipelineConfig;
use crate::connector::build_connector;
use crate::domain::{InputRef, PublishedArtifact, StageResult, Tier};
use crate::error::{PipelineError, PipelineFailure};
use crate::quality::GateReport;

/// Everything a successful run published.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub run_id: Uuid,
    pub tiers: BTreeMap<Tier, StageResult>,
    pub reports: Vec<GateReport>,
}

impl PipelineOutcome {
    /// Published locations in tier order.
    pub fn locations(&self) -> Vec<String> {
        self.tiers.values().flat_map(StageResult::locations).collect()
    }
}

pub struct PipelineDriver {
    raw: RawTier,
    stages: Vec<StageRunner>,
    remote_path_template: String,
    /// `{source}` label per non-raw tier, for locating unpublished-this-run inputs.
    source_labels: HashMap<Tier, String>,
    services: Services,
    cancel: CancellationToken,
}

impl PipelineDriver {
    pub fn new(raw: RawTier, mut stages: Vec<StageRunner>, remote_path_template: String, services: Services) -> Self {
        stages.sort_by_key(StageRunner::tier);
        Self {
            raw,
            stages,
            remote_path_template,
            source_labels: HashMap::new(),
            services,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire every tier from a resolved configuration.
    pub fn from_config(config: &PipelineConfig, services: Services) -> Self {
        let exports = config
            .sources
            .iter()
            .flat_map(|source| {
                let connector = build_connector(source, services.checkpoints.clone(), services.observer.clone());
                source.tables.iter().map(move |t| RawExport {
                    connector: connector.clone(),
                    table: t.table.clone(),
                    checkpoint_key: t.checkpoint_key.clone(),
                })
            })
            .collect();
        let raw = RawTier::new(
            exports,
            config.raw_local_path.clone(),
            config.remote_path_template.clone(),
            config.max_concurrency,
            services.clone(),
        );

        let mut driver = Self::new(raw, Vec::new(), config.remote_path_template.clone(), services.clone());
        for tier in &config.tiers {
            let settings = StageSettings {
                tier: tier.tier,
                local_path: tier.local_path.clone(),
                source_label: tier.source_label.clone(),
                remote_path_template: config.remote_path_template.clone(),
                max_concurrency: tier.max_concurrency,
            };
            driver.source_labels.insert(tier.tier, tier.source_label.clone());
            driver
                .stages
                .push(StageRunner::new(settings, tier.transforms.clone(), services.clone()));
        }
        driver.stages.sort_by_key(StageRunner::tier);
        driver
    }

    /// Token that aborts the run: tiers and transformations not yet started
    /// are skipped; in-flight work finishes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Location an input would have been published at by an earlier run.
    fn locate(&self, input: &InputRef) -> Option<String> {
        let remote = match input.tier {
            Tier::Raw => {
                let (source, table) = input.name.split_once('.')?;
                template::render(&self.remote_path_template, Tier::Raw.as_str(), source, table).ok()?
            }
            tier => {
                let label = self.source_labels.get(&tier)?;
                template::render(&self.remote_path_template, tier.as_str(), label, &input.name).ok()?
            }
        };
        Some(self.services.store.locate(&remote))
    }

    /// Run the selected tiers, or all of them, in dependency order.
    pub async fn run(&self, tier_filter: Option<&[Tier]>) -> Result<PipelineOutcome, PipelineFailure> {
        let run_id = Uuid::new_v4();
        let observer = &self.services.observer;
        let selected = |tier: Tier| tier_filter.map_or(true, |f| f.contains(&tier));

        let mut tiers = BTreeMap::new();
        let mut reports: Vec<GateReport> = Vec::new();
        let mut published: Vec<PublishedArtifact> = Vec::new();
        let mut locations: HashMap<InputRef, String> = HashMap::new();

        info!(run_id = %run_id, "🚀 Pipeline run starting");
        for tier in Tier::ALL {
            if !selected(tier) {
                observer.tier_skipped(tier, "not selected");
                continue;
            }
            if self.cancel.is_cancelled() {
                observer.tier_skipped(tier, "cancelled");
                return Err(PipelineFailure {
                    tier,
                    transformation: None,
                    error: PipelineError::Cancelled(tier),
                    reports,
                    published,
                });
            }

            let stage = match tier {
                Tier::Raw => None,
                _ => match self.stages.iter().find(|s| s.tier() == tier) {
                    Some(stage) => Some(stage),
                    None => {
                        observer.tier_skipped(tier, "no transformations configured");
                        continue;
                    }
                },
            };

            observer.tier_started(tier);
            let started = Instant::now();
            let result = match stage {
                None => self.raw.run(&self.cancel).await,
                Some(stage) => {
                    for input in stage.transforms().iter().flat_map(|t| t.inputs.iter()) {
                        if input.tier < tier && !locations.contains_key(input) {
                            if let Some(location) = self.locate(input) {
                                locations.insert(input.clone(), location);
                            }
                        }
                    }
                    stage.run(&locations, &self.cancel).await
                }
            };

            match result {
                Ok(StageOutcome { result, reports: tier_reports }) => {
                    observer.tier_finished(tier, &result, started.elapsed());
                    reports.extend(tier_reports);
                    for artifact in &result.artifacts {
                        locations.insert(
                            InputRef::new(tier, artifact.name.clone()),
                            artifact.published_location.clone(),
                        );
                    }
                    published.extend(result.artifacts.iter().cloned());
                    tiers.insert(tier, result);
                }
                Err(StageFailure {
                    transformation,
                    error,
                    reports: tier_reports,
                    published: tier_published,
                }) => {
                    observer.tier_failed(tier, &error);
                    reports.extend(tier_reports);
                    published.extend(tier_published);
                    return Err(PipelineFailure {
                        tier,
                        transformation,
                        error,
                        reports,
                        published,
                    });
                }
            }
        }

        info!(run_id = %run_id, artifacts = published.len(), "🏁 Pipeline run finished");
        Ok(PipelineOutcome { run_id, tiers, reports })
    }
}
