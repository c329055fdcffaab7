//! Metrics for the pipeline, recorded through the `metrics` facade.
//!
//! The binary installs a Prometheus recorder with [`init`]; without one every
//! call below is a no-op.

use std::fmt;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::domain::Tier;

/// All metric names used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Pipeline
    PipelineTiersStarted,
    PipelineTiersFailed,
    PipelineTierDuration,

    // Connector
    ConnectorExportsSuccess,
    ConnectorExportsError,
    ConnectorRowsExported,
    ConnectorPrivacyDefaults,

    // Checkpoint
    CheckpointCommits,

    // Quality gate
    QualityGateDatasetsPassed,
    QualityGateDatasetsRejected,
    QualityGateChecksFailed,

    // Stage runner
    StageTransformsProduced,
    StageTransformsPublished,
    StageTransformsRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::PipelineTiersStarted => "medallion_pipeline_tiers_started_total",
            MetricName::PipelineTiersFailed => "medallion_pipeline_tiers_failed_total",
            MetricName::PipelineTierDuration => "medallion_pipeline_tier_duration_seconds",

            MetricName::ConnectorExportsSuccess => "medallion_connector_exports_success_total",
            MetricName::ConnectorExportsError => "medallion_connector_exports_error_total",
            MetricName::ConnectorRowsExported => "medallion_connector_rows_exported_total",
            MetricName::ConnectorPrivacyDefaults => "medallion_connector_privacy_defaults_total",

            MetricName::CheckpointCommits => "medallion_checkpoint_commits_total",

            MetricName::QualityGateDatasetsPassed => "medallion_quality_gate_datasets_passed_total",
            MetricName::QualityGateDatasetsRejected => "medallion_quality_gate_datasets_rejected_total",
            MetricName::QualityGateChecksFailed => "medallion_quality_gate_checks_failed_total",

            MetricName::StageTransformsProduced => "medallion_stage_transforms_produced_total",
            MetricName::StageTransformsPublished => "medallion_stage_transforms_published_total",
            MetricName::StageTransformsRejected => "medallion_stage_transforms_rejected_total",
        }
    }

    pub fn all() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            PipelineTiersStarted,
            PipelineTiersFailed,
            PipelineTierDuration,
            ConnectorExportsSuccess,
            ConnectorExportsError,
            ConnectorRowsExported,
            ConnectorPrivacyDefaults,
            CheckpointCommits,
            QualityGateDatasetsPassed,
            QualityGateDatasetsRejected,
            QualityGateChecksFailed,
            StageTransformsProduced,
            StageTransformsPublished,
            StageTransformsRejected,
        ]
        .into_iter()
    }

    /// (kind, description)
    pub fn metadata(&self) -> (MetricKind, &'static str) {
        match self {
            MetricName::PipelineTiersStarted => (MetricKind::Counter, "Tiers started"),
            MetricName::PipelineTiersFailed => (MetricKind::Counter, "Tiers that failed"),
            MetricName::PipelineTierDuration => (MetricKind::Histogram, "Tier wall time in seconds"),
            MetricName::ConnectorExportsSuccess => (MetricKind::Counter, "Successful table exports"),
            MetricName::ConnectorExportsError => (MetricKind::Counter, "Failed table exports"),
            MetricName::ConnectorRowsExported => (MetricKind::Counter, "Rows materialized by exports"),
            MetricName::ConnectorPrivacyDefaults => (MetricKind::Counter, "Tables copied without a privacy rule"),
            MetricName::CheckpointCommits => (MetricKind::Counter, "Watermarks committed"),
            MetricName::QualityGateDatasetsPassed => (MetricKind::Counter, "Datasets that passed the gate"),
            MetricName::QualityGateDatasetsRejected => (MetricKind::Counter, "Datasets rejected by the gate"),
            MetricName::QualityGateChecksFailed => (MetricKind::Counter, "Failed checks by severity"),
            MetricName::StageTransformsProduced => (MetricKind::Counter, "Candidates produced by the runner"),
            MetricName::StageTransformsPublished => (MetricKind::Counter, "Transformations published"),
            MetricName::StageTransformsRejected => (MetricKind::Counter, "Transformations rejected"),
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the Prometheus recorder and describe every metric.
pub fn init() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    for name in MetricName::all() {
        let (kind, description) = name.metadata();
        match kind {
            MetricKind::Counter => ::metrics::describe_counter!(name.as_str(), description),
            MetricKind::Histogram => ::metrics::describe_histogram!(name.as_str(), description),
        }
    }
    info!("Metrics recorder installed");
    Ok(handle)
}

pub mod pipeline {
    use super::*;

    pub fn tier_started(tier: Tier) {
        ::metrics::counter!(MetricName::PipelineTiersStarted.as_str(), "tier" => tier.as_str()).increment(1);
    }

    pub fn tier_finished(tier: Tier, elapsed: Duration) {
        ::metrics::histogram!(MetricName::PipelineTierDuration.as_str(), "tier" => tier.as_str())
            .record(elapsed.as_secs_f64());
    }

    pub fn tier_failed(tier: Tier) {
        ::metrics::counter!(MetricName::PipelineTiersFailed.as_str(), "tier" => tier.as_str()).increment(1);
    }
}

pub mod connector {
    use super::*;

    pub fn exported(source: &str, rows: usize) {
        let source = source.to_string();
        ::metrics::counter!(MetricName::ConnectorExportsSuccess.as_str(), "source" => source.clone()).increment(1);
        ::metrics::counter!(MetricName::ConnectorRowsExported.as_str(), "source" => source).increment(rows as u64);
    }

    pub fn failed(source: &str) {
        ::metrics::counter!(MetricName::ConnectorExportsError.as_str(), "source" => source.to_string()).increment(1);
    }

    pub fn privacy_default(source: &str) {
        ::metrics::counter!(MetricName::ConnectorPrivacyDefaults.as_str(), "source" => source.to_string())
            .increment(1);
    }
}

pub mod checkpoint {
    use super::*;

    pub fn committed() {
        ::metrics::counter!(MetricName::CheckpointCommits.as_str()).increment(1);
    }
}

pub mod quality_gate {
    use super::*;
    use crate::quality::GateReport;

    pub fn report(report: &GateReport) {
        let name = if report.passed {
            MetricName::QualityGateDatasetsPassed
        } else {
            MetricName::QualityGateDatasetsRejected
        };
        ::metrics::counter!(name.as_str()).increment(1);
        for check in report.failed() {
            ::metrics::counter!(
                MetricName::QualityGateChecksFailed.as_str(),
                "severity" => check.severity.to_string()
            )
            .increment(1);
        }
    }
}

pub mod stage {
    use super::*;
    use crate::pipeline::stage::TransformState;

    pub fn transform_state(tier: Tier, state: TransformState) {
        let name = match state {
            TransformState::Produced => MetricName::StageTransformsProduced,
            TransformState::Published => MetricName::StageTransformsPublished,
            TransformState::Rejected => MetricName::StageTransformsRejected,
            TransformState::Pending | TransformState::Checked => return,
        };
        ::metrics::counter!(name.as_str(), "tier" => tier.as_str()).increment(1);
    }
}
