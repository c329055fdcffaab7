//! Observability: injected lifecycle observer, logging and metrics.
//!
//! Pipeline components never log through globals they own; they report to the
//! `PipelineObserver` they were built with. The binary wires the
//! [`TracingObserver`], which turns events into `tracing` records and metric
//! increments.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;

use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::domain::{StageResult, Tier};
use crate::error::{ConnectorError, PipelineError};
use crate::pipeline::stage::TransformState;
use crate::quality::GateReport;

pub trait PipelineObserver: Send + Sync {
    fn tier_started(&self, _tier: Tier) {}
    fn tier_finished(&self, _tier: Tier, _result: &StageResult, _elapsed: Duration) {}
    fn tier_failed(&self, _tier: Tier, _error: &PipelineError) {}
    fn tier_skipped(&self, _tier: Tier, _reason: &str) {}
    fn transform_state(&self, _tier: Tier, _transform: &str, _state: TransformState) {}
    fn quality_report(&self, _tier: Tier, _report: &GateReport) {}
    fn table_exported(&self, _source: &str, _table: &str, _rows: usize) {}
    fn export_failed(&self, _source: &str, _table: &str, _error: &ConnectorError) {}
    fn checkpoint_committed(&self, _key: &str, _value: &str) {}
    /// A table had no privacy rule and every column was copied.
    fn privacy_default_applied(&self, _source: &str, _table: &str) {}
}

/// Default observer: structured `tracing` events plus metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn tier_started(&self, tier: Tier) {
        info!(tier = %tier, "▶️ Starting tier");
        metrics::pipeline::tier_started(tier);
    }

    fn tier_finished(&self, tier: Tier, result: &StageResult, elapsed: Duration) {
        info!(
            tier = %tier,
            artifacts = result.artifacts.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "✅ Tier published"
        );
        metrics::pipeline::tier_finished(tier, elapsed);
    }

    fn tier_failed(&self, tier: Tier, error: &PipelineError) {
        error!(tier = %tier, error = %error, "❌ Tier failed");
        metrics::pipeline::tier_failed(tier);
    }

    fn tier_skipped(&self, tier: Tier, reason: &str) {
        warn!(tier = %tier, reason, "Tier skipped");
    }

    fn transform_state(&self, tier: Tier, transform: &str, state: TransformState) {
        match state {
            TransformState::Rejected => warn!(tier = %tier, transform, state = %state, "Transformation rejected"),
            TransformState::Published => info!(tier = %tier, transform, state = %state, "📦 Transformation published"),
            _ => tracing::debug!(tier = %tier, transform, state = %state, "Transformation state"),
        }
        metrics::stage::transform_state(tier, state);
    }

    fn quality_report(&self, tier: Tier, report: &GateReport) {
        for check in report.failed() {
            warn!(
                tier = %tier,
                dataset = %report.dataset_name,
                check = %check.check_name,
                severity = %check.severity,
                detail = %check.detail,
                "Quality check failed"
            );
        }
        info!(tier = %tier, dataset = %report.dataset_name, passed = report.passed, "Quality gate evaluated");
        metrics::quality_gate::report(report);
    }

    fn table_exported(&self, source: &str, table: &str, rows: usize) {
        info!(source, table, rows, "Table exported");
        metrics::connector::exported(source, rows);
    }

    fn export_failed(&self, source: &str, table: &str, error: &ConnectorError) {
        error!(source, table, error = %error, "Table export failed");
        metrics::connector::failed(source);
    }

    fn checkpoint_committed(&self, key: &str, value: &str) {
        info!(checkpoint = key, watermark = value, "Checkpoint committed");
        metrics::checkpoint::committed();
    }

    fn privacy_default_applied(&self, source: &str, table: &str) {
        warn!(
            source,
            table,
            "⚠️ No privacy rule configured for table; all columns copied as-is"
        );
        metrics::connector::privacy_default(source);
    }
}

/// Observer that keeps a compact, ordered event log in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl PipelineObserver for RecordingObserver {
    fn tier_started(&self, tier: Tier) {
        self.push(format!("tier_started {tier}"));
    }

    fn tier_finished(&self, tier: Tier, result: &StageResult, _elapsed: Duration) {
        self.push(format!("tier_finished {tier} {}", result.artifacts.len()));
    }

    fn tier_failed(&self, tier: Tier, _error: &PipelineError) {
        self.push(format!("tier_failed {tier}"));
    }

    fn tier_skipped(&self, tier: Tier, _reason: &str) {
        self.push(format!("tier_skipped {tier}"));
    }

    fn transform_state(&self, tier: Tier, transform: &str, state: TransformState) {
        self.push(format!("{tier}:{transform} {state}"));
    }

    fn quality_report(&self, _tier: Tier, report: &GateReport) {
        let verdict = if report.passed { "passed" } else { "failed" };
        self.push(format!("quality {} {verdict}", report.dataset_name));
    }

    fn table_exported(&self, source: &str, table: &str, rows: usize) {
        self.push(format!("exported {source}.{table} {rows}"));
    }

    fn export_failed(&self, source: &str, table: &str, _error: &ConnectorError) {
        self.push(format!("export_failed {source}.{table}"));
    }

    fn checkpoint_committed(&self, key: &str, value: &str) {
        self.push(format!("checkpoint {key}={value}"));
    }

    fn privacy_default_applied(&self, source: &str, table: &str) {
        self.push(format!("privacy_default {source}.{table}"));
    }
}
