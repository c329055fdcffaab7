//! Tier execution: raw exports, stage runners and the driver sequencing them.

pub mod driver;
pub mod raw;
pub mod stage;
pub mod template;

pub use driver::{PipelineDriver, PipelineOutcome};
pub use raw::{RawExport, RawTier};
pub use stage::{StageFailure, StageOutcome, StageRunner, StageSettings, TransformState};

use std::sync::Arc;

use crate::app::ports::{DedupService, ObjectStoreClient, TransformationRunner};
use crate::checkpoint::CheckpointStore;
use crate::observability::PipelineObserver;
use crate::quality::QualityGate;

/// Collaborators shared by every tier of a run.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn TransformationRunner>,
    pub gate: Arc<dyn QualityGate>,
    pub dedup: Arc<dyn DedupService>,
    pub store: Arc<dyn ObjectStoreClient>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub observer: Arc<dyn PipelineObserver>,
}
