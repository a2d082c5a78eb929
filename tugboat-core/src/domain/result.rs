//! Pipeline result domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::diagnostics::DiagnosticsReport;
use crate::domain::stage::{Stage, StageRecord};

/// Aggregate outcome of a whole pipeline run
///
/// A run either succeeds in every stage or fails at exactly one; there is no
/// partial success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub history: Vec<StageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        address: String,
        image_reference: String,
        endpoint: String,
    },
    Failed {
        stage: Stage,
        /// Error class, e.g. "VerificationError"
        kind: String,
        reason: String,
        diagnostics: Option<DiagnosticsReport>,
    },
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded { .. })
    }

    /// Stage the run failed at, if any
    pub fn failed_stage(&self) -> Option<Stage> {
        match &self.outcome {
            RunOutcome::Failed { stage, .. } => Some(*stage),
            RunOutcome::Succeeded { .. } => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&DiagnosticsReport> {
        match &self.outcome {
            RunOutcome::Failed { diagnostics, .. } => diagnostics.as_ref(),
            RunOutcome::Succeeded { .. } => None,
        }
    }

    /// Process exit code for this result
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}
