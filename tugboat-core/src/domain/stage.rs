//! Stage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Provision,
    AwaitSsh,
    AwaitClusterApi,
    Publish,
    Rollout,
    Verify,
}

impl Stage {
    /// Every stage in the order the driver executes them
    pub const ALL: [Stage; 6] = [
        Stage::Provision,
        Stage::AwaitSsh,
        Stage::AwaitClusterApi,
        Stage::Publish,
        Stage::Rollout,
        Stage::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Provision => "provision",
            Stage::AwaitSsh => "await-ssh",
            Stage::AwaitClusterApi => "await-cluster-api",
            Stage::Publish => "publish",
            Stage::Rollout => "rollout",
            Stage::Verify => "verify",
        }
    }

    /// Whether a failure in this stage can be diagnosed
    ///
    /// Diagnostics need an instance to talk to, which only exists once
    /// provisioning has finished.
    pub fn is_diagnosable(&self) -> bool {
        !matches!(self, Stage::Provision)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of a single stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    /// The stage was not needed for this run (e.g. reusing an instance)
    Skipped { reason: String },
    Failure {
        reason: String,
        diagnostics_ref: Option<String>,
    },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, StageOutcome::Failure { .. })
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutcome::Success => write!(f, "success"),
            StageOutcome::Skipped { reason } => write!(f, "skipped ({})", reason),
            StageOutcome::Failure { reason, .. } => write!(f, "failure: {}", reason),
        }
    }
}

/// Entry in a run's stage history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub timestamp: DateTime<Utc>,
    /// Attempts the stage took; 1 for stages that do not retry
    pub attempts: u32,
}
