//! Rollout controller
//!
//! Renders the workload descriptors, submits them to the cluster in one
//! declarative apply, then waits for the deployment to converge.
//!
//! Lifecycle of a single rollout:
//! ```text
//! Submitted -> Reconciling -> Converged
//!                          -> TimedOut
//!                          -> Failed
//! ```

use std::fmt;
use tracing::{debug, info, warn};
use tugboat_core::domain::deployment::DeploymentSpec;
use tugboat_core::domain::policy::RetryPolicy;
use tugboat_core::error::RolloutError;

use crate::manifest::{ManifestSet, PullSecret};
use crate::poller::{Check, PollError, poll_until};
use crate::remote::ClusterHandle;

/// Where a rollout is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    /// Manifests accepted by the cluster
    Submitted,
    /// Waiting for replicas to converge
    Reconciling,
    Converged,
    TimedOut,
    /// The orchestrator gave up on the rollout
    Failed,
}

impl RolloutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Reconciling => "reconciling",
            Self::Converged => "converged",
            Self::TimedOut => "timed-out",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::TimedOut | Self::Failed)
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(self, next: RolloutState) -> Result<RolloutState, RolloutError> {
        let allowed = !self.is_terminal()
            && matches!(
                (self, next),
                (Self::Submitted, Self::Reconciling)
                    | (Self::Reconciling, Self::Converged)
                    | (Self::Reconciling, Self::TimedOut)
                    | (Self::Reconciling, Self::Failed)
            );

        if allowed {
            debug!("Rollout state {} -> {}", self, next);
            Ok(next)
        } else {
            Err(RolloutError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a converged rollout
#[derive(Debug, Clone)]
pub struct RolloutReport {
    pub deployment: String,
    pub state: RolloutState,
    /// Status polls it took to observe convergence
    pub attempts: u32,
    /// Per-object summary printed by the apply
    pub applied: String,
}

/// Drives one deployment spec to converged state on a cluster
pub struct RolloutController {
    cluster: ClusterHandle,
    pull_secret: Option<PullSecret>,
}

impl RolloutController {
    pub fn new(cluster: ClusterHandle, pull_secret: Option<PullSecret>) -> Self {
        Self {
            cluster,
            pull_secret,
        }
    }

    /// Applies `spec` and waits for the deployment to converge under `policy`
    pub async fn rollout(
        &self,
        spec: &DeploymentSpec,
        policy: &RetryPolicy,
    ) -> Result<RolloutReport, RolloutError> {
        spec.validate()?;

        let manifests = ManifestSet::render(spec, self.pull_secret.as_ref());
        info!(
            "Applying manifests for {}/{} on {} (replicas={}, image={})",
            spec.namespace,
            spec.name,
            self.cluster.target(),
            spec.replica_count,
            spec.image_reference
        );
        let applied = self
            .cluster
            .apply(&manifests.to_apply_payload())
            .await
            .map_err(RolloutError::Apply)?;
        for line in applied.lines() {
            info!("  {}", line);
        }

        let state = RolloutState::Submitted.transition(RolloutState::Reconciling)?;
        self.await_converged(spec, policy, state, applied).await
    }

    async fn await_converged(
        &self,
        spec: &DeploymentSpec,
        policy: &RetryPolicy,
        state: RolloutState,
        applied: String,
    ) -> Result<RolloutReport, RolloutError> {
        let cluster = &self.cluster;
        let namespace = spec.namespace.as_str();
        let name = spec.name.as_str();
        let what = format!("deployment {}/{} to converge", namespace, name);

        let result = poll_until(&what, policy, move || async move {
            match cluster.deployment_status(namespace, name).await {
                Ok(status) => {
                    if let Some(reason) = status.failure_reason() {
                        Check::Abort(reason)
                    } else if status.is_converged() {
                        Check::Ready
                    } else {
                        info!(
                            "{}: updated={} ready={} available={} total={} of {}",
                            name,
                            status.updated_replicas,
                            status.ready_replicas,
                            status.available_replicas,
                            status.total_replicas,
                            status.desired_replicas
                        );
                        Check::Pending
                    }
                }
                Err(e) => {
                    warn!("Failed to read status of {}: {}", name, e);
                    Check::Pending
                }
            }
        })
        .await;

        match result {
            Ok(attempts) => {
                let state = state.transition(RolloutState::Converged)?;
                info!("Deployment {} {}", name, state);
                Ok(RolloutReport {
                    deployment: name.to_string(),
                    state,
                    attempts,
                    applied,
                })
            }
            Err(PollError::Timeout(timeout)) => {
                state.transition(RolloutState::TimedOut)?;
                warn!("Deployment {} did not converge", name);
                Err(RolloutError::TimedOut(timeout))
            }
            Err(PollError::Aborted { error, .. }) => {
                state.transition(RolloutState::Failed)?;
                Err(RolloutError::Failed {
                    deployment: name.to_string(),
                    reason: error,
                })
            }
        }
    }
}
