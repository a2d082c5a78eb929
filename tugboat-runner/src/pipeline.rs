//! Pipeline driver
//!
//! Sequences the stages of a deployment run and carries [`PipelineState`]
//! between them:
//!
//! ```text
//! provision -> await-ssh -> await-cluster-api -> publish -> rollout -> verify
//! ```
//!
//! Every stage boundary is a hard gate. The first failure ends the run; if
//! the failing stage ran after provisioning, a diagnostics report is
//! collected first. Nothing is rolled back: a provisioned instance or a
//! pushed image outlives a failed run.

use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tugboat_core::domain::result::{PipelineResult, RunOutcome};
use tugboat_core::domain::stage::{Stage, StageOutcome};
use tugboat_core::domain::state::{Credential, PipelineState};
use tugboat_core::error::{BuildError, RolloutError, StageError, VerificationError};

use crate::config::Config;
use crate::poller::{Check, PollError, poll_until, poll_until_ready};
use crate::remote::{ClusterHandle, ShellConnector};
use crate::service::{
    ArtifactPublisher, DiagnosticsCollector, HttpProbe, Provisioner, RolloutController, Verifier,
};

/// Where the instance for a run comes from
#[derive(Debug, Clone)]
pub enum ProvisionMode {
    /// Apply the infrastructure definition
    Provision,
    /// Reuse an instance that already exists
    Existing {
        address: String,
        credential: Credential,
    },
}

/// Drives one deployment run from provisioning to verification
pub struct Pipeline {
    config: Config,
    mode: ProvisionMode,
    provisioner: Arc<dyn Provisioner>,
    publisher: Arc<dyn ArtifactPublisher>,
    connector: Arc<dyn ShellConnector>,
    http: Arc<dyn HttpProbe>,
}

/// Stage-local data produced during a run
#[derive(Default)]
struct RunContext {
    cluster: Option<ClusterHandle>,
    endpoint: Option<String>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        mode: ProvisionMode,
        provisioner: Arc<dyn Provisioner>,
        publisher: Arc<dyn ArtifactPublisher>,
        connector: Arc<dyn ShellConnector>,
        http: Arc<dyn HttpProbe>,
    ) -> Self {
        Self {
            config,
            mode,
            provisioner,
            publisher,
            connector,
            http,
        }
    }

    /// Runs every stage in order and returns the aggregate result
    pub async fn run(&self) -> PipelineResult {
        let mut state = PipelineState::new();
        let mut ctx = RunContext::default();
        info!(
            "Starting deployment run {} for {}",
            state.run_id,
            self.config.image_reference()
        );

        let outcome = match self.run_stages(&mut state, &mut ctx).await {
            Ok(()) => match self.succeed(&state, &ctx) {
                Ok(outcome) => outcome,
                Err(error) => self.fail(&mut state, &ctx, Stage::Verify, error).await,
            },
            Err((stage, error)) => self.fail(&mut state, &ctx, stage, error).await,
        };

        PipelineResult {
            run_id: state.run_id,
            outcome,
            history: state.into_history(),
        }
    }

    async fn run_stages(
        &self,
        state: &mut PipelineState,
        ctx: &mut RunContext,
    ) -> Result<(), (Stage, StageError)> {
        match &self.mode {
            ProvisionMode::Provision => {
                let result = self.provision(state).await;
                gate(state, Stage::Provision, result)?;
            }
            ProvisionMode::Existing {
                address,
                credential,
            } => {
                info!("Skipping provisioning, reusing instance at {}", address);
                state
                    .set_instance(address.clone(), credential.clone())
                    .map_err(|e| (Stage::Provision, e))?;
                state.record(
                    Stage::Provision,
                    StageOutcome::Skipped {
                        reason: format!("reusing instance at {}", address),
                    },
                    0,
                );
            }
        }

        let result = self.await_ssh(state, ctx).await;
        gate(state, Stage::AwaitSsh, result)?;

        let result = self.await_cluster_api(state, ctx).await;
        gate(state, Stage::AwaitClusterApi, result)?;

        let result = self.publish(state).await;
        gate(state, Stage::Publish, result)?;

        let result = self.rollout(state, ctx).await;
        gate(state, Stage::Rollout, result)?;

        let result = self.verify(state, ctx).await;
        gate(state, Stage::Verify, result)?;

        Ok(())
    }

    async fn provision(&self, state: &mut PipelineState) -> Result<u32, StageError> {
        info!("==> {}", Stage::Provision);
        let vars = self.config.terraform_vars();
        let instance = self.provisioner.provision(&vars).await?;
        state.set_instance(instance.address, instance.credential)?;
        Ok(1)
    }

    async fn await_ssh(
        &self,
        state: &mut PipelineState,
        ctx: &mut RunContext,
    ) -> Result<u32, StageError> {
        info!("==> {}", Stage::AwaitSsh);
        let address = state
            .instance_address()
            .ok_or_else(|| StageError::Invariant("no instance has been provisioned".to_string()))?;
        let credential = state
            .credential()
            .ok_or_else(|| StageError::Invariant("no credential for the instance".to_string()))?;

        let shell = self.connector.connect(address, credential)?;
        let cluster = ClusterHandle::new(shell, self.config.cluster.kubectl.clone());

        let what = format!("ssh on {}", address);
        let probe = &cluster;
        let attempts =
            poll_until_ready(&what, &self.config.retry.ssh, move || probe.shell_ready()).await?;

        state.confirm_address()?;
        ctx.cluster = Some(cluster);
        Ok(attempts)
    }

    async fn await_cluster_api(
        &self,
        state: &PipelineState,
        ctx: &RunContext,
    ) -> Result<u32, StageError> {
        info!("==> {}", Stage::AwaitClusterApi);
        let address = state.reachable_address()?;
        let cluster = connected(ctx)?;

        let what = format!("cluster api on {}", address);
        let attempts = poll_until_ready(&what, &self.config.retry.cluster_api, move || {
            cluster.api_ready()
        })
        .await?;
        Ok(attempts)
    }

    /// Builds and pushes the image, retrying tool failures under the
    /// publish policy
    async fn publish(&self, state: &mut PipelineState) -> Result<u32, StageError> {
        info!("==> {}", Stage::Publish);
        let publisher = self.publisher.as_ref();
        let context = self.config.image.build_context.as_path();
        let tag = self.config.image.tag.as_str();

        let published: Mutex<Option<String>> = Mutex::new(None);
        let last_error: Mutex<Option<BuildError>> = Mutex::new(None);
        let (published_ref, last_error_ref) = (&published, &last_error);

        let policy = self.config.publish_policy();
        let result = poll_until("image publish", &policy, move || async move {
            match publisher.publish(context, tag).await {
                Ok(reference) => {
                    *published_ref.lock().unwrap_or_else(|p| p.into_inner()) = Some(reference);
                    Check::Ready
                }
                Err(e) if e.is_retryable() => {
                    warn!("Publish attempt failed: {}", e);
                    *last_error_ref.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                    Check::Pending
                }
                Err(e) => Check::Abort(e),
            }
        })
        .await;

        let attempts = match result {
            Ok(attempts) => attempts,
            Err(PollError::Aborted { error, .. }) => return Err(error.into()),
            Err(PollError::Timeout(timeout)) => {
                let last = last_error.into_inner().unwrap_or_else(|p| p.into_inner());
                return Err(match last {
                    Some(error) => error.into(),
                    None => timeout.into(),
                });
            }
        };

        let reference = published
            .into_inner()
            .unwrap_or_else(|p| p.into_inner())
            .ok_or_else(|| StageError::Invariant("publish reported no reference".to_string()))?;
        state.set_image_reference(reference)?;
        Ok(attempts)
    }

    async fn rollout(&self, state: &PipelineState, ctx: &RunContext) -> Result<u32, StageError> {
        info!("==> {}", Stage::Rollout);
        state.reachable_address()?;
        let cluster = connected(ctx)?;
        let image_reference = state.image_reference()?;

        let spec = self.config.deployment_spec(image_reference);
        let controller = RolloutController::new(cluster.clone(), self.config.pull_secret());
        let report = controller
            .rollout(&spec, &self.config.retry.rollout)
            .await?;
        info!(
            "Deployment {} is {} ({} object(s) applied)",
            report.deployment,
            report.state,
            report.applied.lines().count()
        );
        Ok(report.attempts)
    }

    async fn verify(&self, state: &PipelineState, ctx: &mut RunContext) -> Result<u32, StageError> {
        info!("==> {}", Stage::Verify);
        let address = state.reachable_address()?;
        let endpoint = format!("http://{}{}", address, self.config.verify.path);

        let verifier = Verifier::new(self.http.clone(), self.config.verify.expected_status);
        let attempts = verifier
            .verify_reachable(&endpoint, &self.config.retry.verify)
            .await?;

        ctx.endpoint = Some(endpoint);
        Ok(attempts)
    }

    fn succeed(&self, state: &PipelineState, ctx: &RunContext) -> Result<RunOutcome, StageError> {
        let address = state.reachable_address()?.to_string();
        let image_reference = state.image_reference()?.to_string();
        let endpoint = ctx
            .endpoint
            .clone()
            .ok_or_else(|| StageError::Invariant("no endpoint was verified".to_string()))?;

        info!("Run {} succeeded: {} serves {}", state.run_id, endpoint, image_reference);
        Ok(RunOutcome::Succeeded {
            address,
            image_reference,
            endpoint,
        })
    }

    async fn fail(
        &self,
        state: &mut PipelineState,
        ctx: &RunContext,
        stage: Stage,
        error: StageError,
    ) -> RunOutcome {
        error!("Stage {} failed: {}", stage, error);

        let diagnostics = if stage.is_diagnosable() {
            let collector = DiagnosticsCollector::new(&self.config, self.http.clone());
            let report = collector
                .collect(ctx.cluster.as_ref(), state.instance_address())
                .await;
            error!("Diagnostics for run {}:\n{}", state.run_id, report.render());
            Some(report)
        } else {
            info!("No diagnostics for {}: no instance to inspect", stage);
            None
        };

        let diagnostics_ref = diagnostics
            .as_ref()
            .map(|_| format!("{}/diagnostics", state.run_id));
        state.record(
            stage,
            StageOutcome::Failure {
                reason: error.to_string(),
                diagnostics_ref,
            },
            self.failed_attempts(&error),
        );

        RunOutcome::Failed {
            stage,
            kind: error.kind().to_string(),
            reason: error.to_string(),
            diagnostics,
        }
    }

    /// Attempts spent before a stage gave up
    fn failed_attempts(&self, error: &StageError) -> u32 {
        match error {
            StageError::Timeout(timeout) | StageError::Rollout(RolloutError::TimedOut(timeout)) => {
                timeout.attempts
            }
            StageError::Verification(VerificationError::Exhausted { attempts, .. }) => *attempts,
            StageError::Build(e) if e.is_retryable() => self.config.publish_policy().max_attempts(),
            _ => 1,
        }
    }
}

/// Records a successful stage, or tags the error with the stage it ended
fn gate(
    state: &mut PipelineState,
    stage: Stage,
    result: Result<u32, StageError>,
) -> Result<(), (Stage, StageError)> {
    match result {
        Ok(attempts) => {
            info!("<== {} succeeded ({} attempt(s))", stage, attempts);
            state.record(stage, StageOutcome::Success, attempts);
            Ok(())
        }
        Err(error) => Err((stage, error)),
    }
}

fn connected(ctx: &RunContext) -> Result<&ClusterHandle, StageError> {
    ctx.cluster
        .as_ref()
        .ok_or_else(|| StageError::Invariant("no confirmed connection to the instance".to_string()))
}
