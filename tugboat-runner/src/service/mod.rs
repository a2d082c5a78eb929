//! Service layer
//!
//! Services wrap the external collaborators of a deployment run: terraform
//! for infrastructure, the container tool for images, the cluster for
//! rollouts, and HTTP for verification and probing.
//!
//! Every collaborator sits behind a trait so the pipeline can be driven
//! against fakes in tests.

mod diagnostics;
mod provision;
mod publish;
mod rollout;
mod verify;

// Re-export traits
pub use provision::Provisioner;
pub use publish::ArtifactPublisher;
pub use verify::HttpProbe;

// Re-export implementations
pub use diagnostics::DiagnosticsCollector;
pub use provision::{InfraVar, ProvisionedInstance, TerraformProvisioner};
pub use publish::DockerPublisher;
pub use rollout::RolloutController;
pub use verify::{ReqwestProbe, Verifier};
