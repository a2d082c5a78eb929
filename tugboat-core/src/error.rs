//! Error taxonomy for the deployment pipeline
//!
//! Each stage has its own error type so the driver can decide whether a
//! failure is retryable (publishing), fatal (provisioning) or escalated
//! after a retry budget is exhausted (polling, rollout, verification).

use std::time::Duration;
use thiserror::Error;

/// Errors raised while running an external tool (terraform, docker, ssh)
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started, or its pipes failed
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program did not finish within its allotted time and was killed
    #[error("`{program}` timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    /// The program ran but exited unsuccessfully
    #[error("`{program}` exited with code {code}: {stderr}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },
}

impl ProcessError {
    /// Exit code reported by the program, if it ran to completion
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A readiness poll exhausted its retry budget
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("timed out waiting for {what} after {attempts} attempt(s)")]
pub struct Timeout {
    /// Human-readable name of the awaited condition
    pub what: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
}

/// Infrastructure provisioning failed. Never retried automatically.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("terraform init failed: {0}")]
    Init(#[source] ProcessError),

    #[error("terraform apply failed: {0}")]
    Apply(#[source] ProcessError),

    #[error("failed to read terraform output `{name}`: {source}")]
    Output {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("terraform output `{name}` is invalid: {reason}")]
    InvalidOutput { name: String, reason: String },
}

/// Building or pushing the container image failed
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("registry login failed: {0}")]
    Login(#[source] ProcessError),

    #[error("image build failed: {0}")]
    Build(#[source] ProcessError),

    #[error("image push failed: {0}")]
    Push(#[source] ProcessError),

    #[error("registry reported no digest for `{0}`")]
    MissingDigest(String),

    #[error("invalid image reference `{0}`")]
    InvalidReference(String),
}

impl BuildError {
    /// Whether re-running the publish step may succeed
    ///
    /// Pushing the same tag twice is an overwrite, so tool failures are
    /// retryable. A malformed reference will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidReference(_))
    }
}

/// A command issued over the remote shell failed
#[derive(Debug, Error)]
pub enum ShellError {
    /// The transport (ssh) itself failed or timed out
    #[error("remote shell transport error: {0}")]
    Transport(#[from] ProcessError),

    /// The remote command ran and exited non-zero
    #[error("remote command `{command}` exited with code {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The remote command succeeded but printed something unparseable
    #[error("unexpected output from `{command}`: {reason}")]
    Output { command: String, reason: String },

    /// The private key could not be materialised for the transport
    #[error("failed to prepare key file: {0}")]
    KeyFile(#[source] std::io::Error),
}

/// Rolling out the deployment failed
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid deployment spec: {0}")]
    InvalidSpec(String),

    #[error("failed to apply manifests: {0}")]
    Apply(#[source] ShellError),

    #[error("deployment `{deployment}` failed: {reason}")]
    Failed { deployment: String, reason: String },

    #[error("deployment did not converge: {0}")]
    TimedOut(#[from] Timeout),

    #[error("illegal rollout transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// The public endpoint never returned the expected status
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("{endpoint} did not return {expected} after {attempts} attempt(s), last result: {last}")]
    Exhausted {
        endpoint: String,
        expected: u16,
        attempts: u32,
        last: String,
    },
}

/// Configuration could not be loaded or failed validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Aggregate error carried across a stage boundary
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Timeout(#[from] Timeout),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("pipeline invariant violated: {0}")]
    Invariant(String),
}

impl StageError {
    /// Name of the error class, used in the run summary
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provision(_) => "ProvisionError",
            Self::Timeout(_) => "Timeout",
            Self::Build(_) => "BuildError",
            Self::Rollout(_) => "RolloutError",
            Self::Verification(_) => "VerificationError",
            Self::Shell(_) => "ShellError",
            Self::Invariant(_) => "InvariantViolation",
        }
    }
}
