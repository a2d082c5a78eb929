//! Remote access layer
//!
//! All interaction with the provisioned instance goes through a
//! [`RemoteShell`]: the pipeline never talks to the cluster API directly.
//! The cluster control client is invoked over that shell by
//! [`ClusterHandle`].

pub mod cluster;
#[cfg(test)]
pub mod fake;
pub mod ssh;

use async_trait::async_trait;
use std::sync::Arc;
use tugboat_core::domain::state::Credential;
use tugboat_core::error::ShellError;

use crate::process::CommandOutput;

// Re-export implementations
pub use cluster::ClusterHandle;
pub use ssh::SshConnector;

/// Runs named commands on the remote host
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` remotely, optionally feeding `stdin`
    ///
    /// Fails with [`ShellError::Exit`] when the command exits non-zero and
    /// with [`ShellError::Transport`] when the channel itself fails.
    async fn run(&self, command: &str, stdin: Option<Vec<u8>>)
    -> Result<CommandOutput, ShellError>;

    /// Human-readable target, e.g. "ubuntu@203.0.113.7"
    fn target(&self) -> String;
}

/// Opens a remote shell to a provisioned instance
pub trait ShellConnector: Send + Sync {
    fn connect(
        &self,
        address: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn RemoteShell>, ShellError>;
}

/// Quotes a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
