//! SSH remote shell
//!
//! Runs commands on the instance with the system `ssh` client, using the
//! provisioned private key. The key is written to a private temp file that
//! lives as long as the shell and is removed when the run ends.

use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;
use tugboat_core::domain::state::Credential;
use tugboat_core::error::{ProcessError, ShellError};

use super::{RemoteShell, ShellConnector};
use crate::config::SshConfig;
use crate::process::{CommandOutput, ToolCommand};

/// Exit status ssh uses for its own (connection or auth) failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Private key material on disk, deleted on drop
pub struct KeyFile {
    file: NamedTempFile,
}

impl KeyFile {
    pub fn write(credential: &Credential) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("tugboat-key-")
            .tempfile()?;

        let pem = credential.expose();
        file.write_all(pem.as_bytes())?;
        // OpenSSH rejects keys without a trailing newline
        if !pem.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Remote shell backed by the `ssh` binary
pub struct SshShell {
    address: String,
    config: SshConfig,
    key_file: Arc<KeyFile>,
    command_timeout: Duration,
}

impl SshShell {
    fn command(&self, remote_command: &str) -> ToolCommand {
        ToolCommand::new("ssh")
            .arg("-i")
            .arg(self.key_file.path().to_string_lossy())
            .arg("-p")
            .arg(self.config.port.to_string())
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg(self.target())
            .arg(remote_command)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput, ShellError> {
        let mut ssh = self.command(command);
        if let Some(payload) = stdin {
            ssh = ssh.stdin(payload);
        }

        // The connect timeout is spent before the command's own budget starts
        let timeout = self.command_timeout + Duration::from_secs(self.config.connect_timeout_secs);
        let output = ssh.output(timeout).await?;

        match output.exit_code {
            0 => Ok(output),
            SSH_TRANSPORT_FAILURE => {
                debug!("ssh to {} failed: {}", self.target(), output.stderr.trim());
                Err(ShellError::Transport(ProcessError::Failed {
                    program: "ssh".to_string(),
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                }))
            }
            code => Err(ShellError::Exit {
                command: command.to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.user, self.address)
    }
}

/// Builds [`SshShell`]s for provisioned instances
pub struct SshConnector {
    config: SshConfig,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(config: SshConfig, command_timeout: Duration) -> Self {
        Self {
            config,
            command_timeout,
        }
    }
}

impl ShellConnector for SshConnector {
    fn connect(
        &self,
        address: &str,
        credential: &Credential,
    ) -> Result<Arc<dyn RemoteShell>, ShellError> {
        let key_file = KeyFile::write(credential).map_err(ShellError::KeyFile)?;
        debug!("Wrote key file for {} to {}", address, key_file.path().display());

        Ok(Arc::new(SshShell {
            address: address.to_string(),
            config: self.config.clone(),
            key_file: Arc::new(key_file),
            command_timeout: self.command_timeout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> SshShell {
        let key_file = KeyFile::write(&Credential::new("-----BEGIN KEY-----\nabc\n-----END KEY-----"))
            .unwrap();
        SshShell {
            address: "203.0.113.7".to_string(),
            config: SshConfig::default(),
            key_file: Arc::new(key_file),
            command_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_key_file_contents_and_cleanup() {
        let credential = Credential::new("-----BEGIN KEY-----\nabc\n-----END KEY-----");
        let key_file = KeyFile::write(&credential).unwrap();
        let path = key_file.path().to_path_buf();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.ends_with("-----END KEY-----\n"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(key_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_ssh_command_line() {
        let shell = shell();
        assert_eq!(shell.target(), "ubuntu@203.0.113.7");

        let rendered = shell.command("sudo k3s kubectl get nodes").display();
        assert!(rendered.starts_with("ssh -i "));
        assert!(rendered.contains("BatchMode=yes"));
        assert!(rendered.contains("ConnectTimeout=10"));
        assert!(rendered.ends_with("ubuntu@203.0.113.7 sudo k3s kubectl get nodes"));
    }

    #[test]
    fn test_connector_builds_shell() {
        let connector = SshConnector::new(SshConfig::default(), Duration::from_secs(30));
        let shell = connector
            .connect("198.51.100.4", &Credential::new("key"))
            .unwrap();
        assert_eq!(shell.target(), "ubuntu@198.51.100.4");
    }
}
