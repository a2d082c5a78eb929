//! External tool execution
//!
//! Every external program the pipeline drives (terraform, docker, ssh) is
//! started through [`ToolCommand`], which:
//! - Bounds the invocation with a timeout and kills the child on expiry
//! - Optionally feeds a payload over stdin
//! - Keeps secrets off the command line by passing them as environment variables

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use tugboat_core::error::ProcessError;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for a timeout-bounded external command
#[derive(Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            current_dir: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sets an environment variable on the child. Never displayed.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Renders the command line for logs, without the environment
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }

    /// Runs the command and captures its output regardless of exit code
    pub async fn output(&self, timeout: Duration) -> Result<CommandOutput, ProcessError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.envs {
            command.env(key, value);
        }

        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        debug!("Running: {} (timeout {:?})", self.display(), timeout);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Feed stdin from a separate task so a chatty child cannot deadlock
        // against a full stdout pipe.
        if let (Some(payload), Some(mut stdin)) = (self.stdin.clone(), child.stdin.take()) {
            let program = self.program.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    warn!("Failed to write stdin for {}: {}", program, e);
                }
            });
        }

        // Dropping the child on timeout kills it (kill_on_drop)
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => {
                warn!("{} timed out after {:?}", self.program, timeout);
                return Err(ProcessError::TimedOut {
                    program: self.program.clone(),
                    timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(ProcessError::Spawn {
                    program: self.program.clone(),
                    source,
                });
            }
            Ok(Ok(output)) => output,
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if result.success() {
            debug!(
                "{} completed: stdout_len={}, stderr_len={}",
                self.program,
                result.stdout.len(),
                result.stderr.len()
            );
        } else {
            debug!(
                "{} failed: exit_code={} stderr='{}'",
                self.program,
                result.exit_code,
                result.stderr.trim()
            );
        }

        Ok(result)
    }

    /// Runs the command and fails unless it exits successfully
    pub async fn run(&self, timeout: Duration) -> Result<CommandOutput, ProcessError> {
        let output = self.output(timeout).await?;
        if !output.success() {
            return Err(ProcessError::Failed {
                program: self.program.clone(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}
