//! In-memory stand-in for a remote host running a single-node cluster
//!
//! Understands the handful of control-client commands the pipeline issues
//! and simulates declarative apply: re-applying identical manifests does not
//! bump the deployment generation.

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::sync::{Arc, Mutex};
use tugboat_core::domain::state::Credential;
use tugboat_core::error::{ProcessError, ShellError};

use super::{ClusterHandle, RemoteShell, ShellConnector};
use crate::process::CommandOutput;

struct FakeState {
    commands: Vec<String>,
    applies: Vec<String>,
    shell_ready_after: u32,
    shell_probes: u32,
    api_ready: bool,
    transport_down: bool,
    fail_logs: bool,
    generation: i64,
    converge_after: u32,
    status_polls: u32,
    progress_deadline: bool,
    ingress_logs: String,
    app_logs: String,
    events: JsonValue,
}

#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                commands: Vec::new(),
                applies: Vec::new(),
                shell_ready_after: 0,
                shell_probes: 0,
                api_ready: true,
                transport_down: false,
                fail_logs: false,
                generation: 0,
                converge_after: 1,
                status_polls: 0,
                progress_deadline: false,
                ingress_logs: "level=info msg=\"Configuration loaded\"".to_string(),
                app_logs: " * Running on http://0.0.0.0:5000".to_string(),
                events: json!({"items": [
                    {"type": "Normal", "reason": "Scheduled", "message": "Successfully assigned default/app",
                     "lastTimestamp": "2024-05-01T10:00:00Z",
                     "involvedObject": {"kind": "Pod", "name": "app-5d8f"}}
                ]}),
            })),
        }
    }

    pub fn handle(&self) -> ClusterHandle {
        ClusterHandle::new(Arc::new(self.clone()), "kubectl")
    }

    pub fn set_api_ready(&self, ready: bool) {
        self.state.lock().unwrap().api_ready = ready;
    }

    /// Fail the first `probes` shell probes before accepting connections
    pub fn set_shell_ready_after(&self, probes: u32) {
        self.state.lock().unwrap().shell_ready_after = probes;
    }

    pub fn set_transport_down(&self, down: bool) {
        self.state.lock().unwrap().transport_down = down;
    }

    pub fn set_fail_logs(&self, fail: bool) {
        self.state.lock().unwrap().fail_logs = fail;
    }

    /// Number of status polls after a spec change before replicas are ready
    pub fn set_converge_after(&self, polls: u32) {
        self.state.lock().unwrap().converge_after = polls;
    }

    pub fn set_progress_deadline(&self, exceeded: bool) {
        self.state.lock().unwrap().progress_deadline = exceeded;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn applies(&self) -> Vec<String> {
        self.state.lock().unwrap().applies.clone()
    }

    pub fn generation(&self) -> i64 {
        self.state.lock().unwrap().generation
    }

    fn respond(&self, command: &str, stdin: Option<Vec<u8>>) -> Result<String, ShellError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        if state.transport_down {
            return Err(ShellError::Transport(ProcessError::Failed {
                program: "ssh".to_string(),
                code: 255,
                stderr: "Connection refused".to_string(),
            }));
        }

        let fail = |stderr: &str| {
            Err(ShellError::Exit {
                command: command.to_string(),
                code: 1,
                stderr: stderr.to_string(),
            })
        };

        if command == "true" {
            state.shell_probes += 1;
            if state.shell_probes <= state.shell_ready_after {
                return Err(ShellError::Transport(ProcessError::Failed {
                    program: "ssh".to_string(),
                    code: 255,
                    stderr: "Connection timed out".to_string(),
                }));
            }
            return Ok(String::new());
        }

        if command.contains("get --raw=/readyz") {
            return if state.api_ready {
                Ok("ok".to_string())
            } else {
                fail("The connection to the server 127.0.0.1:6443 was refused")
            };
        }

        if command.contains("apply -f -") {
            let manifest = String::from_utf8(stdin.unwrap_or_default()).unwrap_or_default();
            if serde_json::from_str::<JsonValue>(&manifest).is_err() {
                return fail("error: unable to decode manifest");
            }
            if state.applies.last() != Some(&manifest) {
                state.generation += 1;
                state.status_polls = 0;
            }
            state.applies.push(manifest);
            return Ok("deployment.apps/app configured\nservice/app unchanged\n".to_string());
        }

        if command.contains("get deployment,pods") {
            return Ok("NAME                  READY   STATUS    RESTARTS   AGE\npod/app-5d8f   1/1     Running   0          1m\n".to_string());
        }

        if command.contains("get deployment") {
            let Some(manifest) = state.applies.last().cloned() else {
                return fail("Error from server (NotFound): deployments.apps \"app\" not found");
            };
            state.status_polls += 1;
            let replicas = desired_replicas(&manifest);
            let ready = if state.status_polls >= state.converge_after {
                replicas
            } else {
                0
            };

            let mut conditions = vec![];
            if state.progress_deadline {
                conditions.push(json!({
                    "type": "Progressing", "status": "False",
                    "reason": "ProgressDeadlineExceeded",
                    "message": "ReplicaSet has timed out progressing."
                }));
            }

            return Ok(json!({
                "metadata": {"generation": state.generation},
                "spec": {"replicas": replicas},
                "status": {
                    "observedGeneration": state.generation,
                    "replicas": if ready == replicas { replicas } else { replicas + 1 },
                    "updatedReplicas": replicas,
                    "readyReplicas": if state.progress_deadline { 0 } else { ready },
                    "availableReplicas": if state.progress_deadline { 0 } else { ready },
                    "conditions": conditions,
                }
            })
            .to_string());
        }

        if command.contains(" logs ") {
            if state.fail_logs {
                return fail("error: no pods found");
            }
            return Ok(if command.contains("kube-system") {
                state.ingress_logs.clone()
            } else {
                state.app_logs.clone()
            });
        }

        if command.contains("get events") {
            return Ok(state.events.to_string());
        }

        fail("unknown command")
    }
}

fn desired_replicas(manifest: &str) -> u64 {
    let value: JsonValue = serde_json::from_str(manifest).unwrap_or_default();
    value["items"]
        .as_array()
        .and_then(|items| items.iter().find(|i| i["kind"] == "Deployment"))
        .and_then(|d| d["spec"]["replicas"].as_u64())
        .unwrap_or(1)
}

#[async_trait]
impl RemoteShell for FakeCluster {
    async fn run(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<CommandOutput, ShellError> {
        let stdout = self.respond(command, stdin)?;
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn target(&self) -> String {
        "ubuntu@fake".to_string()
    }
}

impl ShellConnector for FakeCluster {
    fn connect(
        &self,
        _address: &str,
        _credential: &Credential,
    ) -> Result<Arc<dyn RemoteShell>, ShellError> {
        Ok(Arc::new(self.clone()))
    }
}
