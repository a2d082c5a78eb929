//! Cluster handle
//!
//! Wraps a remote shell and issues control-client commands against the
//! single-node cluster running on the instance: apply manifests, query
//! deployment status, fetch logs and list events.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;
use tugboat_core::domain::diagnostics::ClusterEvent;
use tugboat_core::error::ShellError;

use super::{RemoteShell, shell_quote};

/// Condition reason the orchestrator reports when a rollout has stalled
const PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

/// Replica counts and conditions of a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub generation: i64,
    pub observed_generation: i64,
    pub desired_replicas: u32,
    /// Every pod the deployment owns, old template included
    pub total_replicas: u32,
    pub updated_replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub conditions: Vec<DeploymentCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentCondition {
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

impl DeploymentStatus {
    /// Parses `get deployment -o json` output
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let value: JsonValue = serde_json::from_str(raw).map_err(|e| e.to_string())?;

        let count = |v: &JsonValue| v.as_u64().unwrap_or(0) as u32;
        let status = &value["status"];

        let conditions = status["conditions"]
            .as_array()
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| DeploymentCondition {
                        condition_type: c["type"].as_str().unwrap_or_default().to_string(),
                        status: c["status"].as_str().unwrap_or_default().to_string(),
                        reason: c["reason"].as_str().unwrap_or_default().to_string(),
                        message: c["message"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            generation: value["metadata"]["generation"].as_i64().unwrap_or(0),
            observed_generation: status["observedGeneration"].as_i64().unwrap_or(0),
            desired_replicas: value["spec"]["replicas"].as_u64().unwrap_or(1) as u32,
            total_replicas: count(&status["replicas"]),
            updated_replicas: count(&status["updatedReplicas"]),
            ready_replicas: count(&status["readyReplicas"]),
            available_replicas: count(&status["availableReplicas"]),
            conditions,
        })
    }

    /// Whether every desired replica runs the latest spec and is ready, and
    /// no replica of an older template is left running
    pub fn is_converged(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated_replicas >= self.desired_replicas
            && self.total_replicas <= self.updated_replicas
            && self.ready_replicas >= self.desired_replicas
            && self.available_replicas >= self.desired_replicas
    }

    /// Reason the orchestrator gave up on the rollout, if it has
    pub fn failure_reason(&self) -> Option<String> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == "Progressing" && c.reason == PROGRESS_DEADLINE_EXCEEDED)
            .map(|c| format!("{}: {}", c.reason, c.message))
    }
}

/// Handle to the cluster on a provisioned instance
#[derive(Clone)]
pub struct ClusterHandle {
    shell: Arc<dyn RemoteShell>,
    kubectl: String,
}

impl ClusterHandle {
    /// # Arguments
    /// * `shell` - Remote shell to the instance
    /// * `kubectl` - Control client invocation, e.g. "sudo k3s kubectl"
    pub fn new(shell: Arc<dyn RemoteShell>, kubectl: impl Into<String>) -> Self {
        Self {
            shell,
            kubectl: kubectl.into(),
        }
    }

    pub fn target(&self) -> String {
        self.shell.target()
    }

    fn command(&self, args: &str) -> String {
        format!("{} {}", self.kubectl, args)
    }

    async fn run(&self, args: &str, stdin: Option<Vec<u8>>) -> Result<String, ShellError> {
        let command = self.command(args);
        debug!("kubectl on {}: {}", self.shell.target(), args);
        let output = self.shell.run(&command, stdin).await?;
        Ok(output.stdout)
    }

    /// Runs a trivial command to confirm the shell works
    pub async fn shell_ready(&self) -> bool {
        self.shell.run("true", None).await.is_ok()
    }

    /// Whether the cluster API server reports itself ready
    pub async fn api_ready(&self) -> bool {
        match self.run("get --raw=/readyz", None).await {
            Ok(body) => body.trim() == "ok",
            Err(e) => {
                debug!("cluster api not ready: {}", e);
                false
            }
        }
    }

    /// Submits a manifest set in a single declarative apply
    pub async fn apply(&self, manifests: &str) -> Result<String, ShellError> {
        self.run("apply -f -", Some(manifests.as_bytes().to_vec()))
            .await
    }

    pub async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentStatus, ShellError> {
        let args = format!(
            "-n {} get deployment {} -o json",
            shell_quote(namespace),
            shell_quote(name)
        );
        let raw = self.run(&args, None).await?;
        DeploymentStatus::from_json(&raw).map_err(|reason| ShellError::Output {
            command: self.command(&args),
            reason,
        })
    }

    /// Fetches recent logs from every pod matching `selector`
    pub async fn logs(
        &self,
        namespace: &str,
        selector: &str,
        tail: u32,
    ) -> Result<String, ShellError> {
        let args = format!(
            "-n {} logs -l {} --tail={} --all-containers=true --prefix=true",
            shell_quote(namespace),
            shell_quote(selector),
            tail
        );
        self.run(&args, None).await
    }

    /// Lists workloads, pods, services and ingresses matching `selector`
    pub async fn workload_status(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<String, ShellError> {
        let args = format!(
            "-n {} get deployment,pods,service,ingress -l {} -o wide",
            shell_quote(namespace),
            shell_quote(selector)
        );
        self.run(&args, None).await
    }

    /// Cluster-wide events, oldest first
    pub async fn events(&self) -> Result<Vec<ClusterEvent>, ShellError> {
        let args = "get events --all-namespaces -o json";
        let raw = self.run(args, None).await?;
        parse_events(&raw).map_err(|reason| ShellError::Output {
            command: self.command(args),
            reason,
        })
    }
}

/// Parses an event list and orders it by timestamp
pub fn parse_events(raw: &str) -> Result<Vec<ClusterEvent>, String> {
    let value: JsonValue = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let items = value["items"]
        .as_array()
        .ok_or_else(|| "missing `items` array".to_string())?;

    let mut events: Vec<ClusterEvent> = items
        .iter()
        .map(|item| {
            let timestamp = ["lastTimestamp", "eventTime", "firstTimestamp"]
                .iter()
                .find_map(|key| parse_time(&item[*key]))
                .or_else(|| parse_time(&item["metadata"]["creationTimestamp"]));

            let involved = &item["involvedObject"];
            ClusterEvent {
                timestamp,
                event_type: item["type"].as_str().unwrap_or_default().to_string(),
                reason: item["reason"].as_str().unwrap_or_default().to_string(),
                object: format!(
                    "{}/{}",
                    involved["kind"].as_str().unwrap_or("?"),
                    involved["name"].as_str().unwrap_or("?")
                ),
                message: item["message"]
                    .as_str()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            }
        })
        .collect();

    // Events without a timestamp sort first (None < Some)
    events.sort_by_key(|event| event.timestamp);
    Ok(events)
}

fn parse_time(value: &JsonValue) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
