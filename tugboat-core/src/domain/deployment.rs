//! Deployment domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::RolloutError;

/// CPU and memory quantities in orchestrator notation (e.g. "250m", "128Mi")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    pub cpu: String,
    pub memory: String,
}

/// Desired shape of the application workload on the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Deployment, service and ingress name
    pub name: String,
    pub namespace: String,
    pub replica_count: u32,
    /// Port the application listens on inside its container
    pub container_port: u16,
    /// Port the service exposes to the ingress
    pub service_port: u16,
    pub resource_limits: ResourceQuantities,
    pub resource_requests: ResourceQuantities,
    pub image_reference: String,
    /// Name of the registry pull secret, when the registry is private
    pub image_pull_secret: Option<String>,
}

impl DeploymentSpec {
    /// Labels used as the pod selector and applied to every rendered object
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), self.name.clone());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "tugboat".to_string(),
        );
        labels
    }

    /// Label selector string for `kubectl -l`
    pub fn selector(&self) -> String {
        format!("app={}", self.name)
    }

    /// Validates the spec before anything is submitted to the cluster
    ///
    /// Whether `container_port` matches what the application actually
    /// listens on cannot be checked here; the verifier catches that.
    pub fn validate(&self) -> Result<(), RolloutError> {
        if self.name.is_empty() {
            return Err(RolloutError::InvalidSpec("name cannot be empty".to_string()));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(RolloutError::InvalidSpec(format!(
                "name `{}` must be lowercase alphanumeric or '-'",
                self.name
            )));
        }

        if self.namespace.is_empty() {
            return Err(RolloutError::InvalidSpec(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.replica_count == 0 {
            return Err(RolloutError::InvalidSpec(
                "replica_count must be at least 1".to_string(),
            ));
        }

        if self.container_port == 0 || self.service_port == 0 {
            return Err(RolloutError::InvalidSpec(
                "ports must be greater than 0".to_string(),
            ));
        }

        if self.image_reference.trim().is_empty() {
            return Err(RolloutError::InvalidSpec(
                "image_reference cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_spec() -> DeploymentSpec {
    DeploymentSpec {
        name: "app".to_string(),
        namespace: "default".to_string(),
        replica_count: 1,
        container_port: 5000,
        service_port: 80,
        resource_limits: ResourceQuantities {
            cpu: "500m".to_string(),
            memory: "256Mi".to_string(),
        },
        resource_requests: ResourceQuantities {
            cpu: "100m".to_string(),
            memory: "64Mi".to_string(),
        },
        image_reference: "ghcr.io/org/app:latest".to_string(),
        image_pull_secret: None,
    }
}
