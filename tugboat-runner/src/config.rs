//! Pipeline configuration
//!
//! Every option the pipeline reads lives in [`Config`]: region, ports, image
//! coordinates, registry credentials, per-stage retry policies and the
//! timeouts for each external tool. Nothing is read from the environment
//! after the config has been built.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables (see [`Config::apply_overrides`])

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tugboat_core::domain::deployment::{DeploymentSpec, ResourceQuantities};
use tugboat_core::domain::policy::RetryPolicy;
use tugboat_core::error::ConfigError;

use crate::manifest::PullSecret;
use crate::service::InfraVar;

/// Headroom between the docker timeouts and the publish attempt timeout
const PUBLISH_ATTEMPT_SLACK: Duration = Duration::from_secs(30);

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Cloud region handed to terraform
    pub region: String,

    /// Port the application listens on inside its container
    pub container_port: u16,

    /// Port the cluster service exposes to the ingress
    pub service_port: u16,

    pub image: ImageConfig,
    pub registry: RegistryCredentials,
    pub terraform: TerraformConfig,
    pub ssh: SshConfig,
    pub cluster: ClusterConfig,
    pub deployment: DeploymentConfig,
    pub retry: RetryPolicies,
    pub timeouts: CommandTimeouts,
    pub verify: VerifyConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// Container build tool binary
    pub builder: String,
    /// Registry host, e.g. "ghcr.io"
    pub registry: String,
    /// Repository path within the registry, e.g. "org/app"
    pub repository: String,
    pub tag: String,
    /// Directory containing the Dockerfile
    pub build_context: PathBuf,
}

/// Registry login; the token is never printed
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryCredentials {
    pub username: String,
    pub token: Option<String>,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerraformConfig {
    pub binary: String,
    /// Directory holding the terraform configuration
    pub dir: PathBuf,
    /// Output holding the instance's public address
    pub address_output: String,
    /// Output holding the PEM private key
    pub key_output: String,
    /// Additional `-var` values passed to apply
    pub extra_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Control client invocation on the remote host
    pub kubectl: String,
    pub ingress_namespace: String,
    /// Label selector for the ingress controller pods
    pub ingress_selector: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentConfig {
    pub name: String,
    pub namespace: String,
    pub replicas: u32,
    pub limits: ResourceQuantities,
    pub requests: ResourceQuantities,
    /// Name of the image pull secret created from the registry credentials
    pub pull_secret: String,
}

/// Retry policy for every bounded wait in the pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicies {
    pub ssh: RetryPolicy,
    pub cluster_api: RetryPolicy,
    pub publish: RetryPolicy,
    pub rollout: RetryPolicy,
    pub verify: RetryPolicy,
}

/// Upper bounds on individual external-tool invocations, in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTimeouts {
    pub terraform_init_secs: u64,
    pub terraform_apply_secs: u64,
    pub terraform_output_secs: u64,
    pub docker_login_secs: u64,
    pub docker_build_secs: u64,
    pub docker_push_secs: u64,
    pub remote_command_secs: u64,
}

impl CommandTimeouts {
    pub fn terraform_init(&self) -> Duration {
        Duration::from_secs(self.terraform_init_secs)
    }

    pub fn terraform_apply(&self) -> Duration {
        Duration::from_secs(self.terraform_apply_secs)
    }

    pub fn terraform_output(&self) -> Duration {
        Duration::from_secs(self.terraform_output_secs)
    }

    pub fn docker_login(&self) -> Duration {
        Duration::from_secs(self.docker_login_secs)
    }

    pub fn docker_build(&self) -> Duration {
        Duration::from_secs(self.docker_build_secs)
    }

    pub fn docker_push(&self) -> Duration {
        Duration::from_secs(self.docker_push_secs)
    }

    pub fn remote_command(&self) -> Duration {
        Duration::from_secs(self.remote_command_secs)
    }

    /// Worst case for one publish attempt: login, build and push back to back
    pub fn publish_attempt(&self) -> Duration {
        self.docker_login() + self.docker_build() + self.docker_push()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    pub path: String,
    pub expected_status: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsConfig {
    /// Ports probed with a raw TCP connect
    pub ports: Vec<u16>,
    pub log_tail_lines: u32,
    pub probe_timeout_secs: u64,
}

fn policy(max_attempts: u32, interval_secs: u64, attempt_timeout_secs: u64) -> RetryPolicy {
    RetryPolicy::from_timeout(
        Duration::from_secs((interval_secs + attempt_timeout_secs) * max_attempts as u64),
        Duration::from_secs(interval_secs),
        Duration::from_secs(attempt_timeout_secs),
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            container_port: 5000,
            service_port: 80,
            image: ImageConfig::default(),
            registry: RegistryCredentials::default(),
            terraform: TerraformConfig::default(),
            ssh: SshConfig::default(),
            cluster: ClusterConfig::default(),
            deployment: DeploymentConfig::default(),
            retry: RetryPolicies::default(),
            timeouts: CommandTimeouts::default(),
            verify: VerifyConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            builder: "docker".to_string(),
            registry: "ghcr.io".to_string(),
            repository: "org/app".to_string(),
            tag: "latest".to_string(),
            build_context: PathBuf::from("."),
        }
    }
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            dir: PathBuf::from("infra"),
            address_output: "public_ip".to_string(),
            key_output: "private_key_pem".to_string(),
            extra_vars: BTreeMap::new(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: "sudo k3s kubectl".to_string(),
            ingress_namespace: "kube-system".to_string(),
            ingress_selector: "app.kubernetes.io/name=traefik".to_string(),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            namespace: "default".to_string(),
            replicas: 1,
            limits: ResourceQuantities {
                cpu: "500m".to_string(),
                memory: "256Mi".to_string(),
            },
            requests: ResourceQuantities {
                cpu: "100m".to_string(),
                memory: "64Mi".to_string(),
            },
            pull_secret: "registry-credentials".to_string(),
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            ssh: policy(30, 10, 5),
            cluster_api: policy(30, 10, 15),
            publish: policy(3, 15, 1800),
            rollout: policy(30, 10, 15),
            verify: policy(10, 10, 5),
        }
    }
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            terraform_init_secs: 300,
            terraform_apply_secs: 1800,
            terraform_output_secs: 60,
            docker_login_secs: 60,
            docker_build_secs: 1200,
            docker_push_secs: 600,
            remote_command_secs: 60,
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            expected_status: 200,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            ports: vec![22, 80, 443, 6443],
            log_tail_lines: 200,
            probe_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Loads configuration from an optional TOML file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML config file; missing keys fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|reason| ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Applies environment overrides through `lookup`
    ///
    /// Recognised variables:
    /// - TUGBOAT_REGION
    /// - TUGBOAT_CONTAINER_PORT
    /// - TUGBOAT_IMAGE_REPOSITORY
    /// - TUGBOAT_IMAGE_TAG
    /// - TUGBOAT_REPLICAS
    /// - REGISTRY_USERNAME
    /// - REGISTRY_TOKEN
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(region) = lookup("TUGBOAT_REGION") {
            self.region = region;
        }

        if let Some(port) = lookup("TUGBOAT_CONTAINER_PORT") {
            self.container_port = port.parse().map_err(|_| {
                ConfigError::Invalid(format!("TUGBOAT_CONTAINER_PORT `{}` is not a port", port))
            })?;
        }

        if let Some(repository) = lookup("TUGBOAT_IMAGE_REPOSITORY") {
            self.image.repository = repository;
        }

        if let Some(tag) = lookup("TUGBOAT_IMAGE_TAG") {
            self.image.tag = tag;
        }

        if let Some(replicas) = lookup("TUGBOAT_REPLICAS") {
            self.deployment.replicas = replicas.parse().map_err(|_| {
                ConfigError::Invalid(format!("TUGBOAT_REPLICAS `{}` is not a number", replicas))
            })?;
        }

        if let Some(username) = lookup("REGISTRY_USERNAME") {
            self.registry.username = username;
        }

        if let Some(token) = lookup("REGISTRY_TOKEN").filter(|t| !t.is_empty()) {
            self.registry.token = Some(token);
        }

        Ok(())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.region.is_empty() {
            return invalid("region cannot be empty");
        }

        if self.container_port == 0 || self.service_port == 0 {
            return invalid("ports must be greater than 0");
        }

        if self.image.registry.is_empty() || self.image.repository.is_empty() {
            return invalid("image registry and repository cannot be empty");
        }

        if self.image.tag.is_empty() || self.image.tag.contains(['/', ':', ' ']) {
            return invalid("image tag must be non-empty and contain no '/', ':' or spaces");
        }

        if self.deployment.replicas == 0 {
            return invalid("deployment replicas must be at least 1");
        }

        if self.deployment.name.is_empty() || self.deployment.namespace.is_empty() {
            return invalid("deployment name and namespace cannot be empty");
        }

        if self.ssh.user.is_empty() {
            return invalid("ssh user cannot be empty");
        }

        if self.cluster.kubectl.trim().is_empty() {
            return invalid("cluster kubectl command cannot be empty");
        }

        if !self.verify.path.starts_with('/') {
            return invalid("verify path must start with '/'");
        }

        let timeouts = [
            self.timeouts.terraform_init_secs,
            self.timeouts.terraform_apply_secs,
            self.timeouts.terraform_output_secs,
            self.timeouts.docker_login_secs,
            self.timeouts.docker_build_secs,
            self.timeouts.docker_push_secs,
            self.timeouts.remote_command_secs,
        ];
        if timeouts.contains(&0) {
            return invalid("command timeouts must be greater than 0");
        }

        Ok(())
    }

    /// Publish retry policy, with room for every docker command of an attempt
    /// to hit its own timeout before the attempt itself is cancelled
    pub fn publish_policy(&self) -> RetryPolicy {
        self.retry
            .publish
            .with_min_attempt_timeout(self.timeouts.publish_attempt() + PUBLISH_ATTEMPT_SLACK)
    }

    /// Fully qualified image reference for this run
    pub fn image_reference(&self) -> String {
        format!(
            "{}/{}:{}",
            self.image.registry, self.image.repository, self.image.tag
        )
    }

    /// Variables passed to terraform apply
    pub fn terraform_vars(&self) -> Vec<InfraVar> {
        let mut vars = vec![InfraVar::new("region", &self.region)];

        if !self.registry.username.is_empty() {
            vars.push(InfraVar::new("registry_username", &self.registry.username));
        }

        if let Some(token) = &self.registry.token {
            vars.push(InfraVar::secret("registry_token", token));
        }

        for (key, value) in &self.terraform.extra_vars {
            vars.push(InfraVar::new(key, value));
        }

        vars
    }

    /// Credentials rendered into the image pull secret, when a token is set
    pub fn pull_secret(&self) -> Option<PullSecret> {
        let token = self
            .registry
            .token
            .clone()
            .filter(|_| !self.registry.username.is_empty())?;
        Some(PullSecret {
            registry: self.image.registry.clone(),
            username: self.registry.username.clone(),
            token,
        })
    }

    /// Deployment spec for the given image
    ///
    /// A pull secret is only referenced when registry credentials exist.
    pub fn deployment_spec(&self, image_reference: &str) -> DeploymentSpec {
        let image_pull_secret = self
            .registry
            .token
            .as_ref()
            .filter(|_| !self.registry.username.is_empty())
            .map(|_| self.deployment.pull_secret.clone());

        DeploymentSpec {
            name: self.deployment.name.clone(),
            namespace: self.deployment.namespace.clone(),
            replica_count: self.deployment.replicas,
            container_port: self.container_port,
            service_port: self.service_port,
            resource_limits: self.deployment.limits.clone(),
            resource_requests: self.deployment.requests.clone(),
            image_reference: image_reference.to_string(),
            image_pull_secret,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.container_port, 5000);
        assert_eq!(config.image_reference(), "ghcr.io/org/app:latest");
        assert_eq!(config.retry.verify.max_attempts(), 10);
        assert_eq!(config.retry.verify.interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_publish_policy_outlasts_docker_timeouts() {
        let mut config = Config::default();
        let policy = config.publish_policy();
        assert_eq!(config.timeouts.publish_attempt(), Duration::from_secs(1860));
        assert!(policy.per_attempt_timeout() > config.timeouts.publish_attempt());
        assert_eq!(policy.max_attempts(), config.retry.publish.max_attempts());

        config.timeouts.docker_build_secs = 3600;
        assert_eq!(
            config.publish_policy().per_attempt_timeout(),
            Duration::from_secs(60 + 3600 + 600) + PUBLISH_ATTEMPT_SLACK
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.deployment.replicas = 0;
        assert!(config.validate().is_err());
        config.deployment.replicas = 2;

        config.image.tag = "bad:tag".to_string();
        assert!(config.validate().is_err());
        config.image.tag = "v1".to_string();

        config.verify.path = "health".to_string();
        assert!(config.validate().is_err());
        config.verify.path = "/health".to_string();

        config.timeouts.terraform_apply_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            region = "eu-west-1"
            container_port = 8080

            [image]
            repository = "acme/web"
            tag = "v2"

            [retry.verify]
            max_attempts = 5
            interval_secs = 2
            attempt_timeout_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.container_port, 8080);
        assert_eq!(config.image.registry, "ghcr.io");
        assert_eq!(config.image_reference(), "ghcr.io/acme/web:v2");
        assert_eq!(config.retry.verify.max_attempts(), 5);
        // Untouched policies keep their defaults
        assert_eq!(config.retry.ssh.max_attempts(), 30);
    }

    #[test]
    fn test_from_toml_rejects_unbounded_policy() {
        let result = Config::from_toml(
            r#"
            [retry.rollout]
            max_attempts = 0
            interval_secs = 2
            attempt_timeout_secs = 3
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(Config::from_toml("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TUGBOAT_REGION", "ap-south-1"),
            ("TUGBOAT_CONTAINER_PORT", "9000"),
            ("TUGBOAT_IMAGE_TAG", "sha-abc123"),
            ("REGISTRY_USERNAME", "bot"),
            ("REGISTRY_TOKEN", "s3cret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.region, "ap-south-1");
        assert_eq!(config.container_port, 9000);
        assert_eq!(config.image.tag, "sha-abc123");
        assert_eq!(config.registry.token.as_deref(), Some("s3cret"));
        assert!(!format!("{:?}", config.registry).contains("s3cret"));
    }

    #[test]
    fn test_env_override_bad_port() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == "TUGBOAT_CONTAINER_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_terraform_vars_mark_token_secret() {
        let mut config = Config::default();
        config.registry.username = "bot".to_string();
        config.registry.token = Some("s3cret".to_string());

        let vars = config.terraform_vars();
        let token = vars.iter().find(|v| v.name == "registry_token").unwrap();
        assert!(token.secret);
        let region = vars.iter().find(|v| v.name == "region").unwrap();
        assert!(!region.secret);
        assert_eq!(region.value, "us-east-1");
    }

    #[test]
    fn test_deployment_spec_pull_secret() {
        let mut config = Config::default();
        let spec = config.deployment_spec("ghcr.io/org/app:latest");
        assert_eq!(spec.image_pull_secret, None);
        assert_eq!(spec.container_port, 5000);
        assert!(spec.validate().is_ok());
        assert!(config.pull_secret().is_none());

        config.registry.username = "bot".to_string();
        config.registry.token = Some("s3cret".to_string());
        let spec = config.deployment_spec("ghcr.io/org/app:latest");
        assert_eq!(
            spec.image_pull_secret.as_deref(),
            Some("registry-credentials")
        );
        let secret = config.pull_secret().unwrap();
        assert_eq!(secret.registry, "ghcr.io");
        assert_eq!(secret.username, "bot");
    }
}
