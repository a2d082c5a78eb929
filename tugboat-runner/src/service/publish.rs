//! Artifact publishing service
//!
//! Builds the application image from a source context and pushes it to the
//! registry under a tag. Pushing an existing tag overwrites it, so the whole
//! publish step is safe to re-run; the pipeline retries it under the publish
//! retry policy.
//!
//! The tag moves between runs, so the returned reference is pinned to the
//! digest the registry reported for the push. A rebuilt image under the same
//! tag therefore changes the pod template and triggers a rollout.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};
use tugboat_core::error::BuildError;

use crate::config::{CommandTimeouts, ImageConfig, RegistryCredentials};
use crate::process::ToolCommand;

/// Service trait for publishing container images
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    /// Builds and pushes an image
    ///
    /// # Arguments
    /// * `build_context` - Directory containing the Dockerfile
    /// * `tag` - Tag to publish under
    ///
    /// # Returns
    /// The fully qualified image reference, pinned to the pushed digest
    async fn publish(&self, build_context: &Path, tag: &str) -> Result<String, BuildError>;
}

/// Docker CLI implementation of ArtifactPublisher
pub struct DockerPublisher {
    image: ImageConfig,
    credentials: RegistryCredentials,
    timeouts: CommandTimeouts,
}

impl DockerPublisher {
    pub fn new(
        image: ImageConfig,
        credentials: RegistryCredentials,
        timeouts: CommandTimeouts,
    ) -> Self {
        Self {
            image,
            credentials,
            timeouts,
        }
    }

    fn docker(&self) -> ToolCommand {
        ToolCommand::new(&self.image.builder)
    }

    /// Logs in with the token fed over stdin, when a token is configured
    async fn login(&self) -> Result<(), BuildError> {
        let Some(token) = &self.credentials.token else {
            debug!("No registry token configured, skipping login");
            return Ok(());
        };

        info!(
            "Logging in to {} as {}",
            self.image.registry, self.credentials.username
        );
        self.docker()
            .args([
                "login",
                self.image.registry.as_str(),
                "-u",
                self.credentials.username.as_str(),
                "--password-stdin",
            ])
            .stdin(token.as_bytes().to_vec())
            .run(self.timeouts.docker_login())
            .await
            .map_err(BuildError::Login)?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactPublisher for DockerPublisher {
    async fn publish(&self, build_context: &Path, tag: &str) -> Result<String, BuildError> {
        let reference = format!("{}/{}:{}", self.image.registry, self.image.repository, tag);
        validate_reference(&self.image.registry, &self.image.repository, tag)
            .map_err(|_| BuildError::InvalidReference(reference.clone()))?;

        self.login().await?;

        info!("Building {} from {}", reference, build_context.display());
        self.docker()
            .args(["build", "-t", reference.as_str()])
            .arg(build_context.to_string_lossy())
            .run(self.timeouts.docker_build())
            .await
            .map_err(BuildError::Build)?;

        info!("Pushing {}", reference);
        let output = self
            .docker()
            .args(["push", reference.as_str()])
            .run(self.timeouts.docker_push())
            .await
            .map_err(BuildError::Push)?;

        let digest = pushed_digest(&output.stdout)
            .ok_or_else(|| BuildError::MissingDigest(reference.clone()))?;
        let pinned = format!("{}@{}", reference, digest);

        info!("Published {}", pinned);
        Ok(pinned)
    }
}

/// Extracts the digest from push output (`<tag>: digest: sha256:<hex> size: <n>`)
fn pushed_digest(stdout: &str) -> Option<&str> {
    stdout.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        let digest = rest.split_whitespace().next()?;
        let (algorithm, hex) = digest.split_once(':')?;
        let valid = !algorithm.is_empty()
            && !hex.is_empty()
            && hex.chars().all(|c| c.is_ascii_hexdigit());
        valid.then_some(digest)
    })
}

/// Checks the parts of an image reference against the registry grammar
fn validate_reference(registry: &str, repository: &str, tag: &str) -> Result<(), String> {
    if registry.is_empty() || registry.contains(['/', ' ']) {
        return Err(format!("registry `{}` is not a host", registry));
    }

    let component_ok = |c: &str| {
        !c.is_empty()
            && c.chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
            && c.starts_with(|ch: char| ch.is_ascii_alphanumeric())
    };
    if !repository.split('/').all(component_ok) {
        return Err(format!("repository `{}` is not valid", repository));
    }

    let tag_ok = tag.len() <= 128
        && tag.starts_with(|ch: char| ch.is_ascii_alphanumeric() || ch == '_')
        && tag
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "._-".contains(ch));
    if !tag_ok {
        return Err(format!("tag `{}` is not valid", tag));
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Writes a fake `docker` that logs its arguments and any stdin
    fn fake_docker(dir: &TempDir, push_exit: i32, digest: &str) -> PathBuf {
        let log = dir.path().join("calls.log");
        let stdin_log = dir.path().join("stdin.log");
        let script = dir.path().join("docker");
        let body = format!(
            r#"#!/bin/sh
echo "$@" >> "{log}"
case "$1" in
  login) cat > "{stdin_log}"; echo "Login Succeeded" ;;
  build) echo "Successfully tagged $3" ;;
  push)
    if [ {push_exit} -ne 0 ]; then
      echo "denied: permission_denied: write_package" >&2
      exit {push_exit}
    fi
    echo "The push refers to repository [$2]"
    echo "latest: digest: {digest} size: 1234" ;;
esac
"#,
            log = log.display(),
            stdin_log = stdin_log.display(),
            push_exit = push_exit,
            digest = digest,
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn publisher(binary: PathBuf, token: Option<&str>) -> DockerPublisher {
        DockerPublisher::new(
            ImageConfig {
                builder: binary.to_string_lossy().to_string(),
                ..ImageConfig::default()
            },
            RegistryCredentials {
                username: "bot".to_string(),
                token: token.map(str::to_string),
            },
            CommandTimeouts::default(),
        )
    }

    fn calls(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_publish_logs_in_builds_and_pushes() {
        let dir = TempDir::new().unwrap();
        let binary = fake_docker(&dir, 0, "sha256:abc123");

        let reference = publisher(binary, Some("s3cret"))
            .publish(Path::new("./app"), "latest")
            .await
            .unwrap();

        assert_eq!(reference, "ghcr.io/org/app:latest@sha256:abc123");

        let calls = calls(&dir);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], "login ghcr.io -u bot --password-stdin");
        assert_eq!(calls[1], "build -t ghcr.io/org/app:latest ./app");
        assert_eq!(calls[2], "push ghcr.io/org/app:latest");

        // The token travels over stdin only
        assert!(!calls.iter().any(|c| c.contains("s3cret")));
        let stdin = std::fs::read_to_string(dir.path().join("stdin.log")).unwrap();
        assert_eq!(stdin, "s3cret");
    }

    #[tokio::test]
    async fn test_publish_without_token_skips_login() {
        let dir = TempDir::new().unwrap();
        let binary = fake_docker(&dir, 0, "sha256:abc123");

        publisher(binary, None)
            .publish(Path::new("."), "v1.2.0")
            .await
            .unwrap();

        let calls = calls(&dir);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("build"));
    }

    #[tokio::test]
    async fn test_push_failure_is_retryable() {
        let dir = TempDir::new().unwrap();
        let binary = fake_docker(&dir, 1, "sha256:abc123");

        let err = publisher(binary, None)
            .publish(Path::new("."), "latest")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Push(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("permission_denied"));
    }

    #[tokio::test]
    async fn test_invalid_tag_never_invokes_docker() {
        let dir = TempDir::new().unwrap();
        let binary = fake_docker(&dir, 0, "sha256:abc123");

        let err = publisher(binary, None)
            .publish(Path::new("."), "feature/branch")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::InvalidReference(_)));
        assert!(!err.is_retryable());
        assert!(calls(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_republished_tag_pins_new_digest() {
        let first_dir = TempDir::new().unwrap();
        let first = publisher(fake_docker(&first_dir, 0, "sha256:0a0a"), None)
            .publish(Path::new("."), "latest")
            .await
            .unwrap();

        let second_dir = TempDir::new().unwrap();
        let second = publisher(fake_docker(&second_dir, 0, "sha256:1b1b"), None)
            .publish(Path::new("."), "latest")
            .await
            .unwrap();

        assert_eq!(first, "ghcr.io/org/app:latest@sha256:0a0a");
        assert_eq!(second, "ghcr.io/org/app:latest@sha256:1b1b");
    }

    #[tokio::test]
    async fn test_push_without_digest_fails() {
        let dir = TempDir::new().unwrap();
        let binary = fake_docker(&dir, 0, "<none>");

        let err = publisher(binary, None)
            .publish(Path::new("."), "latest")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::MissingDigest(ref r) if r == "ghcr.io/org/app:latest"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_pushed_digest() {
        let out = "The push refers to repository [ghcr.io/org/app]\n5f70bf18a086: Pushed\nlatest: digest: sha256:9f86d081 size: 528\n";
        assert_eq!(pushed_digest(out), Some("sha256:9f86d081"));
        assert_eq!(pushed_digest("5f70bf18a086: Layer already exists\n"), None);
        assert_eq!(pushed_digest("latest: digest: sha256:xyz size: 1"), None);
    }

    #[test]
    fn test_validate_reference() {
        assert!(validate_reference("ghcr.io", "org/app", "latest").is_ok());
        assert!(validate_reference("localhost:5000", "team/sub/app", "1.0.0-rc1").is_ok());
        assert!(validate_reference("ghcr.io", "Org/App", "latest").is_err());
        assert!(validate_reference("ghcr.io", "org//app", "latest").is_err());
        assert!(validate_reference("ghcr.io", "org/app", "").is_err());
        assert!(validate_reference("ghcr.io", "org/app", ".hidden").is_err());
        assert!(validate_reference("", "org/app", "latest").is_err());
    }
}
