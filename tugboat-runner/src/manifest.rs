//! Manifest rendering
//!
//! Turns a [`DeploymentSpec`] into the descriptor set submitted to the
//! cluster: a Deployment, a Service and an Ingress routing `/` to the
//! service, plus an image pull Secret when registry credentials are known.
//! Rendering is deterministic so the same spec always produces the same
//! payload, which keeps re-applies idempotent.

use serde_json::{Value as JsonValue, json};
use tugboat_core::domain::deployment::DeploymentSpec;

/// Credentials used to render the image pull secret
#[derive(Clone)]
pub struct PullSecret {
    pub registry: String,
    pub username: String,
    pub token: String,
}

impl std::fmt::Debug for PullSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSecret")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Rendered descriptors for one deployment
#[derive(Clone, PartialEq)]
pub struct ManifestSet {
    pub deployment: JsonValue,
    pub service: JsonValue,
    pub ingress: JsonValue,
    secret: Option<JsonValue>,
}

impl ManifestSet {
    /// Renders the manifests for `spec`
    ///
    /// The secret is only rendered when `spec` references a pull secret and
    /// credentials are supplied.
    pub fn render(spec: &DeploymentSpec, pull_secret: Option<&PullSecret>) -> Self {
        let secret = match (&spec.image_pull_secret, pull_secret) {
            (Some(name), Some(credentials)) => Some(render_pull_secret(spec, name, credentials)),
            _ => None,
        };

        Self {
            deployment: render_deployment(spec),
            service: render_service(spec),
            ingress: render_ingress(spec),
            secret,
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// A `v1/List` of every object, submitted in a single apply
    pub fn to_apply_payload(&self) -> String {
        let mut items = Vec::new();
        if let Some(secret) = &self.secret {
            items.push(secret.clone());
        }
        items.push(self.deployment.clone());
        items.push(self.service.clone());
        items.push(self.ingress.clone());

        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": items,
        })
        .to_string()
    }

    /// Human-readable rendering without the secret, for dry runs
    pub fn to_display(&self) -> String {
        let list = json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [self.deployment, self.service, self.ingress],
        });
        serde_json::to_string_pretty(&list).unwrap_or_default()
    }
}

fn metadata(spec: &DeploymentSpec, name: &str) -> JsonValue {
    json!({
        "name": name,
        "namespace": spec.namespace,
        "labels": spec.labels(),
    })
}

fn render_deployment(spec: &DeploymentSpec) -> JsonValue {
    let mut pod_spec = json!({
        "containers": [{
            "name": spec.name,
            "image": spec.image_reference,
            "imagePullPolicy": "Always",
            "ports": [{
                "name": "http",
                "containerPort": spec.container_port,
                "protocol": "TCP",
            }],
            "resources": {
                "limits": {
                    "cpu": spec.resource_limits.cpu,
                    "memory": spec.resource_limits.memory,
                },
                "requests": {
                    "cpu": spec.resource_requests.cpu,
                    "memory": spec.resource_requests.memory,
                },
            },
        }],
    });

    if let Some(secret) = &spec.image_pull_secret {
        pod_spec["imagePullSecrets"] = json!([{ "name": secret }]);
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(spec, &spec.name),
        "spec": {
            "replicas": spec.replica_count,
            "selector": { "matchLabels": { "app": spec.name } },
            "template": {
                "metadata": { "labels": spec.labels() },
                "spec": pod_spec,
            },
        },
    })
}

fn render_service(spec: &DeploymentSpec) -> JsonValue {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(spec, &spec.name),
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": spec.name },
            "ports": [{
                "name": "http",
                "port": spec.service_port,
                "targetPort": spec.container_port,
                "protocol": "TCP",
            }],
        },
    })
}

fn render_ingress(spec: &DeploymentSpec) -> JsonValue {
    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": metadata(spec, &spec.name),
        "spec": {
            "rules": [{
                "http": {
                    "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {
                            "service": {
                                "name": spec.name,
                                "port": { "number": spec.service_port },
                            },
                        },
                    }],
                },
            }],
        },
    })
}

/// Registry credentials as a docker config secret
///
/// Uses `stringData` so the orchestrator handles the encoding.
fn render_pull_secret(spec: &DeploymentSpec, name: &str, credentials: &PullSecret) -> JsonValue {
    let mut auths = serde_json::Map::new();
    auths.insert(
        credentials.registry.clone(),
        json!({
            "username": credentials.username,
            "password": credentials.token,
        }),
    );
    let docker_config = json!({ "auths": auths });

    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "kubernetes.io/dockerconfigjson",
        "metadata": metadata(spec, name),
        "stringData": {
            ".dockerconfigjson": docker_config.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tugboat_core::domain::deployment::ResourceQuantities;

    fn spec() -> DeploymentSpec {
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

    fn credentials() -> PullSecret {
        PullSecret {
            registry: "ghcr.io".to_string(),
            username: "bot".to_string(),
            token: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = ManifestSet::render(&spec(), None).to_apply_payload();
        let second = ManifestSet::render(&spec(), None).to_apply_payload();
        assert_eq!(first, second);
    }

    #[test]
    fn test_deployment_shape() {
        let set = ManifestSet::render(&spec(), None);
        let container = &set.deployment["spec"]["template"]["spec"]["containers"][0];

        assert_eq!(set.deployment["spec"]["replicas"], 1);
        assert_eq!(container["image"], "ghcr.io/org/app:latest");
        assert_eq!(container["ports"][0]["containerPort"], 5000);
        assert_eq!(container["resources"]["limits"]["memory"], "256Mi");
        assert_eq!(set.deployment["spec"]["selector"]["matchLabels"]["app"], "app");
        assert!(
            set.deployment["spec"]["template"]["spec"]
                .get("imagePullSecrets")
                .is_none()
        );
    }

    #[test]
    fn test_service_targets_container_port() {
        let set = ManifestSet::render(&spec(), None);
        assert_eq!(set.service["spec"]["ports"][0]["port"], 80);
        assert_eq!(set.service["spec"]["ports"][0]["targetPort"], 5000);
        assert_eq!(
            set.ingress["spec"]["rules"][0]["http"]["paths"][0]["backend"]["service"]["port"]["number"],
            80
        );
    }

    #[test]
    fn test_payload_is_single_list() {
        let payload = ManifestSet::render(&spec(), None).to_apply_payload();
        let value: JsonValue = serde_json::from_str(&payload).unwrap();
        let kinds: Vec<_> = value["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(value["kind"], "List");
        assert_eq!(kinds, vec!["Deployment", "Service", "Ingress"]);
    }

    #[test]
    fn test_pull_secret_rendered_when_referenced() {
        let mut spec = spec();

        // Credentials alone are not enough: the spec must reference a secret
        let set = ManifestSet::render(&spec, Some(&credentials()));
        assert!(!set.has_secret());

        spec.image_pull_secret = Some("registry-credentials".to_string());
        let set = ManifestSet::render(&spec, Some(&credentials()));
        assert!(set.has_secret());

        let payload: JsonValue = serde_json::from_str(&set.to_apply_payload()).unwrap();
        assert_eq!(payload["items"][0]["kind"], "Secret");
        assert_eq!(
            set.deployment["spec"]["template"]["spec"]["imagePullSecrets"][0]["name"],
            "registry-credentials"
        );

        // Dry-run output never contains the token
        assert!(!set.to_display().contains("s3cret"));
        assert!(!format!("{:?}", credentials()).contains("s3cret"));
    }
}
