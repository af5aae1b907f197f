//! Pod template synthesis.
//!
//! Turns a declarative deployment request (image revision, edge paths,
//! environment variables) into the orchestrator's pod template: resolves
//! indirect variables through the edge KVM, derives container ports and the
//! `PORT`/`PORT{n}` convention from the declared paths, injects the routing
//! credential and security defaults, and attaches the routing labels and
//! annotations. The template is built in isolation and only returned on
//! full success.

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::config::Settings;
use crate::edge::EdgeApi;
use crate::error::Error;
use crate::provision::{ROUTING_SECRET, SECRET_KEY_PUBLIC};

pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_APP: &str = "app";
pub const LABEL_REVISION: &str = "revision";
pub const LABEL_ROUTABLE: &str = "routable";
pub const LABEL_RUNTIME: &str = "runtime";
pub const RUNTIME_NAME: &str = "gangway";

pub const ANNOTATION_EDGE_PATHS: &str = "edge/paths";
pub const ANNOTATION_ROUTING_POLICY: &str = "edge/routing-policy";
pub const ANNOTATION_PUBLIC_HOSTS: &str = "publicHosts";
pub const ANNOTATION_PRIVATE_HOSTS: &str = "privateHosts";

const DEFAULT_EDGE_PORT: i32 = 9000;

/// A routable HTTP path mapped to a container port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgePath {
    pub base_path: String,
    pub container_port: i32,
    pub target_path: String,
}

/// Declared environment variable: a literal value or an indirect reference
/// into the edge key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariable {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_from: Option<EnvVarReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarReference {
    pub edge_config_ref: KvmSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvmSelector {
    pub name: String,
    pub key: String,
}

/// Body of `POST .../deployments`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub deployment_name: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub edge_paths: Option<Vec<EdgePath>>,
    #[serde(default)]
    pub env_vars: Option<Vec<EnvironmentVariable>>,
    #[serde(default)]
    pub public_hosts: Option<String>,
    #[serde(default)]
    pub private_hosts: Option<String>,
}

// Each path segment is RFC3986 pchar-safe characters or a percent-encoded
// octet.
static PATH_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9\-._~!$&'()*+,;=:@]|%[0-9A-Fa-f]{2})*$").expect("valid regex")
});

/// Is this a syntactically valid absolute path?
pub fn validate_path(path: &str) -> bool {
    match path.strip_prefix('/') {
        None => false,
        Some(rest) => rest.split('/').all(|seg| PATH_SEGMENT_RE.is_match(seg)),
    }
}

/// Validate every declared edge path.
pub fn validate_edge_paths(paths: &[EdgePath]) -> Result<(), Error> {
    for path in paths {
        if !validate_path(&path.base_path) {
            return Err(Error::validation(format!(
                "invalid basePath: {}",
                path.base_path
            )));
        }
        if !validate_path(&path.target_path) {
            return Err(Error::validation(format!(
                "invalid targetPath: {}",
                path.target_path
            )));
        }
        if !(1..=65535).contains(&path.container_port) {
            return Err(Error::validation(format!(
                "invalid containerPort: {}",
                path.container_port
            )));
        }
    }
    Ok(())
}

/// Distinct container ports in first-seen order.
pub fn distinct_ports(paths: &[EdgePath]) -> Vec<i32> {
    let mut ports = Vec::new();
    for path in paths {
        if !ports.contains(&path.container_port) {
            ports.push(path.container_port);
        }
    }
    ports
}

/// Derive the `PORT` convention: a single distinct port yields one `PORT`
/// variable; N distinct ports yield `PORT0`..`PORT{N-1}` in first-seen
/// order.
pub fn port_env_vars(ports: &[i32]) -> Vec<EnvVar> {
    if ports.len() == 1 {
        return vec![literal_env("PORT", &ports[0].to_string())];
    }
    ports
        .iter()
        .enumerate()
        .map(|(i, port)| literal_env(&format!("PORT{i}"), &port.to_string()))
        .collect()
}

/// Merge `incoming` into `current`: same-name entries are overridden in
/// place (keeping their first-seen position), new names are appended.
/// Idempotent.
pub fn merge_env_vars(current: Vec<EnvVar>, incoming: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut merged = current;
    for var in incoming {
        match merged.iter_mut().find(|existing| existing.name == var.name) {
            Some(existing) => *existing = var,
            None => merged.push(var),
        }
    }
    merged
}

/// Drop previously derived `PORT`/`PORT{n}` variables so a changed path set
/// never leaves stale port variables behind.
pub fn strip_port_vars(vars: Vec<EnvVar>) -> Vec<EnvVar> {
    vars.into_iter().filter(|v| !is_port_var(&v.name)).collect()
}

fn is_port_var(name: &str) -> bool {
    match name.strip_prefix("PORT") {
        Some("") => true,
        Some(rest) => rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

fn literal_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// The `API_KEY` variable, sourced from the environment's routing secret.
pub fn api_key_env_var() -> EnvVar {
    EnvVar {
        name: "API_KEY".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: ROUTING_SECRET.to_string(),
                key: SECRET_KEY_PUBLIC.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
    }
}

/// Default path set when the request declares none.
pub fn default_edge_paths(deployment_name: &str) -> Vec<EdgePath> {
    vec![EdgePath {
        base_path: format!("/{deployment_name}"),
        container_port: DEFAULT_EDGE_PORT,
        target_path: "/".to_string(),
    }]
}

/// Serialized edge-path annotation, pretty-printed so clients comparing the
/// annotation byte-for-byte see a stable form.
pub fn edge_paths_json(paths: &[EdgePath]) -> Result<String, Error> {
    serde_json::to_string_pretty(paths)
        .map_err(|err| Error::validation(format!("cannot serialize edge paths: {err}")))
}

/// Network-policy annotation value referencing the pod CIDR and the derived
/// port list.
pub fn routing_policy(pod_cidr: &str, ports: &[i32]) -> String {
    let ports = ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("allow tcp from cidr {pod_cidr} to ports {ports}; allow tcp from app=ingress")
}

/// Resolve declared variables into literal orchestrator variables. Any
/// `valueFrom` reference is read from the edge KVM; if the KVM integration
/// is disabled and a variable requires resolution, the whole request fails.
pub async fn resolve_env_vars(
    edge: &dyn EdgeApi,
    kvm_enabled: bool,
    vars: &[EnvironmentVariable],
    tenant: &str,
    env: &str,
) -> Result<Vec<EnvVar>, Error> {
    let mut resolved = Vec::with_capacity(vars.len());
    for var in vars {
        match &var.value_from {
            None => resolved.push(EnvVar {
                name: var.name.clone(),
                value: var.value.clone(),
                value_from: None,
            }),
            Some(reference) => {
                if !kvm_enabled {
                    return Err(Error::FeatureDisabled(format!(
                        "resolving environment variable {}",
                        var.name
                    )));
                }
                let selector = &reference.edge_config_ref;
                let value = edge
                    .read_kvm_entry(tenant, env, &selector.name, &selector.key)
                    .await?;
                resolved.push(literal_env(&var.name, &value));
            }
        }
    }
    Ok(resolved)
}

/// Pod template synthesizer.
pub struct Synthesizer<'a> {
    settings: &'a Settings,
    edge: &'a dyn EdgeApi,
}

impl<'a> Synthesizer<'a> {
    pub fn new(settings: &'a Settings, edge: &'a dyn EdgeApi) -> Self {
        Synthesizer { settings, edge }
    }

    /// Build the pod template for a deployment request.
    pub async fn synthesize(
        &self,
        request: &DeploymentRequest,
        tenant: &str,
        env: &str,
    ) -> Result<PodTemplateSpec, Error> {
        if self.settings.image_base_uri.is_empty() {
            return Err(Error::validation(
                "no container image base URI is configured",
            ));
        }
        if request.deployment_name.is_empty() {
            return Err(Error::validation("deploymentName is required"));
        }

        let paths = match &request.edge_paths {
            Some(paths) if !paths.is_empty() => {
                validate_edge_paths(paths)?;
                paths.clone()
            }
            _ => default_edge_paths(&request.deployment_name),
        };
        let ports = distinct_ports(&paths);

        let declared = request.env_vars.as_deref().unwrap_or_default();
        let resolved = resolve_env_vars(
            self.edge,
            self.settings.routing_kvm_enabled,
            declared,
            tenant,
            env,
        )
        .await?;

        let env_vars = merge_env_vars(
            merge_env_vars(resolved, vec![api_key_env_var()]),
            port_env_vars(&ports),
        );

        let revision = request.revision.as_deref().unwrap_or("1");
        let image = format!(
            "{}/{}-{}/{}:{}",
            self.settings.image_base_uri, tenant, env, request.deployment_name, revision
        );

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_COMPONENT.into(), request.deployment_name.clone());
        labels.insert(LABEL_APP.into(), request.deployment_name.clone());
        labels.insert(LABEL_REVISION.into(), revision.to_string());
        labels.insert("organization".into(), tenant.to_string());
        labels.insert("environment".into(), env.to_string());
        labels.insert(LABEL_ROUTABLE.into(), "true".into());
        labels.insert(LABEL_RUNTIME.into(), RUNTIME_NAME.into());

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_EDGE_PATHS.into(), edge_paths_json(&paths)?);
        annotations.insert(
            ANNOTATION_ROUTING_POLICY.into(),
            routing_policy(&self.settings.pod_cidr, &ports),
        );
        if let Some(hosts) = &request.public_hosts {
            annotations.insert(ANNOTATION_PUBLIC_HOSTS.into(), hosts.clone());
        }
        if let Some(hosts) = &request.private_hosts {
            annotations.insert(ANNOTATION_PRIVATE_HOSTS.into(), hosts.clone());
        }

        let security_context = if self.settings.allow_privileged {
            None
        } else {
            Some(SecurityContext {
                privileged: Some(false),
                ..SecurityContext::default()
            })
        };

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: request.deployment_name.clone(),
                    image: Some(image),
                    env: Some(env_vars),
                    ports: Some(
                        ports
                            .iter()
                            .map(|port| ContainerPort {
                                container_port: *port,
                                ..ContainerPort::default()
                            })
                            .collect(),
                    ),
                    security_context,
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
        })
    }
}
