//! Environment provisioning.
//!
//! An environment is a namespace named `{tenant}-{env}` plus an opaque
//! secret named `routing` holding a generated public/private key pair. The
//! namespace and secret are created together or not at all: a secret
//! failure rolls the namespace back, and a failed rollback is surfaced as
//! its own, more severe error.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::{error, info};

use crate::cluster::ClusterApi;
use crate::config::Settings;
use crate::edge::EdgeApi;
use crate::error::{is_kube_conflict, is_kube_not_found, Error};
use crate::template::{LABEL_RUNTIME, RUNTIME_NAME};

pub const ANNOTATION_HOST_NAMES: &str = "hostNames";
pub const ANNOTATION_NETWORK_POLICY: &str = "net.beta.kubernetes.io/network-policy";
pub const ISOLATION_POLICY: &str = r#"{"ingress": {"isolation": "DefaultDeny"}}"#;

/// Secret object name inside every environment namespace.
pub const ROUTING_SECRET: &str = "routing";
pub const SECRET_KEY_PUBLIC: &str = "public-api-key";
pub const SECRET_KEY_PRIVATE: &str = "private-api-key";

static ENV_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9](?:[a-z0-9-]*[a-z0-9])?):([a-z0-9](?:[a-z0-9-]*[a-z0-9])?)$")
        .expect("valid regex")
});

/// Split a compound `tenant:env` key, enforcing the name grammar. Both
/// halves must survive as DNS-label components of the namespace name.
pub fn parse_environment_name(name: &str) -> Result<(String, String), Error> {
    let captures = ENV_NAME_RE
        .captures(name)
        .ok_or_else(|| Error::validation(format!("not a valid environment name: {name}")))?;
    Ok((captures[1].to_string(), captures[2].to_string()))
}

/// Namespace name for a tenant/env pair.
pub fn namespace_name(tenant: &str, env: &str) -> String {
    format!("{tenant}-{env}")
}

/// 32 bytes from the OS RNG, base64-encoded.
fn generate_credential() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

fn host_names_annotation(hosts: &BTreeSet<String>) -> String {
    hosts.iter().cloned().collect::<Vec<_>>().join(" ")
}

/// A freshly provisioned or fetched environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub host_names: Vec<String>,
    pub public_secret: String,
    pub private_secret: String,
}

pub struct Provisioner<'a> {
    cluster: &'a dyn ClusterApi,
    edge: &'a dyn EdgeApi,
    settings: &'a Settings,
}

impl<'a> Provisioner<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, edge: &'a dyn EdgeApi, settings: &'a Settings) -> Self {
        Provisioner {
            cluster,
            edge,
            settings,
        }
    }

    /// Does the environment's namespace already exist?
    pub async fn environment_exists(&self, tenant: &str, env: &str) -> Result<bool, Error> {
        match self.cluster.get_namespace(&namespace_name(tenant, env)).await {
            Ok(_) => Ok(true),
            Err(err) if is_kube_not_found(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Provision a new environment. Callers must have routed "already
    /// exists" elsewhere; this operation does not re-provision.
    pub async fn provision(&self, tenant: &str, env: &str) -> Result<Environment, Error> {
        let public_key = generate_credential();
        let private_key = generate_credential();

        // Routing-system writes happen before any cluster object exists, so
        // a failure here leaves nothing to clean up.
        if self.settings.routing_kvm_enabled {
            self.edge.write_routing_key(tenant, env, &public_key).await?;
        }

        let hosts = if self.settings.sync_hosts_enabled {
            self.edge.resolve_hosts(tenant, env).await?
        } else {
            BTreeSet::new()
        };

        let ns_name = namespace_name(tenant, env);
        let namespace = self.namespace_object(tenant, env, &hosts);
        // A concurrent provision of the same environment loses the race here.
        let created = self
            .cluster
            .create_namespace(&namespace)
            .await
            .map_err(|err| {
                if is_kube_conflict(&err) {
                    Error::conflict(format!("environment {ns_name} already exists"))
                } else {
                    err.into()
                }
            })?;
        info!(namespace = %ns_name, "created namespace");

        let secret = secret_object(&public_key, &private_key);
        if let Err(cause) = self.cluster.create_secret(&ns_name, &secret).await {
            error!(namespace = %ns_name, error = %cause, "secret creation failed, rolling back namespace");
            return match self.cluster.delete_namespace(&ns_name).await {
                Ok(()) => Err(Error::RolledBack {
                    cause: cause.to_string(),
                }),
                Err(cleanup) => Err(Error::RollbackFailed {
                    cause: cause.to_string(),
                    cleanup: cleanup.to_string(),
                }),
            };
        }
        info!(namespace = %ns_name, secret = ROUTING_SECRET, "created routing secret");

        Ok(Environment {
            name: created.metadata.name.unwrap_or(ns_name),
            host_names: hosts.into_iter().collect(),
            public_secret: public_key,
            private_secret: private_key,
        })
    }

    /// Re-resolve the environment's hostnames and rewrite the namespace
    /// annotation. Single mutation, no rollback needed.
    pub async fn refresh_hosts(&self, tenant: &str, env: &str) -> Result<(), Error> {
        let ns_name = namespace_name(tenant, env);
        let mut namespace = self
            .cluster
            .get_namespace(&ns_name)
            .await
            .map_err(|err| self.map_namespace_err(err, &ns_name))?;

        let hosts = self.edge.resolve_hosts(tenant, env).await?;
        namespace
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_HOST_NAMES.into(), host_names_annotation(&hosts));

        self.cluster.replace_namespace(&ns_name, &namespace).await?;
        info!(namespace = %ns_name, hosts = hosts.len(), "refreshed environment hosts");
        Ok(())
    }

    /// Fetch the environment's namespace and secret.
    pub async fn get_environment(&self, tenant: &str, env: &str) -> Result<Environment, Error> {
        let ns_name = namespace_name(tenant, env);
        let namespace = self
            .cluster
            .get_namespace(&ns_name)
            .await
            .map_err(|err| self.map_namespace_err(err, &ns_name))?;
        let secret = self
            .cluster
            .get_secret(&ns_name, ROUTING_SECRET)
            .await
            .map_err(|err| {
                if is_kube_not_found(&err) {
                    Error::not_found(format!("secret {ROUTING_SECRET} in {ns_name}"))
                } else {
                    err.into()
                }
            })?;

        let host_names = namespace
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_HOST_NAMES))
            .map(|joined| {
                joined
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let data = secret.data.unwrap_or_default();
        let read_key = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default()
        };

        Ok(Environment {
            name: ns_name,
            host_names,
            public_secret: read_key(SECRET_KEY_PUBLIC),
            private_secret: read_key(SECRET_KEY_PRIVATE),
        })
    }

    /// Delete the environment's namespace; the orchestrator cascades to
    /// everything inside it.
    pub async fn delete_environment(&self, tenant: &str, env: &str) -> Result<(), Error> {
        let ns_name = namespace_name(tenant, env);
        self.cluster
            .delete_namespace(&ns_name)
            .await
            .map_err(|err| self.map_namespace_err(err, &ns_name))?;
        info!(namespace = %ns_name, "deleted environment");
        Ok(())
    }

    fn map_namespace_err(&self, err: kube::Error, ns_name: &str) -> Error {
        if is_kube_not_found(&err) {
            Error::not_found(format!("environment {ns_name}"))
        } else {
            err.into()
        }
    }

    fn namespace_object(&self, tenant: &str, env: &str, hosts: &BTreeSet<String>) -> Namespace {
        let ns_name = namespace_name(tenant, env);

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_RUNTIME.to_string(), RUNTIME_NAME.to_string());
        labels.insert("organization".to_string(), tenant.to_string());
        labels.insert("environment".to_string(), env.to_string());
        labels.insert("name".to_string(), ns_name.clone());

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_HOST_NAMES.into(), host_names_annotation(hosts));
        if self.settings.isolate_namespaces {
            annotations.insert(ANNOTATION_NETWORK_POLICY.into(), ISOLATION_POLICY.into());
        }

        Namespace {
            metadata: ObjectMeta {
                name: Some(ns_name),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        }
    }
}

fn secret_object(public_key: &str, private_key: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        SECRET_KEY_PUBLIC.to_string(),
        ByteString(public_key.as_bytes().to_vec()),
    );
    data.insert(
        SECRET_KEY_PRIVATE.to_string(),
        ByteString(private_key.as_bytes().to_vec()),
    );
    Secret {
        metadata: ObjectMeta {
            name: Some(ROUTING_SECRET.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}
