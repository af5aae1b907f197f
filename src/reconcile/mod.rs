//! Deployment lifecycle against the cluster orchestrator.
//!
//! Creation synthesizes a fresh pod template; updates are read-modify-write
//! on the stored object so fields absent from a patch are left untouched.
//! Deletion cascades over the replica sets and pods the orchestrator spawned
//! for the deployment, and stays retryable when a previous attempt removed
//! the deployment object but left children behind.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ContainerPort, EnvVar, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::Deserialize;

use crate::cluster::ClusterApi;
use crate::config::Settings;
use crate::edge::EdgeApi;
use crate::error::{is_kube_not_found, Error};
use crate::provision::namespace_name;
use crate::template::{
    distinct_ports, edge_paths_json, merge_env_vars, port_env_vars, resolve_env_vars,
    routing_policy, strip_port_vars, validate_edge_paths, DeploymentRequest, EdgePath,
    EnvironmentVariable, Synthesizer, ANNOTATION_EDGE_PATHS, ANNOTATION_PRIVATE_HOSTS,
    ANNOTATION_PUBLIC_HOSTS, ANNOTATION_ROUTING_POLICY, LABEL_COMPONENT, LABEL_REVISION,
    LABEL_ROUTABLE,
};

/// Old replica sets kept around for rollback.
const REVISION_HISTORY_LIMIT: i32 = 5;

/// Body of `PATCH .../deployments/{name}`. Every field is optional; omitted
/// fields leave the stored deployment untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPatch {
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

/// Label selector matching every object spawned for a deployment.
pub fn component_selector(name: &str) -> String {
    format!("{LABEL_COMPONENT}={name}")
}

pub struct Reconciler<'a> {
    cluster: &'a dyn ClusterApi,
    edge: &'a dyn EdgeApi,
    settings: &'a Settings,
}

impl<'a> Reconciler<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, edge: &'a dyn EdgeApi, settings: &'a Settings) -> Self {
        Reconciler {
            cluster,
            edge,
            settings,
        }
    }

    /// Create a deployment in the tenant's namespace.
    ///
    /// Anything in the namespace already carrying this component label
    /// conflicts, whatever its object name is.
    pub async fn create(
        &self,
        tenant: &str,
        env: &str,
        request: &DeploymentRequest,
    ) -> Result<Deployment, Error> {
        let namespace = namespace_name(tenant, env);
        let template = Synthesizer::new(self.settings, self.edge)
            .synthesize(request, tenant, env)
            .await?;

        let selector = component_selector(&request.deployment_name);
        let existing = self
            .cluster
            .list_deployments(&namespace, Some(&selector))
            .await?;
        if !existing.is_empty() {
            return Err(Error::conflict(format!(
                "a deployment matching {selector} already exists in {namespace}"
            )));
        }
        let deployment = deployment_object(
            &request.deployment_name,
            request.replicas.unwrap_or(1),
            template,
        );
        tracing::info!(%namespace, deployment = %request.deployment_name, "creating deployment");
        Ok(self.cluster.create_deployment(&namespace, &deployment).await?)
    }

    pub async fn get(&self, tenant: &str, env: &str, name: &str) -> Result<Deployment, Error> {
        let namespace = namespace_name(tenant, env);
        self.cluster
            .get_deployment(&namespace, name)
            .await
            .map_err(|err| {
                if is_kube_not_found(&err) {
                    Error::not_found(format!("deployment {name} in {namespace}"))
                } else {
                    err.into()
                }
            })
    }

    pub async fn list(&self, tenant: &str, env: &str) -> Result<Vec<Deployment>, Error> {
        let namespace = namespace_name(tenant, env);
        Ok(self.cluster.list_deployments(&namespace, None).await?)
    }

    /// Apply a partial update and replace the stored object.
    pub async fn update(
        &self,
        tenant: &str,
        env: &str,
        name: &str,
        patch: &DeploymentPatch,
    ) -> Result<Deployment, Error> {
        let namespace = namespace_name(tenant, env);
        let mut deployment = self.get(tenant, env, name).await?;

        let resolved = match &patch.env_vars {
            Some(vars) => Some(
                resolve_env_vars(
                    self.edge,
                    self.settings.routing_kvm_enabled,
                    vars,
                    tenant,
                    env,
                )
                .await?,
            ),
            None => None,
        };
        apply_patch(&mut deployment, patch, resolved, &self.settings.pod_cidr)?;

        tracing::info!(%namespace, deployment = %name, "updating deployment");
        Ok(self
            .cluster
            .replace_deployment(&namespace, name, &deployment)
            .await?)
    }

    /// Delete a deployment and everything it spawned.
    ///
    /// When the deployment object itself is already gone the children are
    /// still swept; only a namespace with neither the deployment nor any
    /// labelled leftovers reports not-found.
    pub async fn delete(&self, tenant: &str, env: &str, name: &str) -> Result<(), Error> {
        let namespace = namespace_name(tenant, env);
        let present = match self.cluster.get_deployment(&namespace, name).await {
            Ok(_) => true,
            Err(err) if is_kube_not_found(&err) => false,
            Err(err) => return Err(err.into()),
        };

        let selector = component_selector(name);
        let replica_sets = self.cluster.list_replica_sets(&namespace, &selector).await?;
        let pods = self.cluster.list_pods(&namespace, &selector).await?;
        if !present && replica_sets.is_empty() && pods.is_empty() {
            return Err(Error::not_found(format!(
                "deployment {name} in {namespace}"
            )));
        }

        tracing::info!(
            %namespace,
            deployment = %name,
            replica_sets = replica_sets.len(),
            pods = pods.len(),
            "deleting deployment"
        );

        if present {
            match self.cluster.delete_deployment(&namespace, name).await {
                Err(err) if !is_kube_not_found(&err) => return Err(err.into()),
                _ => {}
            }
        }
        for replica_set in &replica_sets {
            let Some(rs_name) = replica_set.metadata.name.as_deref() else {
                continue;
            };
            match self.cluster.delete_replica_set(&namespace, rs_name).await {
                Err(err) if !is_kube_not_found(&err) => return Err(err.into()),
                _ => {}
            }
        }
        for pod in &pods {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            match self.cluster.delete_pod(&namespace, pod_name).await {
                Err(err) if !is_kube_not_found(&err) => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Concatenated logs of every pod behind the deployment, each section
    /// prefixed with the pod name.
    pub async fn logs(
        &self,
        tenant: &str,
        env: &str,
        name: &str,
        tail_lines: Option<i64>,
        previous: bool,
    ) -> Result<String, Error> {
        let namespace = namespace_name(tenant, env);
        self.get(tenant, env, name).await?;

        let selector = component_selector(name);
        let pods = self.cluster.list_pods(&namespace, &selector).await?;
        let mut output = String::new();
        for pod in &pods {
            let Some(pod_name) = pod.metadata.name.as_deref() else {
                continue;
            };
            output.push_str(&format!("Logs for pod: {pod_name}\n"));
            output.push_str(
                &self
                    .cluster
                    .pod_logs(&namespace, pod_name, tail_lines, previous)
                    .await?,
            );
            if !output.ends_with('\n') {
                output.push('\n');
            }
        }
        Ok(output)
    }
}

fn deployment_object(name: &str, replicas: i32, template: PodTemplateSpec) -> Deployment {
    let mut match_labels = BTreeMap::new();
    match_labels.insert(LABEL_COMPONENT.to_string(), name.to_string());
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: template.metadata.as_ref().and_then(|m| m.labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            revision_history_limit: Some(REVISION_HISTORY_LIMIT),
            selector: LabelSelector {
                match_labels: Some(match_labels),
                ..LabelSelector::default()
            },
            template,
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Fold a patch into a fetched deployment in place.
///
/// `resolved_env` carries the already-resolved environment variables when the
/// patch declared any; resolution is the caller's job since it may reach the
/// edge API.
fn apply_patch(
    deployment: &mut Deployment,
    patch: &DeploymentPatch,
    resolved_env: Option<Vec<EnvVar>>,
    pod_cidr: &str,
) -> Result<(), Error> {
    if let Some(paths) = &patch.edge_paths {
        // An explicit empty list would leave the deployment with no ports
        // and no route; creation substitutes a default path instead, so an
        // update never accepts one.
        if paths.is_empty() {
            return Err(Error::validation("edgePaths must not be empty"));
        }
        validate_edge_paths(paths)?;
    }

    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| Error::validation("deployment has no spec"))?;
    if let Some(replicas) = patch.replicas {
        spec.replicas = Some(replicas);
    }

    let template = &mut spec.template;
    let mut new_ports = None;

    // Template metadata is rewritten only for the fields the patch names; a
    // replicas-only patch leaves it byte-identical.
    if patch.edge_paths.is_some()
        || patch.public_hosts.is_some()
        || patch.private_hosts.is_some()
        || patch.revision.is_some()
    {
        let metadata = template.metadata.get_or_insert_with(ObjectMeta::default);

        if patch.edge_paths.is_some()
            || patch.public_hosts.is_some()
            || patch.private_hosts.is_some()
        {
            let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
            if let Some(paths) = &patch.edge_paths {
                let ports = distinct_ports(paths);
                annotations.insert(ANNOTATION_EDGE_PATHS.into(), edge_paths_json(paths)?);
                annotations.insert(
                    ANNOTATION_ROUTING_POLICY.into(),
                    routing_policy(pod_cidr, &ports),
                );
                new_ports = Some(ports);
            }
            if let Some(hosts) = &patch.public_hosts {
                annotations.insert(ANNOTATION_PUBLIC_HOSTS.into(), hosts.clone());
            }
            if let Some(hosts) = &patch.private_hosts {
                annotations.insert(ANNOTATION_PRIVATE_HOSTS.into(), hosts.clone());
            }
        }

        if patch.edge_paths.is_some() || patch.revision.is_some() {
            let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
            if patch.edge_paths.is_some() {
                labels.insert(LABEL_ROUTABLE.into(), "true".into());
            }
            if let Some(revision) = &patch.revision {
                labels.insert(LABEL_REVISION.into(), revision.clone());
            }
        }
    }

    let pod_spec = template
        .spec
        .as_mut()
        .ok_or_else(|| Error::validation("deployment template has no pod spec"))?;
    let container = pod_spec
        .containers
        .first_mut()
        .ok_or_else(|| Error::validation("deployment template has no containers"))?;

    if let Some(revision) = &patch.revision {
        if let Some(image) = container.image.take() {
            let repository = match image.rsplit_once(':') {
                Some((repository, _)) => repository.to_string(),
                None => image,
            };
            container.image = Some(format!("{repository}:{revision}"));
        }
    }

    if let Some(vars) = resolved_env {
        container.env = Some(merge_env_vars(
            container.env.take().unwrap_or_default(),
            vars,
        ));
    }

    // Derived port variables are recomputed wholesale so a changed path set
    // never leaves stale ones behind.
    if let Some(ports) = new_ports {
        container.ports = Some(
            ports
                .iter()
                .map(|port| ContainerPort {
                    container_port: *port,
                    ..ContainerPort::default()
                })
                .collect(),
        );
        let kept = strip_port_vars(container.env.take().unwrap_or_default());
        container.env = Some(merge_env_vars(kept, port_env_vars(&ports)));
    }

    Ok(())
}
