use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, header::LOCATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::provision::{parse_environment_name, Environment, Provisioner};
use crate::reconcile::{DeploymentPatch, Reconciler};
use crate::server::state::AppState;
use crate::template::{
    DeploymentRequest, EdgePath, ANNOTATION_EDGE_PATHS, ANNOTATION_PRIVATE_HOSTS,
    ANNOTATION_PUBLIC_HOSTS, LABEL_REVISION,
};

/// Body of `GET /environments/{env}` and `POST /environments/{env}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentResponse {
    pub name: String,
    pub host_names: Vec<String>,
    pub public_secret: String,
    pub private_secret: String,
}

impl From<Environment> for EnvironmentResponse {
    fn from(environment: Environment) -> Self {
        EnvironmentResponse {
            name: environment.name,
            host_names: environment.host_names,
            public_secret: environment.public_secret,
            private_secret: environment.private_secret,
        }
    }
}

/// Summary of a stored deployment, read back out of its labels and
/// annotations.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub deployment_name: String,
    pub replicas: i32,
    pub revision: String,
    pub edge_paths: Vec<EdgePath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_hosts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_hosts: Option<String>,
}

fn summarize(deployment: &Deployment) -> DeploymentSummary {
    let spec = deployment.spec.as_ref();
    let template_meta = spec.and_then(|s| s.template.metadata.as_ref());
    let labels = template_meta.and_then(|m| m.labels.as_ref());
    let annotations = template_meta.and_then(|m| m.annotations.as_ref());

    DeploymentSummary {
        deployment_name: deployment.metadata.name.clone().unwrap_or_default(),
        replicas: spec.and_then(|s| s.replicas).unwrap_or(0),
        revision: labels
            .and_then(|l| l.get(LABEL_REVISION))
            .cloned()
            .unwrap_or_else(|| "1".to_string()),
        edge_paths: annotations
            .and_then(|a| a.get(ANNOTATION_EDGE_PATHS))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        public_hosts: annotations.and_then(|a| a.get(ANNOTATION_PUBLIC_HOSTS)).cloned(),
        private_hosts: annotations
            .and_then(|a| a.get(ANNOTATION_PRIVATE_HOSTS))
            .cloned(),
    }
}

/// Raw Authorization header value, forwarded verbatim to the edge API.
fn authorization(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<i64>,
    #[serde(default)]
    pub previous: bool,
}

/// Liveness probe
pub async fn status() -> impl IntoResponse {
    "OK"
}

pub async fn create_environment(
    State(state): State<AppState>,
    Path(environment): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let provisioner = Provisioner::new(&state.cluster, &edge, &state.settings);

    if provisioner.environment_exists(&tenant, &env).await? {
        return Err(Error::conflict(format!(
            "environment {environment} already exists"
        )));
    }
    let created = provisioner.provision(&tenant, &env).await?;
    Ok((StatusCode::CREATED, Json(EnvironmentResponse::from(created))))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(environment): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EnvironmentResponse>, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let provisioner = Provisioner::new(&state.cluster, &edge, &state.settings);
    let found = provisioner.get_environment(&tenant, &env).await?;
    Ok(Json(EnvironmentResponse::from(found)))
}

/// PATCH re-resolves the environment's hostnames against the edge API.
pub async fn refresh_environment(
    State(state): State<AppState>,
    Path(environment): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let provisioner = Provisioner::new(&state.cluster, &edge, &state.settings);
    provisioner.refresh_hosts(&tenant, &env).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_environment(
    State(state): State<AppState>,
    Path(environment): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let provisioner = Provisioner::new(&state.cluster, &edge, &state.settings);
    provisioner.delete_environment(&tenant, &env).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Path(environment): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeploymentSummary>>, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let reconciler = Reconciler::new(&state.cluster, &edge, &state.settings);
    let deployments = reconciler.list(&tenant, &env).await?;
    Ok(Json(deployments.iter().map(summarize).collect()))
}

/// POST provisions the environment on the fly when its namespace does not
/// exist yet, then creates the deployment.
pub async fn create_deployment(
    State(state): State<AppState>,
    Path(environment): Path<String>,
    headers: HeaderMap,
    Json(request): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));

    let provisioner = Provisioner::new(&state.cluster, &edge, &state.settings);
    if !provisioner.environment_exists(&tenant, &env).await? {
        provisioner.provision(&tenant, &env).await?;
    }

    let reconciler = Reconciler::new(&state.cluster, &edge, &state.settings);
    let created = reconciler.create(&tenant, &env, &request).await?;

    let location = format!(
        "/environments/{environment}/deployments/{}",
        request.deployment_name
    );
    Ok((
        StatusCode::CREATED,
        [(LOCATION, location)],
        Json(summarize(&created)),
    ))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path((environment, deployment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DeploymentSummary>, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let reconciler = Reconciler::new(&state.cluster, &edge, &state.settings);
    let found = reconciler.get(&tenant, &env, &deployment).await?;
    Ok(Json(summarize(&found)))
}

pub async fn update_deployment(
    State(state): State<AppState>,
    Path((environment, deployment)): Path<(String, String)>,
    headers: HeaderMap,
    Json(patch): Json<DeploymentPatch>,
) -> Result<Json<DeploymentSummary>, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let reconciler = Reconciler::new(&state.cluster, &edge, &state.settings);
    let updated = reconciler.update(&tenant, &env, &deployment, &patch).await?;
    Ok(Json(summarize(&updated)))
}

pub async fn delete_deployment(
    State(state): State<AppState>,
    Path((environment, deployment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let reconciler = Reconciler::new(&state.cluster, &edge, &state.settings);
    reconciler.delete(&tenant, &env, &deployment).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deployment_logs(
    State(state): State<AppState>,
    Path((environment, deployment)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<String, Error> {
    let (tenant, env) = parse_environment_name(&environment)?;
    let edge = state.edge_client(&authorization(&headers));
    let reconciler = Reconciler::new(&state.cluster, &edge, &state.settings);
    reconciler
        .logs(&tenant, &env, &deployment, query.tail, query.previous)
        .await
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route(
            "/environments/{environment}",
            post(create_environment)
                .get(get_environment)
                .patch(refresh_environment)
                .delete(delete_environment),
        )
        .route(
            "/environments/{environment}/deployments",
            post(create_deployment).get(list_deployments),
        )
        .route(
            "/environments/{environment}/deployments/{deployment}",
            get(get_deployment)
                .patch(update_deployment)
                .delete(delete_deployment),
        )
        .route(
            "/environments/{environment}/deployments/{deployment}/logs",
            get(deployment_logs),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn stored_deployment() -> Deployment {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_REVISION.to_string(), "4".to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_EDGE_PATHS.to_string(),
            r#"[{"basePath": "/web", "containerPort": 8080, "targetPath": "/"}]"#.to_string(),
        );
        annotations.insert(
            ANNOTATION_PUBLIC_HOSTS.to_string(),
            "acme.example.com".to_string(),
        );

        Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..ObjectMeta::default()
                    }),
                    spec: None,
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn summary_is_read_back_from_labels_and_annotations() {
        let summary = summarize(&stored_deployment());
        assert_eq!(summary.deployment_name, "web");
        assert_eq!(summary.replicas, 2);
        assert_eq!(summary.revision, "4");
        assert_eq!(summary.edge_paths.len(), 1);
        assert_eq!(summary.edge_paths[0].container_port, 8080);
        assert_eq!(summary.public_hosts.as_deref(), Some("acme.example.com"));
        assert_eq!(summary.private_hosts, None);
    }

    #[test]
    fn summary_omits_absent_host_annotations() {
        let summary = summarize(&stored_deployment());
        let body = serde_json::to_value(&summary).unwrap();
        assert!(body.get("privateHosts").is_none());
        assert_eq!(body["publicHosts"], "acme.example.com");
    }

    #[test]
    fn authorization_header_is_forwarded_verbatim() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(authorization(&headers), "Bearer abc123");
        assert_eq!(authorization(&HeaderMap::new()), "");
    }

    #[test]
    fn logs_query_defaults() {
        let query: LogsQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.tail, None);
        assert!(!query.previous);

        let query: LogsQuery = serde_json::from_str(r#"{"tail": 50, "previous": true}"#).unwrap();
        assert_eq!(query.tail, Some(50));
        assert!(query.previous);
    }
}
