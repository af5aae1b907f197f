//! Error types shared across the control plane.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::edge::EdgeError;

/// Main error type for control-plane operations.
///
/// Each variant corresponds to a distinct failure class with its own HTTP
/// status. Multi-step failures that leave visible side effects
/// ([`Error::RolledBack`], [`Error::RollbackFailed`]) carry how far the
/// operation progressed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input: environment name, edge path, missing required field.
    #[error("validation error: {0}")]
    Validation(String),

    /// The named resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The named resource already exists or collides with an existing one.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request needs a feature that is administratively disabled.
    #[error("{0} requires the routing KVM integration, which is disabled")]
    FeatureDisabled(String),

    /// Edge-routing API failure, upstream status embedded.
    #[error("edge API error: {0}")]
    Edge(#[from] EdgeError),

    /// Cluster orchestrator API failure.
    #[error("orchestrator error: {0}")]
    Kube(#[from] kube::Error),

    /// Provisioning failed partway but the namespace was cleaned up.
    #[error("environment provisioning failed, namespace rolled back: {cause}")]
    RolledBack { cause: String },

    /// Provisioning failed partway and the rollback also failed. External
    /// state is inconsistent and needs operator cleanup.
    #[error(
        "environment provisioning failed and namespace cleanup also failed, \
         manual cleanup required: {cause}; cleanup error: {cleanup}"
    )]
    RollbackFailed { cause: String, cleanup: String },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error naming the missing resource
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a conflict error naming the colliding resource
    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    /// Short machine-readable tag used in the error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::FeatureDisabled(_) => "feature_disabled",
            Error::Edge(_) => "edge_api",
            Error::Kube(_) => "orchestrator",
            Error::RolledBack { .. } => "rolled_back",
            Error::RollbackFailed { .. } => "rollback_failed",
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::FeatureDisabled(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Edge(_) | Error::RolledBack { .. } => StatusCode::BAD_GATEWAY,
            // Orchestrator not-found/conflict pass through, anything else is
            // an upstream dependency failure.
            Error::Kube(kube::Error::Api(resp)) => match resp.code {
                404 => StatusCode::NOT_FOUND,
                409 => StatusCode::CONFLICT,
                _ => StatusCode::BAD_GATEWAY,
            },
            Error::Kube(_) => StatusCode::BAD_GATEWAY,
            Error::RollbackFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if matches!(self, Error::RollbackFailed { .. }) {
            tracing::error!(error = %self, "external state left inconsistent");
        } else {
            tracing::warn!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}

/// Is this kube error a 404 from the API server?
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Is this kube error a 409 from the API server?
pub fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = Error::validation("not a valid environment name: foo");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn not_found_and_conflict_are_distinct() {
        assert_eq!(
            Error::not_found("deployment web").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::conflict("deployment web").status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn rollback_failure_is_more_severe_than_rollback_success() {
        let rolled_back = Error::RolledBack {
            cause: "secret creation refused".into(),
        };
        let rollback_failed = Error::RollbackFailed {
            cause: "secret creation refused".into(),
            cleanup: "namespace delete timed out".into(),
        };
        assert_eq!(rolled_back.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            rollback_failed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(rollback_failed.to_string().contains("manual cleanup"));
    }

    #[test]
    fn feature_disabled_is_a_client_error() {
        let err = Error::FeatureDisabled("environment variable resolution".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
