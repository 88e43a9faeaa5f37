//! Gateway error taxonomy and its HTTP rendering.
//!
//! Every failure a client can observe maps to one [`GatewayError`] variant.
//! Responses carry a JSON body `{"error": <message>, "code": <CODE>}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// Project request without an `Authorization` header.
    AuthMissingCredential,
    /// The authorization backend answered with a non-success status.
    AuthDenied { project_id: String, status: u16 },
    /// The authorization backend could not be reached in time.
    AuthBackendUnavailable { project_id: String, reason: String },
    /// No rule matches the request path.
    RouteNotFound(String),
    /// The process could not be started.
    ProcessLaunchFailure { project_id: String, reason: String },
    /// Reading process output failed. Surfaced on the console only.
    ProcessStreamFailure { project_id: String, reason: String },
    AlreadyRunning(String),
    NotRunning(String),
    /// The execution exists but is in the wrong state for the operation.
    InvalidState { project_id: String, reason: String },
    InvalidRequest(String),
    UpstreamFailure(String),
    UpstreamTimeout,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthMissingCredential => StatusCode::UNAUTHORIZED,
            Self::AuthDenied { .. } => StatusCode::FORBIDDEN,
            Self::AuthBackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RouteNotFound(_) | Self::NotRunning(_) => StatusCode::NOT_FOUND,
            Self::ProcessLaunchFailure { .. } | Self::ProcessStreamFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::AlreadyRunning(_) | Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable machine-readable code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissingCredential => "AUTH_MISSING_CREDENTIAL",
            Self::AuthDenied { .. } => "AUTH_DENIED",
            Self::AuthBackendUnavailable { .. } => "AUTH_BACKEND_UNAVAILABLE",
            Self::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            Self::ProcessLaunchFailure { .. } => "PROCESS_LAUNCH_FAILURE",
            Self::ProcessStreamFailure { .. } => "PROCESS_STREAM_FAILURE",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthMissingCredential => write!(f, "Missing Authorization header"),
            Self::AuthDenied { project_id, status } => {
                write!(f, "Access to project {project_id} denied (backend status {status})")
            }
            Self::AuthBackendUnavailable { project_id, reason } => write!(
                f,
                "Authorization backend unavailable for project {project_id}: {reason}"
            ),
            Self::RouteNotFound(path) => write!(f, "No route for {path}"),
            Self::ProcessLaunchFailure { project_id, reason } => {
                write!(f, "Failed to launch project {project_id}: {reason}")
            }
            Self::ProcessStreamFailure { reason, .. } => write!(f, "Stream interrupted: {reason}"),
            Self::AlreadyRunning(id) => write!(f, "Project {id} is already running"),
            Self::NotRunning(id) => write!(f, "Project {id} is not running"),
            Self::InvalidState { project_id, reason } => write!(f, "Project {project_id} {reason}"),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::UpstreamFailure(msg) => write!(f, "Upstream request failed: {msg}"),
            Self::UpstreamTimeout => write!(f, "Upstream request timed out"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::AuthMissingCredential.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::AuthDenied {
                project_id: "p".into(),
                status: 404
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::AuthBackendUnavailable {
                project_id: "p".into(),
                reason: "refused".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::RouteNotFound("/x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::AlreadyRunning("p".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(GatewayError::UpstreamTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_stream_failure_message() {
        let err = GatewayError::ProcessStreamFailure {
            project_id: "p".into(),
            reason: "broken pipe".into(),
        };
        assert_eq!(err.to_string(), "Stream interrupted: broken pipe");
    }

    #[tokio::test]
    async fn test_json_body() {
        let response = GatewayError::RouteNotFound("/project/unknown/x".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], "ROUTE_NOT_FOUND");
        assert_eq!(value["error"], "No route for /project/unknown/x");
    }
}
