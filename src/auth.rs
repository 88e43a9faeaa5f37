//! Request authorization.
//!
//! Two independent checks live here:
//!
//! - [`gate`] guards project traffic. Any request under `/project/{id}` must
//!   carry an `Authorization` header, which is forwarded unchanged to
//!   `GET {backend_url}/configured-projects/{id}/validate`. A 2xx answer lets
//!   the request through; every other outcome rejects it. Nothing is cached
//!   and nothing is retried.
//! - [`require_internal_token`] guards the admin API with a pre-shared bearer
//!   token compared in constant time.

use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::error::GatewayError;
use crate::path::parse_project_path;

/// Client for the authorization backend.
#[derive(Clone)]
pub struct AuthGate {
    http: reqwest::Client,
    backend_url: Url,
}

/// Errors building an [`AuthGate`].
#[derive(Debug)]
pub enum AuthSetupError {
    InvalidUrl(String),
    Client(reqwest::Error),
}

impl std::fmt::Display for AuthSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(msg) => write!(f, "invalid auth backend URL: {msg}"),
            Self::Client(e) => write!(f, "failed to build auth client: {e}"),
        }
    }
}

impl std::error::Error for AuthSetupError {}

impl AuthGate {
    /// `backend_url` must be an absolute `http` or `https` URL. Each
    /// validation call is bounded by `timeout`.
    pub fn new(backend_url: &str, timeout: Duration) -> Result<Self, AuthSetupError> {
        let backend_url =
            Url::parse(backend_url).map_err(|e| AuthSetupError::InvalidUrl(e.to_string()))?;
        if backend_url.cannot_be_a_base() || !matches!(backend_url.scheme(), "http" | "https") {
            return Err(AuthSetupError::InvalidUrl(format!(
                "{backend_url} is not an http(s) base URL"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            // A redirect is not an approval.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(AuthSetupError::Client)?;
        Ok(Self { http, backend_url })
    }

    /// `{backend_url}/configured-projects/{project_id}/validate`, with the id
    /// encoded as a single path segment.
    pub fn validate_url(&self, project_id: &str) -> Url {
        let mut url = self.backend_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["configured-projects", project_id, "validate"]);
        }
        url
    }

    /// Ask the backend whether `credential` may access `project_id`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::AuthDenied`]: the backend answered with a non-2xx status
    /// - [`GatewayError::AuthBackendUnavailable`]: connection failure or timeout
    pub async fn authorize(
        &self,
        project_id: &str,
        credential: &HeaderValue,
    ) -> Result<(), GatewayError> {
        let url = self.validate_url(project_id);
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, credential.clone())
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                debug!("Access to {project_id} allowed");
                Ok(())
            }
            Ok(resp) => {
                debug!("Access to {project_id} denied: backend answered {}", resp.status());
                Err(GatewayError::AuthDenied {
                    project_id: project_id.to_string(),
                    status: resp.status().as_u16(),
                })
            }
            Err(e) => {
                warn!("Authorization backend unreachable for {project_id}: {e}");
                Err(GatewayError::AuthBackendUnavailable {
                    project_id: project_id.to_string(),
                    reason: if e.is_timeout() {
                        "timed out".to_string()
                    } else {
                        e.to_string()
                    },
                })
            }
        }
    }
}

/// Non-empty `Authorization` header, if present.
pub fn credential(request: &Request) -> Option<HeaderValue> {
    request
        .headers()
        .get(AUTHORIZATION)
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Axum middleware validating project requests against the backend.
/// Requests outside `/project/{id}` pass through untouched.
///
/// # Error responses
///
/// - `401 Unauthorized`: no credential, backend not contacted
/// - `403 Forbidden`: backend rejected the credential
/// - `503 Service Unavailable`: backend unreachable or too slow
pub async fn gate(State(auth): State<AuthGate>, request: Request, next: Next) -> Response {
    let Some(path) = parse_project_path(request.uri().path()) else {
        return next.run(request).await;
    };
    let project_id = path.project_id.to_string();
    let Some(credential) = credential(&request) else {
        return GatewayError::AuthMissingCredential.into_response();
    };
    match auth.authorize(&project_id, &credential).await {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected token is injected via the [`InternalToken`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: token present but invalid
/// - `500 Internal Server Error`: [`InternalToken`] extension not found
pub async fn require_internal_token(request: Request, next: Next) -> Response {
    let Some(expected) = request
        .extensions()
        .get::<InternalToken>()
        .map(|t| t.0.clone())
    else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return GatewayError::AuthMissingCredential.into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid internal token", "code": "AUTH_DENIED"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response times do not reveal the token length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Expected admin token, injected as a router extension.
#[derive(Clone)]
pub struct InternalToken(pub String);
