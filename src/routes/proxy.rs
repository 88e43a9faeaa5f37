//! Gateway dispatch: health, project forwarding, or 404.
//!
//! Every request that passed the auth gate and matched no explicit route ends
//! up in [`dispatch`], which resolves it against the registry's current rule
//! table.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Uri, Version},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::health;
use crate::error::GatewayError;
use crate::path::PROJECT_PREFIX;
use crate::registry::Resolution;
use crate::state::AppState;

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Headers that describe one connection and must not be relayed.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Fallback handler for the gateway router.
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let rules = state.registry.rules().await;
    let resolution = rules.resolve(request.uri().path(), request.uri().query());
    match resolution {
        Resolution::Health => health::health(State(state)).await.into_response(),
        Resolution::Forward { project_id, target } => {
            match forward(&state, &project_id, &target, request).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            }
        }
        Resolution::NotFound => {
            debug!("No rule for {}", request.uri().path());
            GatewayError::RouteNotFound(request.uri().path().to_string()).into_response()
        }
    }
}

/// Proxy `request` to `target`, streaming both bodies.
async fn forward(
    state: &AppState,
    project_id: &str,
    target: &str,
    request: Request,
) -> Result<Response, GatewayError> {
    let uri: Uri = target
        .parse()
        .map_err(|e| GatewayError::UpstreamFailure(format!("invalid target {target}: {e}")))?;

    let (mut parts, body) = request.into_parts();
    let method = parts.method.clone();
    let original_host = parts.headers.remove(header::HOST);
    strip_hop_by_hop(&mut parts.headers);
    if let Some(host) = original_host {
        parts.headers.insert(X_FORWARDED_HOST, host);
    }
    let prefix = format!("{PROJECT_PREFIX}{project_id}");
    if let Ok(value) = HeaderValue::from_str(&prefix) {
        parts.headers.insert(X_FORWARDED_PREFIX, value);
    }
    parts.uri = uri;
    parts.version = Version::HTTP_11;

    debug!(project_id, method = %method, upstream = target, "Forwarding request");

    let timeout = Duration::from_millis(state.config.server.request_timeout_ms);
    let upstream = Request::from_parts(parts, body);
    match tokio::time::timeout(timeout, state.client.request(upstream)).await {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Ok(Response::from_parts(parts, Body::new(body)))
        }
        Ok(Err(e)) => {
            warn!(project_id, upstream = target, error = %e, "Upstream error");
            Err(GatewayError::UpstreamFailure(e.to_string()))
        }
        Err(_) => {
            warn!(project_id, upstream = target, "Upstream timed out");
            Err(GatewayError::UpstreamTimeout)
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-secret"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-secret").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer t");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }
}
