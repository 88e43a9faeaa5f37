//! HTTP routers.
//!
//! The gateway router serves the admin API and sends everything else to
//! [`proxy::dispatch`]. The auth gate wraps the whole router, so project
//! traffic is validated before any routing decision. The console router
//! serves the WebSocket endpoint on its own listener.

pub mod admin;
pub mod health;
pub mod proxy;

use axum::{middleware, routing::get, Extension, Router};
use tower_http::trace::TraceLayer;

use crate::auth::{self, InternalToken};
use crate::state::AppState;
use crate::ws;

/// Router for the gateway listener.
pub fn gateway_router(state: AppState) -> Router {
    let admin = admin::router()
        .layer(middleware::from_fn(auth::require_internal_token))
        .layer(Extension(InternalToken(
            state.config.auth.internal_token.clone(),
        )));

    Router::new()
        .nest("/admin", admin)
        .fallback(proxy::dispatch)
        .layer(middleware::from_fn_with_state(state.auth.clone(), auth::gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the console listener.
pub fn console_router(state: AppState) -> Router {
    Router::new()
        .route("/console", get(ws::console_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::Body,
        extract::Request,
        http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    };
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    /// Authorization backend approving `Bearer good`, counting calls.
    async fn spawn_backend(calls: Arc<AtomicUsize>) -> SocketAddr {
        serve(Router::new().route(
            "/configured-projects/{id}/validate",
            get(move |headers: HeaderMap| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                        Some("Bearer good") => StatusCode::OK,
                        _ => StatusCode::FORBIDDEN,
                    }
                }
            }),
        ))
        .await
    }

    /// Upstream echoing what it received.
    async fn spawn_upstream() -> SocketAddr {
        serve(Router::new().fallback(|request: Request| async move {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string)
            };
            axum::Json(json!({
                "method": request.method().as_str(),
                "uri": request.uri().to_string(),
                "prefix": header("x-forwarded-prefix"),
                "forwarded_host": header("x-forwarded-host"),
                "authorization": header("authorization"),
            }))
        }))
        .await
    }

    async fn gateway(calls: Arc<AtomicUsize>) -> (AppState, Router) {
        let backend = spawn_backend(calls).await;
        let mut config = Config::default();
        config.auth.backend_url = format!("http://{backend}");
        config.auth.internal_token = "internal".to_string();
        let state = AppState::new(config).unwrap();
        (state.clone(), gateway_router(state))
    }

    fn request(method: &str, uri: &str, auth: Option<&str>, body: Body) -> Request {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "gateway.local")
            .header("content-type", "application/json");
        if let Some(a) = auth {
            builder = builder.header(AUTHORIZATION, a);
        }
        builder.body(body).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_state, app) = gateway(Arc::clone(&calls)).await;

        let resp = app
            .oneshot(request("GET", "/health", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forward_to_registered_project() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, app) = gateway(Arc::clone(&calls)).await;
        let upstream = spawn_upstream().await;
        state
            .registry
            .add_route("proj1", &upstream.ip().to_string(), upstream.port())
            .await;

        let resp = app
            .oneshot(request(
                "POST",
                "/project/proj1/api/ping?x=1",
                Some("Bearer good"),
                Body::from("{}"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let echoed = json_body(resp).await;
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["uri"], "/api/ping?x=1");
        assert_eq!(echoed["prefix"], "/project/proj1");
        assert_eq!(echoed["forwarded_host"], "gateway.local");
        assert_eq!(echoed["authorization"], "Bearer good");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_project_is_404_after_auth() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_state, app) = gateway(Arc::clone(&calls)).await;

        let resp = app
            .oneshot(request("GET", "/project/unknown/x", Some("Bearer good"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["code"], "ROUTE_NOT_FOUND");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_is_never_forwarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, app) = gateway(Arc::clone(&calls)).await;
        state.registry.add_route("proj1", "127.0.0.1", 1).await;

        let resp = app
            .clone()
            .oneshot(request("GET", "/project/proj1/x", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(request("GET", "/project/proj1/x", Some("Bearer bad"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_502() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, app) = gateway(calls).await;
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);
        state.registry.add_route("proj1", "127.0.0.1", port).await;

        let resp = app
            .oneshot(request("GET", "/project/proj1/", Some("Bearer good"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_slow_upstream_is_504() {
        let backend = spawn_backend(Arc::new(AtomicUsize::new(0))).await;
        let upstream = serve(Router::new().fallback(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            "late"
        }))
        .await;
        let mut config = Config::default();
        config.auth.backend_url = format!("http://{backend}");
        config.server.request_timeout_ms = 200;
        let state = AppState::new(config).unwrap();
        state.registry.add_route("slow", "127.0.0.1", upstream.port()).await;

        let resp = gateway_router(state)
            .oneshot(request("GET", "/project/slow/", Some("Bearer good"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_admin_requires_internal_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_state, app) = gateway(calls).await;

        let resp = app
            .clone()
            .oneshot(request("GET", "/admin/routes", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(request("GET", "/admin/routes", Some("Bearer nope"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .oneshot(request("GET", "/admin/routes", Some("Bearer internal"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_route_management() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, app) = gateway(calls).await;
        let token = Some("Bearer internal");

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                "/admin/routes/proj1",
                token,
                Body::from(r#"{"host":"10.0.0.5","port":9000}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.registry.has_route("proj1").await);

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                "/admin/routes/proj2",
                token,
                Body::from(r#"{"host":"","port":9000}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(request("GET", "/admin/routes", token, Body::empty()))
            .await
            .unwrap();
        let routes = json_body(resp).await;
        assert_eq!(routes[0]["project_id"], "proj1");
        assert_eq!(routes[0]["target_port"], 9000);

        let resp = app
            .oneshot(request("DELETE", "/admin/routes/proj1", token, Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["removed"], true);
        assert!(!state.registry.has_route("proj1").await);
    }

    #[tokio::test]
    async fn test_admin_execution_lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (state, app) = gateway(calls).await;
        let token = Some("Bearer internal");
        let start_body = r#"{"working_directory":"/","command":["sleep","30"],"route":{"host":"127.0.0.1","port":3000}}"#;

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                "/admin/executions/p/start",
                token,
                Body::from(start_body),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(json_body(resp).await["state"], "running");
        assert!(state.registry.has_route("p").await);

        let resp = app
            .clone()
            .oneshot(request(
                "POST",
                "/admin/executions/p/start",
                token,
                Body::from(start_body),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app
            .clone()
            .oneshot(request("POST", "/admin/executions/p/pause", token, Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["state"], "paused");

        let resp = app
            .clone()
            .oneshot(request("POST", "/admin/executions/p/stop", token, Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["status"], "stopped");
        assert!(!state.registry.has_route("p").await);

        let resp = app
            .clone()
            .oneshot(request("POST", "/admin/executions/p/stop", token, Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(request(
                "POST",
                "/admin/executions/q/start",
                token,
                Body::from(r#"{"working_directory":"/","command":[]}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
