//! Admin API for executions, routes and console channels.
//!
//! Mounted under `/admin` behind [`crate::auth::require_internal_token`].
//!
//! | Method | Path                            | Description                      |
//! |--------|---------------------------------|----------------------------------|
//! | GET    | `/executions`                   | List executions                  |
//! | GET    | `/executions/{id}`              | Status of one execution          |
//! | POST   | `/executions/{id}/start`        | Launch, optionally add a route   |
//! | POST   | `/executions/{id}/stop`         | Stop, remove route, close console|
//! | POST   | `/executions/{id}/pause`        | SIGSTOP the process group        |
//! | POST   | `/executions/{id}/resume`       | SIGCONT the process group        |
//! | GET    | `/routes`                       | List routes                      |
//! | PUT    | `/routes/{id}`                  | Add or replace a route           |
//! | DELETE | `/routes/{id}`                  | Remove a route                   |
//! | DELETE | `/consoles/{id}`                | Close a console channel          |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::execution::handle::ExecutionStatus;
use crate::path::is_valid_project_id;
use crate::registry::ProjectRoute;
use crate::state::AppState;

/// Routes relative to the `/admin` mount point.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/start", post(start_execution))
        .route("/executions/{id}/stop", post(stop_execution))
        .route("/executions/{id}/pause", post(pause_execution))
        .route("/executions/{id}/resume", post(resume_execution))
        .route("/routes", get(list_routes))
        .route("/routes/{id}", put(put_route).delete(delete_route))
        .route("/consoles/{id}", delete(close_console))
}

/// Target of a project route.
#[derive(Debug, Deserialize)]
pub struct RouteTarget {
    pub host: String,
    pub port: u16,
}

impl RouteTarget {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("route host is empty".into()));
        }
        if self.port == 0 {
            return Err(GatewayError::InvalidRequest("route port must be non-zero".into()));
        }
        Ok(())
    }
}

/// Body of `POST /admin/executions/{id}/start`.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub working_directory: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Registered once the process has launched.
    pub route: Option<RouteTarget>,
}

fn check_id(id: &str) -> Result<(), GatewayError> {
    if is_valid_project_id(id) {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!("invalid project id {id:?}")))
    }
}

async fn list_executions(State(state): State<AppState>) -> Json<Vec<ExecutionStatus>> {
    Json(state.supervisor.list().await)
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionStatus>, GatewayError> {
    state
        .supervisor
        .status(&id)
        .await
        .map(Json)
        .ok_or(GatewayError::NotRunning(id))
}

async fn start_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<ExecutionStatus>), GatewayError> {
    check_id(&id)?;
    if let Some(route) = &req.route {
        route.validate()?;
    }
    let Some((program, args)) = req.command.split_first() else {
        return Err(GatewayError::InvalidRequest("command is empty".into()));
    };

    let status = state
        .supervisor
        .start(&id, &req.working_directory, program, args)
        .await?;
    if let Some(route) = &req.route {
        state.registry.add_route(&id, &route.host, route.port).await;
    }
    Ok((StatusCode::CREATED, Json(status)))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    if state.supervisor.stop(&id).await {
        Ok(Json(json!({"status": "stopped", "project_id": id})))
    } else {
        Err(GatewayError::NotRunning(id))
    }
}

async fn pause_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionStatus>, GatewayError> {
    state.supervisor.pause(&id).await.map(Json)
}

async fn resume_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionStatus>, GatewayError> {
    state.supervisor.resume(&id).await.map(Json)
}

async fn list_routes(State(state): State<AppState>) -> Json<Vec<ProjectRoute>> {
    Json(state.registry.list_routes().await)
}

async fn put_route(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(target): Json<RouteTarget>,
) -> Result<Json<ProjectRoute>, GatewayError> {
    check_id(&id)?;
    target.validate()?;
    Ok(Json(
        state.registry.add_route(&id, &target.host, target.port).await,
    ))
}

async fn delete_route(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let removed = state.registry.remove_route(&id).await;
    Json(json!({"project_id": id, "removed": removed}))
}

async fn close_console(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let closed = state.console.close(&id).await;
    Json(json!({"project_id": id, "closed": closed}))
}
