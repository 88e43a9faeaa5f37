//! Dynamic project routes and the dispatch rule table derived from them.
//!
//! The registry is the single source of truth for which project is served by
//! which `host:port`. Every mutation rebuilds an immutable [`RuleTable`] under
//! the write lock and publishes it as a new `Arc`, so a request resolving
//! against [`RouteRegistry::rules`] sees either the whole table before an
//! update or the whole table after it.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::path::parse_project_path;

/// Path answered by the fixed health rule.
pub const HEALTH_PATH: &str = "/health";

/// Where one project's traffic is forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRoute {
    pub project_id: String,
    pub target_host: String,
    pub target_port: u16,
}

impl ProjectRoute {
    /// `http://host:port` with IPv6 literals bracketed.
    pub fn base_url(&self) -> String {
        if self.target_host.contains(':') && !self.target_host.starts_with('[') {
            format!("http://[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("http://{}:{}", self.target_host, self.target_port)
        }
    }
}

/// Outcome of matching a request against the rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The fixed health rule.
    Health,
    /// Forward to `target` (absolute URI, query preserved).
    Forward { project_id: String, target: String },
    NotFound,
}

/// Immutable snapshot of the dispatch rules.
#[derive(Debug, Default)]
pub struct RuleTable {
    /// project id -> base URL
    forwards: HashMap<String, String>,
    version: u64,
}

impl RuleTable {
    fn build(routes: &BTreeMap<String, ProjectRoute>, version: u64) -> Self {
        let forwards = routes
            .values()
            .map(|r| (r.project_id.clone(), r.base_url()))
            .collect();
        Self { forwards, version }
    }

    /// Match `path` (and its raw `query`) against the rules.
    ///
    /// `/project/{id}[/rest]` strips the two-segment prefix and forwards the
    /// remainder to the project's target.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Resolution {
        if path == HEALTH_PATH {
            return Resolution::Health;
        }
        let Some(project) = parse_project_path(path) else {
            return Resolution::NotFound;
        };
        let Some(base) = self.forwards.get(project.project_id) else {
            return Resolution::NotFound;
        };
        let mut target = format!("{base}{}", project.rest);
        if let Some(q) = query {
            target.push('?');
            target.push_str(q);
        }
        Resolution::Forward {
            project_id: project.project_id.to_string(),
            target,
        }
    }

    /// Number of forwarding rules (the health rule is not counted).
    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }

    /// Monotonic rebuild counter.
    pub fn version(&self) -> u64 {
        self.version
    }
}

struct RegistryState {
    routes: BTreeMap<String, ProjectRoute>,
    rules: Arc<RuleTable>,
}

/// Thread-safe registry of project routes.
#[derive(Clone)]
pub struct RouteRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryState {
                routes: BTreeMap::new(),
                rules: Arc::new(RuleTable::default()),
            })),
        }
    }

    /// Insert or replace the route for `project_id`.
    pub async fn add_route(&self, project_id: &str, host: &str, port: u16) -> ProjectRoute {
        let route = ProjectRoute {
            project_id: project_id.to_string(),
            target_host: host.to_string(),
            target_port: port,
        };
        let mut state = self.inner.write().await;
        let replaced = state.routes.insert(project_id.to_string(), route.clone());
        Self::rebuild(&mut state);
        drop(state);
        if let Some(old) = replaced {
            info!(
                "Route for {project_id} replaced: {} -> {}",
                old.base_url(),
                route.base_url()
            );
        } else {
            info!("Route for {project_id} added: {}", route.base_url());
        }
        route
    }

    /// Remove the route for `project_id`. Absent routes are a no-op that
    /// still refreshes the rule table. Returns whether a route was removed.
    pub async fn remove_route(&self, project_id: &str) -> bool {
        let mut state = self.inner.write().await;
        let removed = state.routes.remove(project_id).is_some();
        Self::rebuild(&mut state);
        drop(state);
        if removed {
            info!("Route for {project_id} removed");
        } else {
            debug!("No route for {project_id} to remove");
        }
        removed
    }

    /// Point-in-time copy of every route, ordered by project id.
    pub async fn list_routes(&self) -> Vec<ProjectRoute> {
        self.inner.read().await.routes.values().cloned().collect()
    }

    pub async fn get_route(&self, project_id: &str) -> Option<ProjectRoute> {
        self.inner.read().await.routes.get(project_id).cloned()
    }

    pub async fn has_route(&self, project_id: &str) -> bool {
        self.inner.read().await.routes.contains_key(project_id)
    }

    /// The current rule table. Callers keep resolving against the snapshot
    /// they hold even if the registry changes meanwhile.
    pub async fn rules(&self) -> Arc<RuleTable> {
        Arc::clone(&self.inner.read().await.rules)
    }

    fn rebuild(state: &mut RegistryState) {
        let version = state.rules.version + 1;
        state.rules = Arc::new(RuleTable::build(&state.routes, version));
    }
}
