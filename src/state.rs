//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::auth::{AuthGate, AuthSetupError};
use crate::config::Config;
use crate::console::ConsoleBus;
use crate::execution::ExecutionSupervisor;
use crate::registry::RouteRegistry;

/// HTTP/1 client used to forward project traffic.
pub type ForwardClient = Client<HttpConnector, Body>;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub registry: RouteRegistry,
    pub console: ConsoleBus,
    pub supervisor: ExecutionSupervisor,
    pub auth: AuthGate,
    pub client: ForwardClient,
}

impl AppState {
    /// Wire up every component from `config`.
    pub fn new(config: Config) -> Result<Self, AuthSetupError> {
        let auth = AuthGate::new(
            &config.auth.backend_url,
            Duration::from_millis(config.auth.timeout_ms),
        )?;
        let registry = RouteRegistry::new();
        let console = ConsoleBus::new(config.console_capacity());
        let supervisor = ExecutionSupervisor::new(
            registry.clone(),
            console.clone(),
            config.execution.exit_policy,
        );
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            console,
            supervisor,
            auth,
            client,
        })
    }
}
