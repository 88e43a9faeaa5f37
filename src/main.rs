//! # devgate
//!
//! Dynamic reverse-proxy gateway for per-project development backends.
//!
//! devgate forwards `/project/{id}/...` traffic to whichever backend is
//! currently registered for that project, after the authorization backend has
//! approved the caller. It also launches project processes and streams their
//! output to WebSocket consoles.
//!
//! ## Listeners
//!
//! | Listener | Default          | Serves                                    |
//! |----------|------------------|-------------------------------------------|
//! | gateway  | `0.0.0.0:8080`   | `/health`, `/project/{id}/...`, `/admin`  |
//! | console  | `0.0.0.0:8081`   | `GET /console?projectId=<id>` (WebSocket) |
//!
//! ## API surface
//!
//! | Method | Path                  | Auth            | Description                 |
//! |--------|-----------------------|-----------------|-----------------------------|
//! | GET    | `/health`             | No              | Liveness probe              |
//! | ANY    | `/project/{id}/...`   | Backend         | Forward to project backend  |
//! | ANY    | `/admin/...`          | Internal token  | Executions, routes, consoles|
//! | GET    | `/console`            | Optional        | Live console WebSocket      |
//!
//! ## Architecture
//!
//! ```text
//! main.rs            entry point, clap subcommands, listeners, graceful shutdown
//! config.rs          TOML + env-var configuration
//! state.rs           AppState wiring
//! error.rs           GatewayError and its JSON rendering
//! path.rs            /project/{id} and ?projectId= parsing
//! registry.rs        RouteRegistry, RuleTable snapshots
//! console.rs         ConsoleBus (broadcast channel per project)
//! auth.rs            backend auth gate, admin token middleware
//! execution/
//!   process.rs       spawn with merged output, process-group signals
//!   handle.rs        ExecutionHandle, stdin writer, capture loop
//!   mod.rs           ExecutionSupervisor (start/stop/pause/resume)
//! routes/
//!   proxy.rs         dispatch fallback and forwarding
//!   health.rs        GET /health
//!   admin.rs         /admin API
//! ws/
//!   mod.rs           console WebSocket endpoint
//! ```

use std::future::IntoFuture;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devgate::config::Config;
use devgate::routes::{console_router, gateway_router};
use devgate::AppState;

/// Dynamic reverse-proxy gateway for per-project development backends.
#[derive(Parser)]
#[command(name = "devgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway and console listeners (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    if let Err(e) = run_server(config_path.as_deref()).await {
        eprintln!("devgate: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("devgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Authorization backend: {}", config.auth.backend_url);
    info!("Exit policy: {:?}", config.execution.exit_policy);

    if config.auth.internal_token == "change-me" {
        warn!("Using default internal token; set DEVGATE_INTERNAL_TOKEN or update config");
    }

    let state = AppState::new(config)?;

    let gateway_listener = TcpListener::bind(&state.config.server.listen).await?;
    let console_listener = TcpListener::bind(&state.config.console.listen).await?;
    info!("Gateway listening on {}", state.config.server.listen);
    info!("Console listening on {}", state.config.console.listen);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let gateway = axum::serve(gateway_listener, gateway_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let console = axum::serve(console_listener, console_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    info!("Server ready");
    let served = tokio::try_join!(gateway.into_future(), console.into_future());

    // Cleanup
    info!("Shutting down...");
    shutdown.cancel();
    state.supervisor.stop_all().await;
    served?;
    info!("Goodbye");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
    shutdown.cancel();
}
