//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DEVGATE_BACKEND_URL`, `DEVGATE_LISTEN`,
//!    `DEVGATE_CONSOLE_PORT`, `DEVGATE_INTERNAL_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `devgate.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! request_timeout_ms = 30000     # upstream forward timeout
//!
//! [console]
//! listen = "0.0.0.0:8081"
//! buffer_capacity = 1024         # lines per subscriber, rounded up to a power of two
//! require_auth = false           # validate console upgrades against the backend
//!
//! [auth]
//! backend_url = "http://localhost:8000"
//! timeout_ms = 5000
//! internal_token = "change-me"   # bearer token for /admin
//!
//! [execution]
//! exit_policy = "retain"         # or "release"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::fmt;
use std::path::Path;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "devgate.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP gateway (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on a forwarded request, in milliseconds (default 30 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Console WebSocket listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    /// Socket address for the console endpoint (default `0.0.0.0:8081`).
    #[serde(default = "default_console_listen")]
    pub listen: String,
    /// Lines buffered per subscriber before the oldest are dropped (default
    /// 1024). Rounded up to a power of two, at most 2^20.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Run backend validation on console upgrades (default false).
    #[serde(default)]
    pub require_auth: bool,
}

/// Authorization backend and admin token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the authorization backend. Override with `DEVGATE_BACKEND_URL`.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// Timeout for one validation call, in milliseconds (default 5000).
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,
    /// Bearer token for the admin API. Override with `DEVGATE_INTERNAL_TOKEN`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_internal_token")]
    pub internal_token: String,
}

/// What happens to a project's route and console when its process exits on
/// its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Keep the route and console channel; only the handle is dropped.
    #[default]
    Retain,
    /// Remove the route and close the console channel, as an explicit stop does.
    Release,
}

/// Execution supervisor settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30000
}
fn default_console_listen() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_buffer_capacity() -> usize {
    1024
}
fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_auth_timeout_ms() -> u64 {
    5000
}
fn default_internal_token() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            listen: default_console_listen(),
            buffer_capacity: default_buffer_capacity(),
            require_auth: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            timeout_ms: default_auth_timeout_ms(),
            internal_token: default_internal_token(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Errors from [`Config::load`].
#[derive(Debug)]
pub enum ConfigError {
    Read { path: String, source: std::io::Error },
    Parse { path: String, source: toml::de::Error },
    InvalidEnv { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "failed to read config file {path}: {source}"),
            Self::Parse { path, source } => {
                write!(f, "failed to parse config file {path}: {source}")
            }
            Self::InvalidEnv { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::InvalidEnv { .. } => None,
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `devgate.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply `DEVGATE_*` overrides from `lookup`.
    fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DEVGATE_BACKEND_URL") {
            self.auth.backend_url = url;
        }
        if let Some(listen) = lookup("DEVGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(token) = lookup("DEVGATE_INTERNAL_TOKEN") {
            self.auth.internal_token = token;
        }
        if let Some(port) = lookup("DEVGATE_CONSOLE_PORT") {
            let port: u16 = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "DEVGATE_CONSOLE_PORT",
                value: port.clone(),
            })?;
            let host = self
                .console
                .listen
                .rsplit_once(':')
                .map_or("0.0.0.0", |(host, _)| host);
            self.console.listen = format!("{host}:{port}");
        }
        Ok(())
    }

    /// Per-subscriber console buffer as the console bus will size it.
    pub fn console_capacity(&self) -> usize {
        crate::console::effective_capacity(self.console.buffer_capacity)
    }
}
