#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]

//! devgate library: the building blocks of the dynamic development gateway.
//!
//! - `registry`: project routes and the dispatch rule table
//! - `execution`: project process lifecycle and output capture
//! - `console`: per-project fan-out of output lines
//! - `auth`: backend-validated project auth and the admin token
//! - `routes`: gateway and console routers, forwarding, admin API
//! - `ws`: console WebSocket endpoint
//! - `config`: TOML + env configuration
//! - `path`: project path and query parsing

pub mod auth;
pub mod config;
pub mod console;
pub mod error;
pub mod execution;
pub mod path;
pub mod registry;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
