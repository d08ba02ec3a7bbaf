//! # Relay server
//!
//! HTTP surface, configuration and metrics for the Relay broker. The
//! `relay` binary is a thin wrapper around [`handlers::run_server`].

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod rest_auth;

pub use config::Config;
pub use handlers::{router, run_server, AppState};
