//! Metric Event Ingestion Service Library
//!
//! HTTP front end for the event batcher: configuration loading, logging,
//! Postgres wiring, request routing and graceful shutdown handling.

use anyhow::{Context, Result};
use std::path::Path;

pub mod config;
pub mod http;
pub mod logging;
pub mod service;
pub mod signals;

pub use config::ServiceConfig;
pub use http::routes;
pub use logging::initialize_logging;
pub use service::ServiceState;
pub use signals::{graceful_shutdown, setup_signal_handlers};

/// Load configuration from an optional file and environment variables
pub fn load_configuration(path: Option<&Path>) -> Result<ServiceConfig> {
    config::load_config(path).context("Failed to load service configuration")
}
