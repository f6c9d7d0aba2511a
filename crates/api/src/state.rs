//! Shared application state for the Axum API server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_live::registry::ConnectionRegistry;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub config: AppConfig,
    /// Process shutdown; live sessions are cancelled with it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config,
            shutdown,
        }
    }
}
