//! Origin check for WebSocket upgrades.

use axum::http::HeaderMap;
use axum::http::header::ORIGIN;

use herald_common::config::AppConfig;
use herald_common::error::{AppError, AppResult};

/// Accept the request when origin checking is disabled or its `Origin`
/// header equals the configured allowed origin. A missing header counts as
/// an empty origin.
pub fn ensure_allowed_origin(headers: &HeaderMap, config: &AppConfig) -> AppResult<()> {
    if !config.ws_check_origin {
        return Ok(());
    }

    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let allowed = config.ws_allowed_origin.as_deref().unwrap_or_default();

    if origin == allowed {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("origin '{}' is not allowed", origin)))
    }
}
