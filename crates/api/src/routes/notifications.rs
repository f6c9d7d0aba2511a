//! Live notification subscription.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use herald_common::error::AppError;

use crate::origin::ensure_allowed_origin;
use crate::state::AppState;
use crate::ws::WsConnection;

pub fn router() -> Router<AppState> {
    Router::new().route("/notifications/subscribe", get(subscribe))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    #[serde(rename = "userEmail")]
    pub user_email: Option<String>,
}

/// GET /notifications/subscribe?userEmail= : upgrade to a live notification
/// session for the given user.
async fn subscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    let user_email = query
        .user_email
        .filter(|email| !email.is_empty())
        .ok_or_else(|| AppError::Validation("get param userEmail must be present".to_string()))?;

    ensure_allowed_origin(&headers, &state.config)?;

    let upgrade = upgrade.map_err(|rejection| {
        tracing::error!(
            user_email = %user_email,
            error = %rejection,
            "Can't prepare WS connection"
        );
        AppError::Validation(rejection.body_text())
    })?;

    Ok(upgrade.on_upgrade(move |socket| async move {
        let connection = Arc::new(WsConnection::new(socket));
        state
            .registry
            .handle_connection(&state.shutdown, &user_email, connection)
            .await;
    }))
}
