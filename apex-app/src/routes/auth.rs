use crate::api_error::ApiError;
use crate::http_auth;
use crate::server::AppState;
use axum::body::Bytes;
use axum::routing::post;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/auth/echo-sign", post(echo_sign))
}

/// Signs the raw request body with the server key. Served only when `server.echo_sign_enabled`.
#[tracing::instrument(level = "info", skip_all, fields(body_len = body.len()))]
async fn echo_sign(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.echo_sign_enabled {
        return Err(ApiError::new("not_found", "echo-sign is disabled"));
    }
    let Some(key) = state.shared_key.as_deref() else {
        return Err(http_auth::AuthError::ServerMisconfigured("shared key not set").into());
    };
    let ts = chrono::Utc::now().timestamp().to_string();
    let sig = http_auth::sign(key, &ts, &body)?;
    Ok(Json(serde_json::json!({ "ts": ts, "sig": sig })))
}
