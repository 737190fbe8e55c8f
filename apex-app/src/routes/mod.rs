pub mod agent;
pub mod auth;
pub mod health;
pub mod run;

use crate::api_error::ApiError;
use axum::Router;
use serde::de::DeserializeOwned;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(auth::router())
        .merge(run::router())
        .merge(agent::router())
}

/// Parses a JSON body. An empty body is rejected.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::validation("request body is empty"));
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("invalid request body: {e}")))
}

/// Parses a JSON body, treating an empty body as `T::default()`.
pub(crate) fn parse_json_or_default<T: DeserializeOwned + Default>(
    body: &[u8],
) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_json(body)
}
