use crate::http_auth::AuthError;
use apex_agent::AgentError;
use apex_tools::ToolError;
use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error body `{ok: false, error, kind}` with the status derived from `kind`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "policy_violation" | "permission_denied" => StatusCode::FORBIDDEN,
        "validation_error" => StatusCode::UNPROCESSABLE_ENTITY,
        "request_timeout" => StatusCode::REQUEST_TIMEOUT,
        "conflict" => StatusCode::CONFLICT,
        "precondition_failed" => StatusCode::PRECONDITION_FAILED,
        "not_found" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: status_for_kind(kind),
            kind,
            message: message.into(),
        }
    }

    pub fn with_status(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(json!({ "ok": false, "error": self.message, "kind": self.kind })),
        )
            .into_response()
    }
}

impl From<ToolError> for ApiError {
    fn from(e: ToolError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::validation(e.body_text())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::new("internal", format!("json: {e}"))
    }
}
