use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[derive(Debug, Clone, Serialize)]
pub struct DirCheck {
    pub status: &'static str,
    pub path: String,
    pub writable: bool,
}

/// Checks a directory by creating and removing a small file in it.
pub async fn check_dir(dir: &Path) -> DirCheck {
    let path = dir.display().to_string();
    if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
        return DirCheck {
            status: "missing",
            path,
            writable: false,
        };
    }
    let marker = dir.join(format!(
        ".health_check_{}_{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let writable = match tokio::fs::write(&marker, b"ok").await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(&marker).await {
                tracing::warn!(error = %e, marker = %marker.display(), "failed to remove health check file");
            }
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, dir = %path, "health check write failed");
            false
        }
    };
    DirCheck {
        status: if writable { "ok" } else { "not_writable" },
        path,
        writable,
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let work_dir = check_dir(state.executor.work_root()).await;
    let log_dir = check_dir(state.executor.log_dir()).await;
    let healthy = work_dir.writable && log_dir.writable;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "checked_at": Utc::now(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "checks": {
                "work_dir": work_dir,
                "log_dir": log_dir,
            }
        })),
    )
}
