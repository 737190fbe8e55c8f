use crate::api_error::ApiError;
use crate::routes::parse_json;
use crate::server::AppState;
use apex_tools::{Plan, ToolCall, new_run_id};
use axum::body::Bytes;
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/apex/run", post(run_op))
        .route("/apex/plan", post(run_plan))
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    op: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[tracing::instrument(level = "info", skip_all, fields(op, run_id))]
async fn run_op(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: RunRequest = parse_json(&body)?;
    tracing::Span::current().record("op", request.op.as_str());
    let step = ToolCall::from_op(&request.op, request.params)?;
    let run_id = new_run_id("op");
    tracing::Span::current().record("run_id", run_id.as_str());

    let result = match state.executor.run(&step, &run_id).await {
        Ok(result) => result,
        Err(e) => {
            state.record_refusal(&step, None, &run_id, e.kind(), &e.to_string());
            return Err(e.into());
        }
    };
    state.record_step(&step, None, &run_id, &result);
    tracing::info!(succeeded = result.succeeded(), "op executed");

    Ok(Json(json!({ "ok": true, "run_id": run_id, "result": result })))
}

#[tracing::instrument(level = "info", skip_all, fields(run_id, steps))]
async fn run_plan(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raw: serde_json::Value = parse_json(&body)?;
    let plan = Plan::from_json(raw)?;
    let run_id = new_run_id("plan");
    tracing::Span::current().record("run_id", run_id.as_str());
    tracing::Span::current().record("steps", plan.steps.len());

    let run = state.executor.run_plan(&plan, &run_id).await?;
    let intent = Some(plan.intent.as_str());
    for (step, result) in plan.steps.iter().zip(&run.results) {
        state.record_step(step, intent, &run_id, result);
    }
    if let Some(failure) = &run.aborted {
        if let Some(step) = plan.steps.get(failure.index) {
            state.record_refusal(step, intent, &run_id, &failure.kind, &failure.message);
        }
    }
    tracing::info!(
        executed = run.results.len(),
        aborted = run.aborted.is_some(),
        skipped = run.skipped,
        "plan finished"
    );

    let mut body = serde_json::to_value(&run)?;
    body["ok"] = json!(run.aborted.is_none());
    Ok(Json(body))
}
