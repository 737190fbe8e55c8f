use crate::api_error::ApiError;
use crate::routes::{parse_json, parse_json_or_default};
use crate::server::AppState;
use apex_agent::{ApplyOutcome, ProposeRequest};
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_EXECUTIONS_LIMIT: usize = 20;
const MAX_EXECUTIONS_LIMIT: usize = 500;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/agent/status", get(get_status))
        .route("/agent/safety/status", get(get_safety_status))
        .route("/agent/learning-report", get(get_learning_report))
        .route("/agent/opportunities", get(get_opportunities))
        .route("/agent/suggestions", get(get_suggestions))
        .route("/agent/memory/stats", get(get_memory_stats))
        .route("/agent/memory/executions", get(get_executions))
        .route("/agent/enable", post(enable_agent))
        .route("/agent/disable", post(disable_agent))
        .route("/agent/start-loop", post(start_loop))
        .route("/agent/stop-loop", post(stop_loop))
        .route("/agent/run-cycle", post(run_cycle))
        .route("/agent/kill-switch/activate", post(activate_kill_switch))
        .route("/agent/kill-switch/deactivate", post(deactivate_kill_switch))
        .route("/agent/emergency-shutdown", post(emergency_shutdown))
        .route("/agent/modifications/stats", get(get_modification_stats))
        .route("/agent/modifications/enable", post(enable_modifications))
        .route("/agent/modifications/disable", post(disable_modifications))
        .route("/agent/modifications/max-per-day", post(set_max_per_day))
        .route("/agent/modifications/propose", post(propose))
        .route("/agent/modifications/apply", post(apply))
        .route("/agent/modifications/rollback", post(rollback))
        .route("/agent/modifications/proposals/{id}", get(get_proposal))
}

#[derive(Debug, Default, Deserialize)]
struct PasswordRequest {
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReasonRequest {
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct StartLoopRequest {
    #[serde(default)]
    interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MaxPerDayRequest {
    max: i64,
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    proposal_id: String,
    #[serde(default = "default_auto_test")]
    auto_test: bool,
}

fn default_auto_test() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    proposal_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionsQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    operation_type: Option<String>,
}

fn ok<T: Serialize>(value: T) -> Result<Json<Value>, ApiError> {
    let mut body = serde_json::to_value(value)?;
    if let Some(map) = body.as_object_mut() {
        map.insert("ok".to_string(), json!(true));
        return Ok(Json(body));
    }
    Ok(Json(json!({ "ok": true, "data": body })))
}

fn reason_of(request: ReasonRequest) -> Result<String, ApiError> {
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::validation("reason must not be empty"));
    }
    Ok(reason.to_string())
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    ok(state.agent.status().await?)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_safety_status(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    ok(state.safety().status())
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_learning_report(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    ok(state.agent.learning_report()?)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_opportunities(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let opportunities = state.agent.learner().identify_optimization_opportunities()?;
    Ok(Json(json!({ "ok": true, "count": opportunities.len(), "opportunities": opportunities })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_suggestions(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let suggestions = state.agent.learner().suggest_improvements()?;
    Ok(Json(json!({ "ok": true, "count": suggestions.len(), "suggestions": suggestions })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_memory_stats(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    ok(state.memory.get_statistics()?)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_executions(
    Extension(state): Extension<Arc<AppState>>,
    query: Result<Query<ExecutionsQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_EXECUTIONS_LIMIT);
    if !(1..=MAX_EXECUTIONS_LIMIT).contains(&limit) {
        return Err(ApiError::validation(format!(
            "limit must be between 1 and {MAX_EXECUTIONS_LIMIT}"
        )));
    }
    let executions = state
        .memory
        .get_execution_history(limit, query.operation_type.as_deref())?;
    Ok(Json(json!({ "ok": true, "count": executions.len(), "executions": executions })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn enable_agent(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: PasswordRequest = parse_json_or_default(&body)?;
    state.safety().enable_agent(request.password.as_deref())?;
    Ok(Json(json!({ "ok": true, "agent_enabled": true })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn disable_agent(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.safety().disable_agent()?;
    let loop_stopped = state.agent.stop().await;
    Ok(Json(json!({ "ok": true, "agent_enabled": false, "loop_stopped": loop_stopped })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn start_loop(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: StartLoopRequest = parse_json_or_default(&body)?;
    let interval = match request.interval_seconds {
        Some(0) => return Err(ApiError::validation("interval_seconds must be > 0")),
        Some(seconds) => Duration::from_secs(seconds),
        None => state.loop_interval,
    };
    state.agent.start(interval).await?;
    Ok(Json(json!({ "ok": true, "interval_seconds": interval.as_secs() })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn stop_loop(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let was_running = state.agent.stop().await;
    Ok(Json(json!({ "ok": true, "was_running": was_running })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn run_cycle(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    ok(state.agent.run_cycle().await?)
}

#[tracing::instrument(level = "warn", skip_all)]
async fn activate_kill_switch(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let reason = reason_of(parse_json(&body)?)?;
    state.safety().activate_kill_switch(&reason)?;
    let loop_stopped = state.agent.stop().await;
    Ok(Json(json!({ "ok": true, "kill_switch_active": true, "loop_stopped": loop_stopped })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn deactivate_kill_switch(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: PasswordRequest = parse_json_or_default(&body)?;
    state
        .safety()
        .deactivate_kill_switch(request.password.as_deref())?;
    Ok(Json(json!({ "ok": true, "kill_switch_active": false })))
}

#[tracing::instrument(level = "warn", skip_all)]
async fn emergency_shutdown(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let reason = reason_of(parse_json(&body)?)?;
    state.safety().emergency_shutdown(&reason)?;
    let loop_stopped = state.agent.stop().await;
    Ok(Json(json!({ "ok": true, "loop_stopped": loop_stopped })))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_modification_stats(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    ok(state.agent.modifier().modification_stats()?)
}

#[tracing::instrument(level = "info", skip_all)]
async fn enable_modifications(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: PasswordRequest = parse_json_or_default(&body)?;
    state
        .safety()
        .enable_modifications(request.password.as_deref())?;
    Ok(Json(json!({ "ok": true, "modifications_enabled": true })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn disable_modifications(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    state.safety().disable_modifications()?;
    Ok(Json(json!({ "ok": true, "modifications_enabled": false })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn set_max_per_day(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: MaxPerDayRequest = parse_json(&body)?;
    state.safety().set_max_modifications_per_day(request.max)?;
    Ok(Json(json!({ "ok": true, "max_modifications_per_day": request.max })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn propose(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ProposeRequest = parse_json(&body)?;
    ok(state.agent.modifier().propose(request).await?)
}

#[tracing::instrument(level = "info", skip_all)]
async fn apply(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ApplyRequest = parse_json(&body)?;
    let outcome = state
        .agent
        .modifier()
        .apply(&request.proposal_id, request.auto_test)
        .await?;
    let applied = matches!(outcome, ApplyOutcome::Applied { .. });
    let Json(mut body) = ok(outcome)?;
    body["ok"] = json!(applied);
    Ok(Json(body))
}

#[tracing::instrument(level = "info", skip_all)]
async fn rollback(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: RollbackRequest = parse_json(&body)?;
    ok(state.agent.modifier().rollback(&request.proposal_id).await?)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_proposal(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ok(state.agent.modifier().get_proposal(&id).await?)
}
