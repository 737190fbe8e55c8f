//! Apex server.
//!
//! Wires the tool executor, execution memory, safety controller and agent loop into one
//! `AppState`, then mounts the signed HTTP surface on top.

use crate::config::{ApexConfig, ServerConfig};
use crate::http_auth::{self, SignaturePolicy, SignaturePolicyExt};
use crate::routes;
use anyhow::Result;
use apex_agent::{
    AgentComponents, AgentLoop, FileFlag, HistoryLearner, Memory, NewExecution, SafetyConfig,
    SafetyController, SafetyOverrides, SafetySecrets, ScriptTestRunner, SelfModifier,
    SelfModifierConfig, SqliteMemory, SystemClock, TemplateCodeGenerator,
};
use apex_tools::{ExecutionResult, ExecutorConfig, ToolCall, ToolExecutor};
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::{Extension, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MEMORY_DB_FILE: &str = "apex_memory.db";
const INCIDENT_LOG_FILE: &str = "safety_incidents.log";

pub struct AppState {
    pub executor: Arc<ToolExecutor>,
    pub agent: Arc<AgentLoop>,
    pub memory: Arc<dyn Memory>,
    pub loop_interval: Duration,
    pub shared_key: Option<String>,
    pub echo_sign_enabled: bool,
    pub started_at: Instant,
}

impl AppState {
    pub fn safety(&self) -> &Arc<SafetyController> {
        self.agent.safety()
    }

    /// Stores one executed step so the learner can see it. Failures only warn.
    pub fn record_step(
        &self,
        step: &ToolCall,
        intent: Option<&str>,
        run_id: &str,
        result: &ExecutionResult,
    ) {
        self.record(run_id, NewExecution {
            operation_type: step.kind().as_str().to_string(),
            intent: intent.map(str::to_string),
            plan: step.audit_json(),
            success: result.succeeded(),
            execution_time_ms: i64::try_from(result.duration_ms).unwrap_or(i64::MAX),
            error_message: result.error_message(),
            context: Some(json!({ "run_id": run_id })),
            result: serde_json::to_value(&result.payload).ok(),
        });
    }

    /// Stores a step that was refused or aborted before producing a result.
    pub fn record_refusal(
        &self,
        step: &ToolCall,
        intent: Option<&str>,
        run_id: &str,
        kind: &str,
        message: &str,
    ) {
        self.record(run_id, NewExecution {
            operation_type: step.kind().as_str().to_string(),
            intent: intent.map(str::to_string),
            plan: step.audit_json(),
            success: false,
            execution_time_ms: 0,
            error_message: Some(message.to_string()),
            context: Some(json!({ "run_id": run_id, "kind": kind })),
            result: None,
        });
    }

    fn record(&self, run_id: &str, execution: NewExecution) {
        if let Err(e) = self.memory.record_execution(execution) {
            tracing::warn!(error = %e, run_id, "failed to record execution in memory");
        }
    }
}

fn open_memory(cfg: &ApexConfig) -> Result<Arc<SqliteMemory>> {
    let data_dir = cfg.paths.data_dir_path()?;
    std::fs::create_dir_all(&data_dir)
        .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", data_dir.display()))?;
    Ok(Arc::new(SqliteMemory::open(&data_dir.join(MEMORY_DB_FILE))?))
}

fn open_safety(
    cfg: &ApexConfig,
    memory: Arc<SqliteMemory>,
    overrides: SafetyOverrides,
    secrets: SafetySecrets,
) -> Result<Arc<SafetyController>> {
    let kill_switch = Arc::new(FileFlag::new(cfg.kill_switch_path()?));
    let safety = SafetyController::new(
        memory.clone(),
        memory,
        kill_switch,
        overrides,
        secrets,
        SafetyConfig {
            incident_log: cfg.paths.log_dir_path()?.join(INCIDENT_LOG_FILE),
            auto_kill_on_critical: cfg.agent.auto_kill_on_critical,
        },
    )?;
    Ok(Arc::new(safety))
}

pub fn build_state(cfg: &ApexConfig) -> Result<Arc<AppState>> {
    build_state_with(cfg, SafetyOverrides::from_env(), SafetySecrets::from_env())
}

pub fn build_state_with(
    cfg: &ApexConfig,
    overrides: SafetyOverrides,
    secrets: SafetySecrets,
) -> Result<Arc<AppState>> {
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(cfg.policy.clone()),
        ExecutorConfig {
            work_root: cfg.paths.work_dir_path()?,
            log_dir: cfg.paths.log_dir_path()?,
            make_webhook_url: cfg.integrations.make_webhook_url.clone(),
            python_interpreter: cfg.agent.python_interpreter.clone(),
        },
    )?);

    let memory = open_memory(cfg)?;
    let safety = open_safety(cfg, memory.clone(), overrides, secrets)?;
    let clock = Arc::new(SystemClock);
    let codegen = Arc::new(TemplateCodeGenerator);
    let modifier = Arc::new(SelfModifier::new(
        SelfModifierConfig {
            source_root: cfg.paths.source_root_path()?,
            data_dir: cfg.paths.data_dir_path()?,
        },
        safety.clone(),
        memory.clone(),
        memory.clone(),
        codegen.clone(),
        Arc::new(ScriptTestRunner::new(
            cfg.agent.python_interpreter.clone(),
            Duration::from_secs(cfg.agent.test_timeout_seconds),
        )),
        clock.clone(),
    )?);
    let agent = Arc::new(AgentLoop::new(AgentComponents {
        safety,
        memory: memory.clone(),
        state: memory.clone(),
        learner: Arc::new(HistoryLearner::new(memory.clone())),
        codegen,
        modifier,
        clock,
    }));

    tracing::info!(
        work_root = %executor.work_root().display(),
        log_dir = %executor.log_dir().display(),
        source_root = %agent.modifier().source_root().display(),
        "apex state built"
    );

    Ok(Arc::new(AppState {
        executor,
        agent,
        memory,
        loop_interval: Duration::from_secs(cfg.agent.loop_interval_seconds),
        shared_key: cfg.shared_key().map(str::to_string),
        echo_sign_enabled: cfg.server.echo_sign_enabled,
        started_at: Instant::now(),
    }))
}

pub fn app(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let signature_policy = SignaturePolicy {
        shared_key: state.shared_key.clone(),
        max_body_bytes: server.max_body_bytes,
        exempt_paths: vec!["/auth/echo-sign".to_string()],
    };

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_signature))
        .layer(Extension(SignaturePolicyExt(signature_policy)))
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(GlobalConcurrencyLimitLayer::new(server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ApexConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = ?path.as_ref().map(|p| p.display().to_string()),
        %addr,
        echo_sign_enabled = cfg.server.echo_sign_enabled,
        "config loaded"
    );
    let listener = preflight_bind_listener(addr).await?;
    let state = build_state(&cfg)?;
    let app = app(state.clone(), &cfg.server);

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "apex serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if state.agent.stop().await {
        tracing::info!("agent loop stopped during shutdown");
    }
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ApexConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = ?path.as_ref().map(|p| p.display().to_string()),
        bind_addr = %cfg.bind_addr()?,
        shared_key_set = cfg.shared_key().is_some(),
        shell_allow = ?cfg.policy.shell_allow,
        paths_allow = ?cfg.policy.paths_allow,
        "config ok"
    );

    let dirs = [
        ("work_dir", cfg.paths.work_dir_path()?),
        ("log_dir", cfg.paths.log_dir_path()?),
        ("data_dir", cfg.paths.data_dir_path()?),
    ];
    let mut failed = Vec::new();
    for (name, dir) in &dirs {
        let check = routes::health::check_dir(dir).await;
        tracing::info!(dir = name, path = %dir.display(), status = check.status, "directory check");
        if !check.writable {
            failed.push(*name);
        }
    }
    let kill_switch = cfg.kill_switch_path()?;
    tracing::info!(
        path = %kill_switch.display(),
        active = tokio::fs::try_exists(&kill_switch).await.unwrap_or(false),
        "kill switch"
    );
    if !failed.is_empty() {
        return Err(anyhow::anyhow!("directories not writable: {}", failed.join(", ")));
    }
    Ok(())
}

/// Prints headers for a signed request, for use with curl.
pub async fn sign(config_path: Option<PathBuf>, body: &str) -> Result<()> {
    let cfg = ApexConfig::load(config_path).await?;
    let key = cfg
        .shared_key()
        .ok_or_else(|| anyhow::anyhow!("APEX_SHARED_KEY is not set"))?;
    let ts = chrono::Utc::now().timestamp().to_string();
    let sig = http_auth::sign(key, &ts, body.as_bytes())?;
    println!("X-TS: {ts}");
    println!("X-SIG: {sig}");
    Ok(())
}

pub enum KillSwitchCommand {
    Activate { reason: String },
    Deactivate { password: Option<String> },
}

pub async fn kill_switch(config_path: Option<PathBuf>, command: KillSwitchCommand) -> Result<()> {
    let cfg = ApexConfig::load(config_path).await?;
    let memory = open_memory(&cfg)?;
    let safety = open_safety(
        &cfg,
        memory,
        SafetyOverrides::from_env(),
        SafetySecrets::from_env(),
    )?;
    match command {
        KillSwitchCommand::Activate { reason } => {
            safety.activate_kill_switch(&reason)?;
            println!("kill switch activated");
        }
        KillSwitchCommand::Deactivate { password } => {
            safety.deactivate_kill_switch(password.as_deref())?;
            println!("kill switch deactivated; agent and modifications remain disabled");
        }
    }
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
