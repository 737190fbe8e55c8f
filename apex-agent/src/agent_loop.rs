//! Background orchestration loop: safety check, learning, analysis, improvement and
//! self-optimization phases on a fixed interval.

use crate::clock::Clock;
use crate::codegen::{CodeGenerator, Language};
use crate::error::{AgentError, Result};
use crate::learner::{ExecutionAnalysis, Learner, Opportunity, OpportunityKind, Suggestion};
use crate::memory::{CodeTemplate, Memory, MemoryStatistics};
use crate::safety::{SafetyController, SafetyStatus, Severity};
use crate::self_modify::{
    ApplyOutcome, ModificationStats, ModificationType, ProposeOutcome, ProposeRequest, SelfModifier,
};
use crate::state::{StateStore, keys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(3600);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_WINDOW: usize = 100;
const LOW_SUCCESS_RATE: f64 = 0.5;
const LOW_SUCCESS_MIN_EXECUTIONS: usize = 10;
const SUGGESTIONS_PER_CYCLE: usize = 3;
const SELF_OPTIMIZATION_MIN_EXECUTIONS: u64 = 100;
const SELF_OPTIMIZATION_EVERY_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub loop_count: u64,
    pub last_learning_time: Option<DateTime<Utc>>,
    pub last_optimization_time: Option<DateTime<Utc>>,
    pub last_cycle_duration_seconds: Option<f64>,
    pub interval_seconds: Option<u64>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            loop_count: 0,
            last_learning_time: None,
            last_optimization_time: None,
            last_cycle_duration_seconds: None,
            interval_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(rename = "loop")]
    pub loop_status: LoopStatus,
    pub safety: SafetyStatus,
    pub modifications: ModificationStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub analysis: ExecutionAnalysis,
    pub opportunities: Vec<Opportunity>,
    pub suggestions: Vec<Suggestion>,
    pub memory_stats: MemoryStatistics,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub cancelled: bool,
    pub executions_learned: usize,
    pub opportunities: usize,
    pub templates: Vec<String>,
    pub proposals: Vec<String>,
    pub applied: Vec<String>,
    pub self_optimized: bool,
    pub duration_seconds: f64,
}

/// Collaborators the loop composes.
#[derive(Clone)]
pub struct AgentComponents {
    pub safety: Arc<SafetyController>,
    pub memory: Arc<dyn Memory>,
    pub state: Arc<dyn StateStore>,
    pub learner: Arc<dyn Learner>,
    pub codegen: Arc<dyn CodeGenerator>,
    pub modifier: Arc<SelfModifier>,
    pub clock: Arc<dyn Clock>,
}

struct Inner {
    c: AgentComponents,
    status: RwLock<LoopStatus>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

pub struct AgentLoop {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl AgentLoop {
    pub fn new(components: AgentComponents) -> Self {
        Self {
            inner: Arc::new(Inner {
                c: components,
                status: RwLock::new(LoopStatus::default()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn safety(&self) -> &Arc<SafetyController> {
        &self.inner.c.safety
    }

    pub fn modifier(&self) -> &Arc<SelfModifier> {
        &self.inner.c.modifier
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.inner.c.memory
    }

    pub fn learner(&self) -> &Arc<dyn Learner> {
        &self.inner.c.learner
    }

    #[tracing::instrument(level = "info", skip_all, fields(interval_seconds = interval.as_secs()))]
    pub async fn start(&self, interval: Duration) -> Result<()> {
        if !self.inner.c.safety.is_enabled() {
            return Err(AgentError::PreconditionFailed(
                "agent is disabled; enable it before starting the loop".to_string(),
            ));
        }
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.supervisor.is_finished()) {
            return Err(AgentError::Conflict("agent loop is already running".to_string()));
        }
        let interval = interval.max(Duration::from_secs(1));
        {
            let mut status = self.inner.status.write().await;
            status.state = LoopState::Running;
            status.interval_seconds = Some(interval.as_secs());
        }

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_loop(self.inner.clone(), cancel.child_token(), interval));
        let inner = self.inner.clone();
        let supervisor = tokio::spawn(async move {
            let next = match worker.await {
                Ok(()) => LoopState::Idle,
                Err(e) if e.is_panic() => {
                    tracing::error!(error = %e, "agent loop crashed");
                    if let Err(e) = inner.c.safety.record_safety_incident(
                        "agent_crash",
                        &format!("agent loop task panicked: {e}"),
                        Severity::Critical,
                    ) {
                        tracing::error!(error = %e, "failed to record crash incident");
                    }
                    LoopState::Crashed
                }
                Err(_) => LoopState::Idle,
            };
            inner.status.write().await.state = next;
        });
        *running = Some(Running { cancel, supervisor });
        tracing::info!("agent loop started");
        Ok(())
    }

    /// Returns whether a loop was running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        running.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, running.supervisor).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "agent loop join failed"),
            Err(_) => tracing::warn!("timed out waiting for agent loop shutdown"),
        }
        let mut status = self.inner.status.write().await;
        if status.state == LoopState::Running {
            status.state = LoopState::Idle;
        }
        tracing::info!("agent loop stopped");
        true
    }

    pub async fn loop_status(&self) -> LoopStatus {
        self.inner.status.read().await.clone()
    }

    pub async fn status(&self) -> Result<AgentStatus> {
        Ok(AgentStatus {
            loop_status: self.loop_status().await,
            safety: self.inner.c.safety.status(),
            modifications: self.inner.c.modifier.modification_stats()?,
        })
    }

    /// Runs one cycle immediately, outside the background task.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.inner.run_cycle(&CancellationToken::new()).await
    }

    pub fn learning_report(&self) -> Result<LearningReport> {
        let c = &self.inner.c;
        Ok(LearningReport {
            analysis: c.learner.analyze_execution_patterns(24)?,
            opportunities: c.learner.identify_optimization_opportunities()?,
            suggestions: c.learner.suggest_improvements()?,
            memory_stats: c.memory.get_statistics()?,
            generated_at: c.clock.now(),
        })
    }
}

async fn run_loop(inner: Arc<Inner>, cancel: CancellationToken, interval: Duration) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if !inner.c.safety.is_enabled() {
            tracing::warn!("agent disabled; loop exiting");
            break;
        }
        match inner.run_cycle(&cancel).await {
            Ok(report) if report.cancelled => break,
            Ok(report) => tracing::info!(
                skipped = report.skipped.as_deref().unwrap_or(""),
                opportunities = report.opportunities,
                proposals = report.proposals.len(),
                duration_seconds = report.duration_seconds,
                "agent cycle finished"
            ),
            Err(e) => {
                tracing::error!(error = %e, "agent cycle failed");
                if let Err(e) = inner.c.safety.record_safety_incident(
                    "cycle_error",
                    &e.to_string(),
                    Severity::Medium,
                ) {
                    tracing::error!(error = %e, "failed to record cycle incident");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("agent loop received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

impl Inner {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        let checks = self.c.safety.check_safety_limits();
        if !checks.ok() {
            tracing::warn!(?checks, "safety checks failed; skipping cycle");
            report.skipped = Some("safety checks failed".to_string());
            return Ok(report);
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        report.executions_learned = self.learning_phase()?;
        self.status.write().await.last_learning_time = Some(self.c.clock.now());

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        let (analysis, opportunities) = self.analysis_phase()?;
        report.opportunities = opportunities.len();

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        if self.c.safety.modifications_enabled_check() {
            self.improvement_phase(&mut report).await?;
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        if self.c.safety.modifications_enabled_check() {
            report.self_optimized = self.self_optimization_phase(&analysis).await?;
        }

        let elapsed = started.elapsed().as_secs_f64();
        report.duration_seconds = elapsed;
        self.c
            .memory
            .record_metric("agent_cycle_duration_seconds", elapsed, None)?;
        let mut status = self.status.write().await;
        status.loop_count = status.loop_count.saturating_add(1);
        status.last_cycle_duration_seconds = Some(elapsed);
        Ok(report)
    }

    fn learning_phase(&self) -> Result<usize> {
        let history = self.c.memory.get_execution_history(HISTORY_WINDOW, None)?;
        for execution in &history {
            let learned = if execution.success {
                self.c.learner.learn_from_success(execution)
            } else {
                self.c.learner.learn_from_failure(execution)
            };
            if let Err(e) = learned {
                tracing::warn!(execution_id = execution.id, error = %e, "learner rejected execution");
            }
        }

        let success_rate = self.c.memory.get_success_rate(None, 24)?;
        if success_rate < LOW_SUCCESS_RATE && history.len() > LOW_SUCCESS_MIN_EXECUTIONS {
            self.c.safety.record_safety_incident(
                "low_success_rate",
                &format!("Success rate dropped to {:.1}%", success_rate * 100.0),
                Severity::Medium,
            )?;
        }
        Ok(history.len())
    }

    fn analysis_phase(&self) -> Result<(ExecutionAnalysis, Vec<Opportunity>)> {
        let analysis = self.c.learner.analyze_execution_patterns(24)?;
        let opportunities = self.c.learner.identify_optimization_opportunities()?;
        self.c
            .state
            .set(keys::CURRENT_OPPORTUNITIES, &opportunities.len().to_string())?;
        tracing::info!(
            success_rate = analysis.success_rate,
            opportunities = opportunities.len(),
            "analysis phase finished"
        );
        Ok((analysis, opportunities))
    }

    async fn improvement_phase(&self, report: &mut CycleReport) -> Result<()> {
        let suggestions = self.c.learner.suggest_improvements()?;
        for suggestion in suggestions.into_iter().take(SUGGESTIONS_PER_CYCLE) {
            match suggestion.category {
                OpportunityKind::CodeReuse => {
                    let function = self
                        .c
                        .codegen
                        .generate_function(&suggestion.description, Language::Rust)?;
                    self.c.memory.save_code_template(CodeTemplate {
                        name: function.template_name.clone(),
                        description: suggestion.description.clone(),
                        code: function.code,
                        language: Language::Rust.as_str().to_string(),
                        tags: vec!["auto_generated".to_string(), "code_reuse".to_string()],
                    })?;
                    report.templates.push(function.template_name);
                }
                OpportunityKind::Performance => {
                    let Some(target_file) = suggestion.target_file.clone() else {
                        tracing::info!(description = %suggestion.description, "performance suggestion without a target file");
                        continue;
                    };
                    self.propose_optimization(target_file, &suggestion, report).await?;
                }
                OpportunityKind::Reliability => {
                    tracing::warn!(
                        description = %suggestion.description,
                        action = %suggestion.action,
                        "reliability improvement suggested"
                    );
                }
            }
        }
        Ok(())
    }

    async fn propose_optimization(
        &self,
        target_file: String,
        suggestion: &Suggestion,
        report: &mut CycleReport,
    ) -> Result<()> {
        let outcome = self
            .c
            .modifier
            .propose(ProposeRequest {
                target_file,
                modification_type: ModificationType::Optimize,
                description: suggestion.description.clone(),
                reason: "performance".to_string(),
            })
            .await?;
        let ProposeOutcome::Proposed { proposal, .. } = outcome else {
            return Ok(());
        };
        report.proposals.push(proposal.id.clone());

        if self.c.safety.approval_required() || self.c.safety.is_sandbox_mode() {
            tracing::info!(proposal_id = %proposal.id, "proposal awaiting approval");
            return Ok(());
        }
        match self.c.modifier.apply(&proposal.id, true).await? {
            ApplyOutcome::Applied { .. } => report.applied.push(proposal.id.clone()),
            other => tracing::warn!(proposal_id = %proposal.id, outcome = ?other, "auto-apply did not succeed"),
        }
        Ok(())
    }

    async fn self_optimization_phase(&self, analysis: &ExecutionAnalysis) -> Result<bool> {
        let now = self.c.clock.now();
        let due = self
            .status
            .read()
            .await
            .last_optimization_time
            .is_none_or(|last| now - last >= chrono::Duration::hours(SELF_OPTIMIZATION_EVERY_HOURS));
        if !due {
            return Ok(false);
        }
        let stats = self.c.memory.get_statistics()?;
        if stats.total_executions < SELF_OPTIMIZATION_MIN_EXECUTIONS {
            return Ok(false);
        }
        for recommendation in &analysis.recommendations {
            tracing::info!(recommendation = %recommendation, "self-optimization recommendation");
        }
        self.c.memory.record_metric(
            "agent_success_rate",
            stats.overall_success_rate,
            Some(serde_json::json!({ "total_executions": stats.total_executions })),
        )?;
        self.status.write().await.last_optimization_time = Some(now);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::TemplateCodeGenerator;
    use crate::learner::HistoryLearner;
    use crate::memory::{ExecutionRecord, NewExecution, SqliteMemory};
    use crate::safety::tests::Harness;
    use crate::safety::{SafetyOverrides, SafetySecrets};
    use crate::self_modify::SelfModifierConfig;
    use crate::test_runner::ScriptTestRunner;
    use crate::clock::testing::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    struct PanickingLearner;

    impl Learner for PanickingLearner {
        fn analyze_execution_patterns(&self, _hours: i64) -> Result<ExecutionAnalysis> {
            panic!("learner exploded");
        }
        fn identify_optimization_opportunities(&self) -> Result<Vec<Opportunity>> {
            Ok(Vec::new())
        }
        fn suggest_improvements(&self) -> Result<Vec<Suggestion>> {
            Ok(Vec::new())
        }
        fn learn_from_success(&self, _execution: &ExecutionRecord) -> Result<()> {
            Ok(())
        }
        fn learn_from_failure(&self, _execution: &ExecutionRecord) -> Result<()> {
            Ok(())
        }
    }

    fn agent(h: &Harness, overrides: SafetyOverrides, learner: Option<Arc<dyn Learner>>) -> AgentLoop {
        agent_with_clock(h, overrides, learner, Arc::new(crate::clock::SystemClock))
    }

    fn agent_with_clock(
        h: &Harness,
        overrides: SafetyOverrides,
        learner: Option<Arc<dyn Learner>>,
        clock: Arc<dyn Clock>,
    ) -> AgentLoop {
        let safety = Arc::new(h.controller(overrides, SafetySecrets::default()));
        let memory: Arc<SqliteMemory> = h.memory.clone();
        let codegen: Arc<dyn CodeGenerator> = Arc::new(TemplateCodeGenerator);
        let source_root = h.dir.path().join("src");
        std::fs::create_dir_all(&source_root).unwrap();
        let modifier = SelfModifier::new(
            SelfModifierConfig {
                source_root,
                data_dir: h.dir.path().join("data"),
            },
            safety.clone(),
            memory.clone(),
            memory.clone(),
            codegen.clone(),
            Arc::new(ScriptTestRunner::new("python3", Duration::from_secs(5))),
            clock.clone(),
        )
        .unwrap();
        let learner: Arc<dyn Learner> = match learner {
            Some(learner) => learner,
            None => Arc::new(HistoryLearner::new(memory.clone())),
        };
        AgentLoop::new(AgentComponents {
            safety,
            memory: memory.clone(),
            state: memory,
            learner,
            codegen,
            modifier: Arc::new(modifier),
            clock,
        })
    }

    fn seed_successes(h: &Harness, count: usize) {
        for i in 0..count {
            h.memory
                .record_execution(NewExecution {
                    operation_type: "shell".to_string(),
                    intent: Some(format!("check disk {i}")),
                    plan: json!({}),
                    success: true,
                    execution_time_ms: 20,
                    ..NewExecution::default()
                })
                .unwrap();
        }
    }

    fn enabled() -> SafetyOverrides {
        SafetyOverrides {
            agent_enabled: Some(true),
            modifications_enabled: Some(true),
            git_integration: Some(false),
            ..SafetyOverrides::default()
        }
    }

    #[tokio::test]
    async fn start_refuses_when_agent_is_disabled() {
        let h = Harness::new();
        let agent = agent(&h, SafetyOverrides::default(), None);
        let err = agent.start(Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.kind(), "precondition_failed");
        assert_eq!(agent.loop_status().await.state, LoopState::Idle);
    }

    #[tokio::test]
    async fn cycle_is_skipped_when_safety_checks_fail() {
        let h = Harness::new();
        let agent = agent(&h, SafetyOverrides::default(), None);
        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.skipped.as_deref(), Some("safety checks failed"));
        assert_eq!(agent.loop_status().await.loop_count, 0);
    }

    #[tokio::test]
    async fn slow_operations_on_a_file_produce_a_pending_proposal() {
        let h = Harness::new();
        let agent = agent(&h, enabled(), None);
        std::fs::write(h.dir.path().join("src/slow.txt"), "slow path\n").unwrap();
        for _ in 0..3 {
            h.memory
                .record_execution(NewExecution {
                    operation_type: "plan".to_string(),
                    intent: Some("rebuild index".to_string()),
                    plan: json!({"steps": []}),
                    success: true,
                    execution_time_ms: 45_000,
                    context: Some(json!({"target_file": "slow.txt"})),
                    ..NewExecution::default()
                })
                .unwrap();
        }

        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.skipped, None);
        assert_eq!(report.executions_learned, 3);
        assert_eq!(report.opportunities, 1);
        assert_eq!(report.proposals.len(), 1);
        assert!(report.applied.is_empty());
        assert_eq!(
            h.memory.get(keys::CURRENT_OPPORTUNITIES).unwrap().as_deref(),
            Some("1")
        );

        let proposal = agent.modifier().get_proposal(&report.proposals[0]).await.unwrap();
        assert_eq!(proposal.modification_type, ModificationType::Optimize);
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("src/slow.txt")).unwrap(),
            "slow path\n"
        );
        let status = agent.loop_status().await;
        assert_eq!(status.loop_count, 1);
        assert!(status.last_learning_time.is_some());
        assert!(status.last_optimization_time.is_none());
    }

    #[tokio::test]
    async fn self_optimization_runs_at_most_once_per_day() {
        let h = Harness::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let agent = agent_with_clock(&h, enabled(), None, clock.clone());
        seed_successes(&h, 100);

        let first = agent.run_cycle().await.unwrap();
        assert_eq!(first.skipped, None);
        assert!(first.self_optimized);
        assert_eq!(agent.loop_status().await.last_optimization_time, Some(t0));

        clock.set(t0 + chrono::Duration::hours(23));
        let second = agent.run_cycle().await.unwrap();
        assert!(!second.self_optimized);
        assert_eq!(agent.loop_status().await.last_optimization_time, Some(t0));

        let t1 = t0 + chrono::Duration::hours(24);
        clock.set(t1);
        let third = agent.run_cycle().await.unwrap();
        assert!(third.self_optimized);
        let status = agent.loop_status().await;
        assert_eq!(status.last_optimization_time, Some(t1));
        assert_eq!(status.loop_count, 3);
    }

    #[tokio::test]
    async fn self_optimization_needs_enough_history_and_enabled_modifications() {
        let h = Harness::new();
        let agent = agent(&h, enabled(), None);
        seed_successes(&h, 99);
        assert!(!agent.run_cycle().await.unwrap().self_optimized);

        let h = Harness::new();
        let agent = self::agent(
            &h,
            SafetyOverrides {
                modifications_enabled: Some(false),
                ..enabled()
            },
            None,
        );
        seed_successes(&h, 100);
        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.skipped, None);
        assert!(!report.self_optimized);
        assert!(agent.loop_status().await.last_optimization_time.is_none());
    }

    #[tokio::test]
    async fn cancelled_token_stops_cycle_before_learning() {
        let h = Harness::new();
        let agent = agent(&h, enabled(), None);
        seed_successes(&h, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = agent.inner.run_cycle(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.executions_learned, 0);
        let status = agent.loop_status().await;
        assert_eq!(status.loop_count, 0);
        assert!(status.last_learning_time.is_none());
    }

    #[tokio::test]
    async fn start_twice_conflicts_and_stop_returns_to_idle() {
        let h = Harness::new();
        let agent = agent(&h, enabled(), None);
        agent.start(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(agent.loop_status().await.state, LoopState::Running);
        assert_eq!(
            agent.start(Duration::from_secs(3600)).await.unwrap_err().kind(),
            "conflict"
        );

        assert!(agent.stop().await);
        assert_eq!(agent.loop_status().await.state, LoopState::Idle);
        assert!(!agent.stop().await);
    }

    #[tokio::test]
    async fn panicking_cycle_marks_loop_crashed_and_records_incident() {
        let h = Harness::new();
        let agent = agent(&h, enabled(), Some(Arc::new(PanickingLearner)));
        agent.start(Duration::from_secs(3600)).await.unwrap();

        let mut state = LoopState::Running;
        for _ in 0..100 {
            state = agent.loop_status().await.state;
            if state == LoopState::Crashed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, LoopState::Crashed);
        let log = std::fs::read_to_string(h.incident_log()).unwrap();
        assert!(log.contains("[CRITICAL] agent_crash"));
    }

    #[tokio::test]
    async fn learning_report_includes_memory_stats() {
        let h = Harness::new();
        let agent = agent(&h, enabled(), None);
        h.memory
            .record_execution(NewExecution {
                operation_type: "shell".to_string(),
                plan: json!({}),
                success: true,
                execution_time_ms: 12,
                ..NewExecution::default()
            })
            .unwrap();
        let report = agent.learning_report().unwrap();
        assert_eq!(report.analysis.total_executions, 1);
        assert_eq!(report.memory_stats.total_executions, 1);
        assert!(report.opportunities.is_empty());
    }
}
