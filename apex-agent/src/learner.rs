use crate::error::Result;
use crate::memory::{ExecutionRecord, Memory};
use chrono::{Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

const SLOW_EXECUTION_MS: i64 = 10_000;
const VERY_SLOW_EXECUTION_MS: f64 = 30_000.0;
const HIGH_FAILURE_RATE: f64 = 0.2;
const REPEATED_INTENT_MIN: usize = 10;

static ERROR_CLASSES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"timeout|timed out", "Timeout"),
        (r"permission denied", "Permission Denied"),
        (r"not found", "Not Found"),
        (r"connection", "Connection Error"),
        (r"rate limit", "Rate Limit"),
    ]
    .into_iter()
    .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, label)))
    .collect()
});

pub fn classify_error(message: &str) -> &'static str {
    let message = message.to_lowercase();
    ERROR_CLASSES
        .iter()
        .find(|(re, _)| re.is_match(&message))
        .map(|(_, label)| *label)
        .unwrap_or("Unknown Error")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    Performance,
    Reliability,
    CodeReuse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub issue: String,
    pub suggestion: String,
    pub priority: Priority,
    pub occurrences: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Source file named in the execution context of the slow operations, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub category: OpportunityKind,
    pub description: String,
    pub action: String,
    pub impact: Priority,
    pub effort: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub error_type: String,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub early_period_avg_ms: f64,
    pub recent_period_avg_ms: f64,
    pub performance_change_percent: f64,
    pub trend: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAnalysis {
    pub total_executions: usize,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
    pub operation_types: BTreeMap<String, usize>,
    pub common_failures: Vec<FailurePattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_trend: Option<PerformanceTrend>,
    pub recommendations: Vec<String>,
}

pub trait Learner: Send + Sync {
    fn analyze_execution_patterns(&self, hours: i64) -> Result<ExecutionAnalysis>;
    fn identify_optimization_opportunities(&self) -> Result<Vec<Opportunity>>;
    fn suggest_improvements(&self) -> Result<Vec<Suggestion>>;
    fn learn_from_success(&self, execution: &ExecutionRecord) -> Result<()>;
    fn learn_from_failure(&self, execution: &ExecutionRecord) -> Result<()>;
}

/// Statistics over the execution history kept in [`Memory`].
pub struct HistoryLearner {
    memory: Arc<dyn Memory>,
}

impl HistoryLearner {
    pub fn new(memory: Arc<dyn Memory>) -> Self {
        Self { memory }
    }
}

fn average_ms(executions: &[&ExecutionRecord]) -> f64 {
    if executions.is_empty() {
        return 0.0;
    }
    executions.iter().map(|e| e.execution_time_ms as f64).sum::<f64>() / executions.len() as f64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn common_failures(executions: &[&ExecutionRecord]) -> Vec<FailurePattern> {
    let failures: Vec<_> = executions.iter().filter(|e| !e.success).collect();
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for failure in &failures {
        if let Some(message) = failure.error_message.as_deref().filter(|m| !m.is_empty()) {
            *counts.entry(classify_error(message)).or_default() += 1;
        }
    }
    let mut patterns: Vec<FailurePattern> = counts
        .into_iter()
        .map(|(error_type, count)| FailurePattern {
            error_type: error_type.to_string(),
            count,
            percentage: count as f64 * 100.0 / failures.len() as f64,
        })
        .collect();
    patterns.sort_by(|a, b| b.count.cmp(&a.count));
    patterns.truncate(5);
    patterns
}

fn performance_trend(executions: &[&ExecutionRecord]) -> Option<PerformanceTrend> {
    if executions.len() < 10 {
        return None;
    }
    let mut sorted = executions.to_vec();
    sorted.sort_by_key(|e| (e.timestamp, e.id));
    let (early, recent) = sorted.split_at(sorted.len() / 2);
    let early_avg = average_ms(early);
    let recent_avg = average_ms(recent);
    let change = if early_avg > 0.0 {
        (early_avg - recent_avg) / early_avg * 100.0
    } else {
        0.0
    };
    let trend = if change > 5.0 {
        "improving"
    } else if change < -5.0 {
        "degrading"
    } else {
        "stable"
    };
    Some(PerformanceTrend {
        early_period_avg_ms: round2(early_avg),
        recent_period_avg_ms: round2(recent_avg),
        performance_change_percent: round2(change),
        trend: trend.to_string(),
    })
}

fn recommendations(analysis: &ExecutionAnalysis) -> Vec<String> {
    let mut out = Vec::new();
    if analysis.success_rate < 0.8 {
        out.push(format!(
            "Success rate is {:.1}%. Consider reviewing failed operations and improving error handling.",
            analysis.success_rate * 100.0
        ));
    }
    if analysis.avg_execution_time_ms > 5000.0 {
        out.push(format!(
            "Average execution time is {:.0}ms. Consider optimizing slow operations or implementing caching.",
            analysis.avg_execution_time_ms
        ));
    }
    if let Some(top) = analysis.common_failures.first() {
        out.push(format!(
            "Most common failure: {} ({:.1}% of failures). Implement specific handling for this error type.",
            top.error_type, top.percentage
        ));
    }
    out
}

fn target_file_of(execution: &ExecutionRecord) -> Option<String> {
    execution
        .context
        .as_ref()?
        .get("target_file")?
        .as_str()
        .map(str::to_string)
}

fn plan_summary(plan: &serde_json::Value) -> String {
    match plan.get("steps").and_then(|s| s.as_array()) {
        Some(steps) if !steps.is_empty() => {
            let tools: Vec<&str> = steps
                .iter()
                .take(3)
                .map(|s| s.get("tool").and_then(|t| t.as_str()).unwrap_or("unknown"))
                .collect();
            format!("{} steps: {}", steps.len(), tools.join(", "))
        }
        _ => plan.to_string().chars().take(100).collect(),
    }
}

impl Learner for HistoryLearner {
    fn analyze_execution_patterns(&self, hours: i64) -> Result<ExecutionAnalysis> {
        let history = self.memory.get_execution_history(1000, None)?;
        let cutoff = Utc::now() - Duration::hours(hours);
        let recent: Vec<&ExecutionRecord> = history.iter().filter(|e| e.timestamp > cutoff).collect();
        if recent.is_empty() {
            return Ok(ExecutionAnalysis::default());
        }

        let mut operation_types = BTreeMap::new();
        for execution in &recent {
            *operation_types.entry(execution.operation_type.clone()).or_default() += 1;
        }
        let mut analysis = ExecutionAnalysis {
            total_executions: recent.len(),
            success_rate: recent.iter().filter(|e| e.success).count() as f64 / recent.len() as f64,
            avg_execution_time_ms: average_ms(&recent),
            operation_types,
            common_failures: common_failures(&recent),
            performance_trend: performance_trend(&recent),
            recommendations: Vec::new(),
        };
        analysis.recommendations = recommendations(&analysis);
        tracing::info!(executions = analysis.total_executions, "analyzed execution patterns");
        Ok(analysis)
    }

    fn identify_optimization_opportunities(&self) -> Result<Vec<Opportunity>> {
        let history = self.memory.get_execution_history(500, None)?;
        let mut opportunities = Vec::new();
        if history.is_empty() {
            return Ok(opportunities);
        }

        let mut slow_by_type: BTreeMap<&str, Vec<&ExecutionRecord>> = BTreeMap::new();
        for execution in history.iter().filter(|e| e.execution_time_ms > SLOW_EXECUTION_MS) {
            slow_by_type
                .entry(execution.operation_type.as_str())
                .or_default()
                .push(execution);
        }
        for (operation, slow) in slow_by_type {
            let avg = average_ms(&slow);
            opportunities.push(Opportunity {
                kind: OpportunityKind::Performance,
                issue: format!("Slow execution (avg {avg:.0}ms)"),
                suggestion: "Consider adding caching, parallel execution, or optimization".to_string(),
                priority: if avg > VERY_SLOW_EXECUTION_MS {
                    Priority::High
                } else {
                    Priority::Medium
                },
                occurrences: slow.len(),
                operation: Some(operation.to_string()),
                target_file: slow.iter().find_map(|e| target_file_of(e)),
            });
        }

        let failures = history.iter().filter(|e| !e.success).count();
        let failure_rate = failures as f64 / history.len() as f64;
        if failure_rate > HIGH_FAILURE_RATE {
            opportunities.push(Opportunity {
                kind: OpportunityKind::Reliability,
                issue: format!("High failure rate: {:.1}%", failure_rate * 100.0),
                suggestion: "Implement retry logic, better error handling, or input validation"
                    .to_string(),
                priority: Priority::High,
                occurrences: failures,
                operation: None,
                target_file: None,
            });
        }

        let mut intents: BTreeMap<&str, usize> = BTreeMap::new();
        for intent in history.iter().filter_map(|e| e.intent.as_deref()).filter(|i| !i.is_empty()) {
            *intents.entry(intent).or_default() += 1;
        }
        let mut repeated: Vec<(&str, usize)> = intents
            .into_iter()
            .filter(|(_, count)| *count > REPEATED_INTENT_MIN)
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1));
        for (intent, count) in repeated.into_iter().take(10) {
            opportunities.push(Opportunity {
                kind: OpportunityKind::CodeReuse,
                issue: intent.to_string(),
                suggestion: format!("Create a reusable template for: '{intent}'"),
                priority: Priority::Medium,
                occurrences: count,
                operation: None,
                target_file: None,
            });
        }

        tracing::info!(count = opportunities.len(), "identified optimization opportunities");
        Ok(opportunities)
    }

    fn suggest_improvements(&self) -> Result<Vec<Suggestion>> {
        let mut suggestions: Vec<Suggestion> = self
            .identify_optimization_opportunities()?
            .into_iter()
            .filter(|o| o.priority == Priority::High)
            .map(|o| Suggestion {
                category: o.kind,
                description: o.issue,
                action: o.suggestion,
                impact: Priority::High,
                effort: match o.kind {
                    OpportunityKind::CodeReuse => Priority::Low,
                    OpportunityKind::Performance => Priority::Medium,
                    OpportunityKind::Reliability => Priority::High,
                },
                target_file: o.target_file,
            })
            .collect();

        let stats = self.memory.get_statistics()?;
        if stats.total_executions > 100 && stats.code_templates < 5 {
            suggestions.push(Suggestion {
                category: OpportunityKind::CodeReuse,
                description: "Few code templates despite many executions".to_string(),
                action: "Generate reusable code templates from successful patterns".to_string(),
                impact: Priority::Medium,
                effort: Priority::Low,
                target_file: None,
            });
        }
        Ok(suggestions)
    }

    fn learn_from_success(&self, execution: &ExecutionRecord) -> Result<()> {
        if !execution.success {
            return Ok(());
        }
        let pattern = serde_json::json!({
            "operation_type": execution.operation_type,
            "intent": execution.intent,
            "plan_summary": plan_summary(&execution.plan),
        });
        self.memory
            .save_pattern("successful_execution", &pattern, true, execution.execution_time_ms)
    }

    fn learn_from_failure(&self, execution: &ExecutionRecord) -> Result<()> {
        if execution.success {
            return Ok(());
        }
        let message = execution.error_message.as_deref().unwrap_or_default();
        let pattern = serde_json::json!({
            "operation_type": execution.operation_type,
            "intent": execution.intent,
            "error_type": classify_error(message),
            "error_message": message.chars().take(200).collect::<String>(),
        });
        self.memory
            .save_pattern("failed_execution", &pattern, false, execution.execution_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{NewExecution, SqliteMemory};
    use serde_json::json;

    fn seeded(executions: Vec<NewExecution>) -> (Arc<SqliteMemory>, HistoryLearner) {
        let memory = Arc::new(SqliteMemory::open_in_memory().unwrap());
        for execution in executions {
            memory.record_execution(execution).unwrap();
        }
        let learner = HistoryLearner::new(memory.clone());
        (memory, learner)
    }

    fn exec(op: &str, success: bool, ms: i64, error: Option<&str>) -> NewExecution {
        NewExecution {
            operation_type: op.to_string(),
            intent: Some(format!("{op} intent")),
            plan: json!({ "steps": [{ "tool": op }] }),
            success,
            execution_time_ms: ms,
            error_message: error.map(str::to_string),
            ..NewExecution::default()
        }
    }

    #[test]
    fn error_messages_are_classified() {
        assert_eq!(classify_error("request TIMED OUT after 30s"), "Timeout");
        assert_eq!(classify_error("Permission denied (os error 13)"), "Permission Denied");
        assert_eq!(classify_error("file not found"), "Not Found");
        assert_eq!(classify_error("connection reset"), "Connection Error");
        assert_eq!(classify_error("boom"), "Unknown Error");
    }

    #[test]
    fn empty_history_yields_empty_analysis() {
        let (_memory, learner) = seeded(vec![]);
        let analysis = learner.analyze_execution_patterns(24).unwrap();
        assert_eq!(analysis.total_executions, 0);
        assert!(learner.identify_optimization_opportunities().unwrap().is_empty());
    }

    #[test]
    fn analysis_reports_failures_and_recommendations() {
        let mut executions = vec![exec("shell", true, 100, None); 6];
        executions.extend(vec![exec("http_request", false, 100, Some("connection refused")); 4]);
        let (_memory, learner) = seeded(executions);

        let analysis = learner.analyze_execution_patterns(24).unwrap();
        assert_eq!(analysis.total_executions, 10);
        assert!((analysis.success_rate - 0.6).abs() < 1e-9);
        assert_eq!(analysis.operation_types.get("shell"), Some(&6));
        assert_eq!(analysis.common_failures[0].error_type, "Connection Error");
        assert!(analysis.performance_trend.is_some());
        assert_eq!(analysis.recommendations.len(), 2);
    }

    #[test]
    fn slow_operations_and_failures_become_opportunities() {
        let mut executions = vec![exec("python", true, 40_000, None); 2];
        executions.push(exec("shell", false, 50, Some("timeout")));
        let (_memory, learner) = seeded(executions);

        let opportunities = learner.identify_optimization_opportunities().unwrap();
        let performance = opportunities
            .iter()
            .find(|o| o.kind == OpportunityKind::Performance)
            .unwrap();
        assert_eq!(performance.priority, Priority::High);
        assert_eq!(performance.operation.as_deref(), Some("python"));
        assert!(opportunities.iter().any(|o| o.kind == OpportunityKind::Reliability));

        let suggestions = learner.suggest_improvements().unwrap();
        assert_eq!(suggestions.len(), 2);
    }

    #[test]
    fn slow_operation_carries_target_file_from_context() {
        let mut slow = exec("python", true, 20_000, None);
        slow.context = Some(json!({ "target_file": "tools/report.py" }));
        let (_memory, learner) = seeded(vec![slow]);
        let opportunities = learner.identify_optimization_opportunities().unwrap();
        assert_eq!(opportunities[0].target_file.as_deref(), Some("tools/report.py"));
    }

    #[test]
    fn repeated_intents_become_code_reuse() {
        let (_memory, learner) = seeded(vec![exec("shell", true, 10, None); 11]);
        let opportunities = learner.identify_optimization_opportunities().unwrap();
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].kind, OpportunityKind::CodeReuse);
        assert_eq!(opportunities[0].occurrences, 11);
    }

    #[test]
    fn learning_saves_patterns() {
        let (memory, learner) = seeded(vec![
            exec("shell", true, 10, None),
            exec("shell", false, 10, Some("not found")),
        ]);
        for execution in memory.get_execution_history(10, None).unwrap() {
            learner.learn_from_success(&execution).unwrap();
            learner.learn_from_failure(&execution).unwrap();
        }
        assert_eq!(memory.get_statistics().unwrap().learned_patterns, 2);
    }
}
