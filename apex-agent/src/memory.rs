//! Execution history, modification audit trail, learned patterns and metrics.
//!
//! [`SqliteMemory`] is the default backend and also serves as the [`StateStore`].

use crate::error::{AgentError, Result};
use crate::state::StateStore;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub operation_type: String,
    pub intent: Option<String>,
    pub plan: serde_json::Value,
    pub success: bool,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub context: Option<serde_json::Value>,
    pub result_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub operation_type: String,
    pub intent: Option<String>,
    pub plan: serde_json::Value,
    pub success: bool,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub context: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub modification_type: String,
    pub target_file: String,
    pub description: String,
    pub code_before: String,
    pub code_after: String,
    pub test_results: serde_json::Value,
    pub applied: bool,
    pub rolled_back: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeTemplate {
    pub name: String,
    pub description: String,
    pub code: String,
    pub language: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    pub total_executions: u64,
    /// Percentage in `0.0..=100.0`.
    pub overall_success_rate: f64,
    pub learned_patterns: u64,
    pub code_templates: u64,
    pub total_modifications: u64,
    pub applied_modifications: u64,
}

pub trait Memory: Send + Sync {
    fn record_execution(&self, execution: NewExecution) -> Result<i64>;
    /// Newest first.
    fn get_execution_history(
        &self,
        limit: usize,
        operation_type: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>>;
    /// Fraction in `0.0..=1.0` over the last `hours`; `0.0` when there are no executions.
    fn get_success_rate(&self, operation_type: Option<&str>, hours: i64) -> Result<f64>;
    fn get_statistics(&self) -> Result<MemoryStatistics>;
    fn record_modification(&self, record: ModificationRecord) -> Result<()>;
    fn record_metric(&self, name: &str, value: f64, context: Option<serde_json::Value>) -> Result<()>;
    fn save_pattern(
        &self,
        pattern_type: &str,
        pattern: &serde_json::Value,
        success: bool,
        execution_time_ms: i64,
    ) -> Result<()>;
    fn save_code_template(&self, template: CodeTemplate) -> Result<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    operation_type TEXT NOT NULL,
    intent TEXT,
    plan TEXT NOT NULL,
    success INTEGER NOT NULL,
    execution_time_ms INTEGER NOT NULL,
    error_message TEXT,
    context TEXT,
    result_hash TEXT
);
CREATE INDEX IF NOT EXISTS executions_timestamp ON executions (timestamp);
CREATE TABLE IF NOT EXISTS patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_type TEXT NOT NULL,
    pattern_hash TEXT NOT NULL,
    pattern_data TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    avg_execution_time_ms REAL NOT NULL DEFAULT 0,
    confidence_score REAL NOT NULL DEFAULT 0.5,
    last_used TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (pattern_type, pattern_hash)
);
CREATE TABLE IF NOT EXISTS code_templates (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    code TEXT NOT NULL,
    language TEXT NOT NULL,
    tags TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS modifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    modification_type TEXT NOT NULL,
    target_file TEXT NOT NULL,
    description TEXT NOT NULL,
    code_before TEXT NOT NULL,
    code_after TEXT NOT NULL,
    test_results TEXT NOT NULL,
    applied INTEGER NOT NULL,
    rolled_back INTEGER NOT NULL DEFAULT 0,
    reason TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS agent_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    metric_value REAL NOT NULL,
    context TEXT
);
"#;

/// Fixed-width UTC timestamps so lexical order in SQL equals chronological order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn short_hash(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    hex::encode(&digest[..8])
}

pub struct SqliteMemory {
    conn: Mutex<Connection>,
}

impl SqliteMemory {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("memory schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Store("memory connection lock poisoned".to_string()))
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
        let timestamp: String = row.get("timestamp")?;
        let plan: String = row.get("plan")?;
        let context: Option<String> = row.get("context")?;
        Ok(ExecutionRecord {
            id: row.get("id")?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
            operation_type: row.get("operation_type")?,
            intent: row.get("intent")?,
            plan: serde_json::from_str(&plan).unwrap_or(serde_json::Value::String(plan)),
            success: row.get("success")?,
            execution_time_ms: row.get("execution_time_ms")?,
            error_message: row.get("error_message")?,
            context: context.and_then(|c| serde_json::from_str(&c).ok()),
            result_hash: row.get("result_hash")?,
        })
    }
}

impl Memory for SqliteMemory {
    fn record_execution(&self, execution: NewExecution) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO executions (timestamp, operation_type, intent, plan, success, \
             execution_time_ms, error_message, context, result_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ts(Utc::now()),
                execution.operation_type,
                execution.intent,
                execution.plan.to_string(),
                execution.success,
                execution.execution_time_ms,
                execution.error_message,
                execution.context.as_ref().map(|c| c.to_string()),
                execution.result.as_ref().map(short_hash),
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(
            id,
            operation_type = %execution.operation_type,
            success = execution.success,
            "recorded execution"
        );
        Ok(id)
    }

    fn get_execution_history(
        &self,
        limit: usize,
        operation_type: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT * FROM executions WHERE (?1 IS NULL OR operation_type = ?1) \
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![operation_type, limit], Self::row_to_execution)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_success_rate(&self, operation_type: Option<&str>, hours: i64) -> Result<f64> {
        let cutoff = ts(Utc::now() - Duration::hours(hours));
        let conn = self.conn()?;
        let (successes, total): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(success), 0), COUNT(*) FROM executions \
             WHERE timestamp > ?1 AND (?2 IS NULL OR operation_type = ?2)",
            params![cutoff, operation_type],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(successes as f64 / total as f64)
    }

    fn get_statistics(&self) -> Result<MemoryStatistics> {
        let conn = self.conn()?;
        let (total_executions, successes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM executions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let learned_patterns: i64 =
            conn.query_row("SELECT COUNT(*) FROM patterns", [], |row| row.get(0))?;
        let code_templates: i64 =
            conn.query_row("SELECT COUNT(*) FROM code_templates", [], |row| row.get(0))?;
        let (total_modifications, applied_modifications): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(applied), 0) FROM modifications",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let overall_success_rate = if total_executions > 0 {
            successes as f64 * 100.0 / total_executions as f64
        } else {
            0.0
        };
        Ok(MemoryStatistics {
            total_executions: total_executions.max(0) as u64,
            overall_success_rate,
            learned_patterns: learned_patterns.max(0) as u64,
            code_templates: code_templates.max(0) as u64,
            total_modifications: total_modifications.max(0) as u64,
            applied_modifications: applied_modifications.max(0) as u64,
        })
    }

    fn record_modification(&self, record: ModificationRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO modifications (timestamp, modification_type, target_file, description, \
             code_before, code_after, test_results, applied, rolled_back, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                ts(Utc::now()),
                record.modification_type,
                record.target_file,
                record.description,
                record.code_before,
                record.code_after,
                record.test_results.to_string(),
                record.applied,
                record.rolled_back,
                record.reason,
            ],
        )?;
        tracing::info!(
            target_file = %record.target_file,
            applied = record.applied,
            rolled_back = record.rolled_back,
            "recorded modification"
        );
        Ok(())
    }

    fn record_metric(&self, name: &str, value: f64, context: Option<serde_json::Value>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metrics (timestamp, metric_name, metric_value, context) VALUES (?1, ?2, ?3, ?4)",
            params![ts(Utc::now()), name, value, context.map(|c| c.to_string())],
        )?;
        Ok(())
    }

    fn save_pattern(
        &self,
        pattern_type: &str,
        pattern: &serde_json::Value,
        success: bool,
        execution_time_ms: i64,
    ) -> Result<()> {
        let now = ts(Utc::now());
        let hash = short_hash(pattern);
        let conn = self.conn()?;
        let existing: Option<(i64, i64, i64, f64)> = conn
            .query_row(
                "SELECT id, success_count, failure_count, avg_execution_time_ms FROM patterns \
                 WHERE pattern_type = ?1 AND pattern_hash = ?2",
                params![pattern_type, hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match existing {
            Some((id, successes, failures, avg)) => {
                let successes = successes + i64::from(success);
                let failures = failures + i64::from(!success);
                let total = (successes + failures) as f64;
                let avg = (avg * (total - 1.0) + execution_time_ms as f64) / total;
                conn.execute(
                    "UPDATE patterns SET success_count = ?1, failure_count = ?2, \
                     avg_execution_time_ms = ?3, confidence_score = ?4, last_used = ?5 WHERE id = ?6",
                    params![successes, failures, avg, successes as f64 / total, now, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO patterns (pattern_type, pattern_hash, pattern_data, success_count, \
                     failure_count, avg_execution_time_ms, confidence_score, last_used, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        pattern_type,
                        hash,
                        pattern.to_string(),
                        i64::from(success),
                        i64::from(!success),
                        execution_time_ms as f64,
                        if success { 1.0 } else { 0.0 },
                        now,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn save_code_template(&self, template: CodeTemplate) -> Result<()> {
        let now = ts(Utc::now());
        let tags = serde_json::to_string(&template.tags)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO code_templates (name, description, code, language, tags, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(name) DO UPDATE SET description = excluded.description, code = excluded.code, \
             language = excluded.language, tags = excluded.tags, updated_at = excluded.updated_at",
            params![template.name, template.description, template.code, template.language, tags, now],
        )?;
        tracing::info!(name = %template.name, "saved code template");
        Ok(())
    }
}

impl StateStore for SqliteMemory {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(op: &str, success: bool, ms: i64) -> NewExecution {
        NewExecution {
            operation_type: op.to_string(),
            intent: Some("deploy".to_string()),
            plan: json!({ "steps": [{ "tool": op }] }),
            success,
            execution_time_ms: ms,
            error_message: (!success).then(|| "connection refused".to_string()),
            context: Some(json!({ "run_id": "run_1" })),
            result: Some(json!({ "returncode": 0 })),
        }
    }

    #[test]
    fn history_is_newest_first_and_filterable() {
        let memory = SqliteMemory::open_in_memory().unwrap();
        memory.record_execution(execution("shell", true, 10)).unwrap();
        memory.record_execution(execution("python", false, 20)).unwrap();
        memory.record_execution(execution("shell", true, 30)).unwrap();

        let all = memory.get_execution_history(10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].execution_time_ms, 30);
        assert_eq!(all[2].execution_time_ms, 10);
        assert_eq!(all[1].context, Some(json!({ "run_id": "run_1" })));
        assert_eq!(all[0].result_hash.as_ref().map(String::len), Some(16));

        let shell = memory.get_execution_history(10, Some("shell")).unwrap();
        assert_eq!(shell.len(), 2);
        assert_eq!(memory.get_execution_history(1, None).unwrap().len(), 1);
    }

    #[test]
    fn success_rate_and_statistics() {
        let memory = SqliteMemory::open_in_memory().unwrap();
        assert_eq!(memory.get_success_rate(None, 24).unwrap(), 0.0);
        memory.record_execution(execution("shell", true, 10)).unwrap();
        memory.record_execution(execution("shell", true, 10)).unwrap();
        memory.record_execution(execution("shell", true, 10)).unwrap();
        memory.record_execution(execution("python", false, 10)).unwrap();

        assert!((memory.get_success_rate(None, 24).unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(memory.get_success_rate(Some("python"), 24).unwrap(), 0.0);

        let stats = memory.get_statistics().unwrap();
        assert_eq!(stats.total_executions, 4);
        assert!((stats.overall_success_rate - 75.0).abs() < 1e-9);
    }

    #[test]
    fn patterns_are_merged_by_content() {
        let memory = SqliteMemory::open_in_memory().unwrap();
        let pattern = json!({ "operation_type": "shell", "intent": "deploy" });
        memory.save_pattern("successful_execution", &pattern, true, 100).unwrap();
        memory.save_pattern("successful_execution", &pattern, false, 300).unwrap();
        memory
            .save_pattern("successful_execution", &json!({ "other": 1 }), true, 5)
            .unwrap();
        assert_eq!(memory.get_statistics().unwrap().learned_patterns, 2);
    }

    #[test]
    fn modifications_and_templates_are_counted() {
        let memory = SqliteMemory::open_in_memory().unwrap();
        let record = ModificationRecord {
            modification_type: "refactor".to_string(),
            target_file: "/src/lib.rs".to_string(),
            description: "doc header".to_string(),
            code_before: "a".to_string(),
            code_after: "b".to_string(),
            test_results: json!({ "status": "skipped" }),
            applied: true,
            rolled_back: false,
            reason: "readability".to_string(),
        };
        memory.record_modification(record.clone()).unwrap();
        memory
            .record_modification(ModificationRecord {
                applied: false,
                ..record
            })
            .unwrap();
        let template = CodeTemplate {
            name: "auto_deploy".to_string(),
            description: "deploy".to_string(),
            code: "def deploy(): pass".to_string(),
            language: "python".to_string(),
            tags: vec!["auto-generated".to_string()],
        };
        memory.save_code_template(template.clone()).unwrap();
        memory.save_code_template(template).unwrap();

        let stats = memory.get_statistics().unwrap();
        assert_eq!(stats.total_modifications, 2);
        assert_eq!(stats.applied_modifications, 1);
        assert_eq!(stats.code_templates, 1);
    }

    #[test]
    fn state_store_upserts() {
        let memory = SqliteMemory::open_in_memory().unwrap();
        assert_eq!(memory.get("agent_enabled").unwrap(), None);
        memory.set("agent_enabled", "true").unwrap();
        memory.set("agent_enabled", "false").unwrap();
        assert_eq!(memory.get("agent_enabled").unwrap().as_deref(), Some("false"));
    }

    #[test]
    fn file_backed_memory_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/agent_memory.db");
        {
            let memory = SqliteMemory::open(&path).unwrap();
            memory.set("modifications_today", "2").unwrap();
            memory.record_metric("agent_cycle_duration_seconds", 0.5, None).unwrap();
        }
        let memory = SqliteMemory::open(&path).unwrap();
        assert_eq!(memory.get("modifications_today").unwrap().as_deref(), Some("2"));
    }
}
