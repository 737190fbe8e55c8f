use crate::error::{Result, ToolError};
use crate::filesystem::{self, FileWritten};
use crate::http::{self, HttpResponse};
use crate::plan::{Plan, ShellArgs, ToolAction, ToolCall, ToolKind};
use crate::policy::Policy;
use crate::run_log::RunLog;
use crate::shell::{self, ProcessOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    pub kind: String,
    pub message: String,
}

impl From<&ToolError> for CapturedError {
    fn from(e: &ToolError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Process(ProcessOutput),
    File(FileWritten),
    Http(HttpResponse),
    Error(CapturedError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tool: ToolKind,
    pub description: String,
    pub args: serde_json::Value,
    pub payload: Payload,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        match &self.payload {
            Payload::Process(out) => out.returncode == 0,
            Payload::File(_) => true,
            Payload::Http(resp) => resp.status < 400,
            Payload::Error(_) => false,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.payload {
            Payload::Process(out) if out.returncode != 0 => Some(if out.stderr.trim().is_empty() {
                format!("exit status {}", out.returncode)
            } else {
                out.stderr.clone()
            }),
            Payload::Http(resp) if resp.status >= 400 => Some(format!("http status {}", resp.status)),
            Payload::Error(e) => Some(e.message.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub index: usize,
    pub tool: ToolKind,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRun {
    pub run_id: String,
    pub intent: String,
    pub results: Vec<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<StepFailure>,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub work_root: PathBuf,
    pub log_dir: PathBuf,
    pub make_webhook_url: Option<String>,
    pub python_interpreter: String,
}

/// Dispatches validated tool calls against the shared `Policy` and audits every call.
pub struct ToolExecutor {
    policy: Arc<Policy>,
    work_root: PathBuf,
    make_webhook_url: Option<String>,
    python_interpreter: String,
    client: reqwest::Client,
    run_log: RunLog,
}

impl ToolExecutor {
    pub fn new(policy: Arc<Policy>, config: ExecutorConfig) -> Result<Self> {
        policy.validate()?;
        std::fs::create_dir_all(&config.work_root)?;
        std::fs::create_dir_all(&config.log_dir)?;
        let work_root = std::fs::canonicalize(&config.work_root)?;
        let policy = Arc::new(policy.as_ref().clone().with_canonical_roots());
        let client = http::build_client(policy.clone())?;
        let python_interpreter = match config.python_interpreter.trim() {
            "" => "python3".to_string(),
            other => other.to_string(),
        };
        Ok(Self {
            policy,
            work_root,
            make_webhook_url: config.make_webhook_url.filter(|u| !u.trim().is_empty()),
            python_interpreter,
            client,
            run_log: RunLog::new(config.log_dir),
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn log_dir(&self) -> &Path {
        self.run_log.dir()
    }

    /// Executes one step. Captured failures become an `Error` payload; fatal ones are returned.
    /// Either way one audit line is appended to the run log.
    #[tracing::instrument(level = "info", skip_all, fields(run_id = %run_id, tool = step.kind().as_str()))]
    pub async fn run(&self, step: &ToolCall, run_id: &str) -> Result<ExecutionResult> {
        let started = std::time::Instant::now();
        let outcome = match self.dispatch(&step.action).await {
            Ok(payload) => Ok(payload),
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "step failed; captured into result");
                Ok(Payload::Error(CapturedError::from(&e)))
            }
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "step rejected");
                Err(e)
            }
        };

        let audit = match &outcome {
            Ok(payload) => serde_json::to_value(payload)?,
            Err(e) => serde_json::json!({ "error": e.to_json() }),
        };
        if let Err(e) = self.run_log.append(run_id, &step.audit_json(), &audit).await {
            tracing::error!(error = %e, "failed to append run log");
        }

        outcome.map(|payload| ExecutionResult {
            tool: step.kind(),
            description: step.description.clone(),
            args: step.action.args_json(),
            payload,
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Runs steps in order, stopping at the first fatal error.
    #[tracing::instrument(level = "info", skip_all, fields(run_id = %run_id, steps = plan.steps.len()))]
    pub async fn run_plan(&self, plan: &Plan, run_id: &str) -> Result<PlanRun> {
        plan.validate()?;
        let mut results = Vec::with_capacity(plan.steps.len());
        let mut aborted = None;
        for (index, step) in plan.steps.iter().enumerate() {
            match self.run(step, run_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    aborted = Some(StepFailure {
                        index,
                        tool: step.kind(),
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
        let skipped = match &aborted {
            Some(failure) => plan.steps.len() - failure.index - 1,
            None => 0,
        };
        tracing::info!(executed = results.len(), skipped, "plan finished");
        Ok(PlanRun {
            run_id: run_id.to_string(),
            intent: plan.intent.clone(),
            results,
            aborted,
            skipped,
        })
    }

    async fn dispatch(&self, action: &ToolAction) -> Result<Payload> {
        match action {
            ToolAction::Shell(args) | ToolAction::Docker(args) => self.run_shell(args).await,
            ToolAction::Python(args) => self.run_python(&args.code).await,
            ToolAction::FileWrite(args) => {
                let path = filesystem::resolve_allowed(&self.policy, &self.work_root, &args.path)?;
                let written = filesystem::write_file(&path, &args.content, args.overwrite).await?;
                Ok(Payload::File(written))
            }
            ToolAction::HttpRequest(args) => {
                let response = http::send(&self.client, &self.policy, args).await?;
                Ok(Payload::Http(response))
            }
            ToolAction::MakeHook(args) => {
                let response = http::post_webhook(
                    &self.client,
                    self.make_webhook_url.as_deref(),
                    &args.payload,
                    self.policy.timeouts.http(),
                )
                .await?;
                Ok(Payload::Http(response))
            }
        }
    }

    async fn run_shell(&self, args: &ShellArgs) -> Result<Payload> {
        if !self.policy.shell_ok(&args.cmd) {
            return Err(ToolError::PolicyViolation(
                "command not allowed by policy.shell_allow".to_string(),
            ));
        }
        let cwd = match args.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(requested) => {
                let resolved = filesystem::resolve_allowed(&self.policy, &self.work_root, requested)?;
                if !resolved.is_dir() {
                    return Err(ToolError::InvalidArguments(format!(
                        "cwd is not a directory: {}",
                        resolved.display()
                    )));
                }
                resolved
            }
            None => self.work_root.clone(),
        };
        let output =
            shell::run_process(shell::shell_command(&args.cmd), &cwd, self.policy.timeouts.shell()).await?;
        Ok(Payload::Process(output))
    }

    async fn run_python(&self, code: &str) -> Result<Payload> {
        let script = self.work_root.join(format!("tmp_{}.py", ulid::Ulid::new()));
        if !self.policy.path_ok(&script) {
            return Err(ToolError::PolicyViolation(format!(
                "path not allowed by policy.paths_allow: {}",
                script.display()
            )));
        }
        tokio::fs::write(&script, code.as_bytes()).await?;
        let mut cmd = tokio::process::Command::new(&self.python_interpreter);
        cmd.arg(&script);
        let mut output = shell::run_process(cmd, &self.work_root, self.policy.timeouts.python()).await?;
        output.file = Some(script.display().to_string());
        Ok(Payload::Process(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::FileWriteArgs;

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: ToolExecutor,
    }

    fn fixture(shell_allow: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_root = dir.path().join("work");
        std::fs::create_dir_all(&work_root).unwrap();
        let policy = Policy {
            shell_allow: shell_allow.iter().map(|s| s.to_string()).collect(),
            paths_allow: vec![work_root.display().to_string()],
            ..Policy::default()
        };
        let executor = ToolExecutor::new(
            Arc::new(policy),
            ExecutorConfig {
                work_root,
                log_dir: dir.path().join("logs"),
                make_webhook_url: None,
                python_interpreter: "python3".to_string(),
            },
        )
        .unwrap();
        Fixture { _dir: dir, executor }
    }

    fn plan(value: serde_json::Value) -> Plan {
        Plan::from_json(value).unwrap()
    }

    fn log_lines(executor: &ToolExecutor, run_id: &str) -> Vec<serde_json::Value> {
        let text = std::fs::read_to_string(executor.log_dir().join(format!("{run_id}.log"))).unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn allowed_command_plan_writes_run_log_line() {
        let fx = fixture(&["echo", "dir"]);
        let run_id = "run_e2e";
        let run = fx
            .executor
            .run_plan(
                &plan(serde_json::json!({
                    "intent": "list the work dir",
                    "steps": [{ "tool": "shell", "args": { "cmd": "echo listing" }, "description": "list" }]
                })),
                run_id,
            )
            .await
            .unwrap();
        assert!(run.aborted.is_none());
        let Payload::Process(out) = &run.results[0].payload else {
            panic!("expected process payload");
        };
        assert_eq!(out.returncode, 0);

        let lines = log_lines(&fx.executor, run_id);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["step"]["tool"], "shell");
        assert_eq!(lines[0]["result"]["returncode"], 0);
        assert_eq!(run.results[0].run_id, run_id);
    }

    #[tokio::test]
    async fn disallowed_command_aborts_plan_and_is_audited() {
        let fx = fixture(&["echo"]);
        let run_id = "run_abort";
        let run = fx
            .executor
            .run_plan(
                &plan(serde_json::json!({
                    "intent": "mixed",
                    "steps": [
                        { "tool": "file_write", "args": { "path": "a.txt", "content": "x" } },
                        { "tool": "shell", "args": { "cmd": "rm -rf /" } },
                        { "tool": "file_write", "args": { "path": "b.txt", "content": "y" } }
                    ]
                })),
                run_id,
            )
            .await
            .unwrap();
        assert_eq!(run.results.len(), 1);
        let aborted = run.aborted.unwrap();
        assert_eq!(aborted.index, 1);
        assert_eq!(aborted.kind, "policy_violation");
        assert_eq!(run.skipped, 1);
        assert!(!fx.executor.work_root().join("b.txt").exists());

        let lines = log_lines(&fx.executor, run_id);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["result"]["error"]["kind"], "policy_violation");
    }

    #[tokio::test]
    async fn file_write_traversal_is_rejected() {
        let fx = fixture(&[]);
        let step = ToolCall::new(
            ToolAction::FileWrite(FileWriteArgs {
                path: "../escape.txt".to_string(),
                content: "nope".to_string(),
                overwrite: true,
            }),
            "escape",
        );
        let err = fx.executor.run(&step, "run_fs").await.unwrap_err();
        assert_eq!(err.kind(), "policy_violation");
    }

    #[tokio::test]
    async fn shell_cwd_outside_work_root_is_rejected() {
        let fx = fixture(&["echo"]);
        let step = ToolCall::new(
            ToolAction::Shell(ShellArgs {
                cmd: "echo hi".to_string(),
                cwd: Some("/".to_string()),
            }),
            "",
        );
        let err = fx.executor.run(&step, "run_cwd").await.unwrap_err();
        assert_eq!(err.kind(), "policy_violation");
    }

    #[tokio::test]
    async fn missing_webhook_aborts_with_precondition_failed() {
        let fx = fixture(&[]);
        let step = ToolCall::from_op("make_hook", serde_json::json!({ "payload": { "a": 1 } })).unwrap();
        let err = fx.executor.run(&step, "run_hook").await.unwrap_err();
        assert_eq!(err.kind(), "precondition_failed");
    }

    #[tokio::test]
    async fn spawn_failure_is_captured_and_plan_continues() {
        let dir = tempfile::tempdir().unwrap();
        let work_root = dir.path().join("work");
        let executor = ToolExecutor::new(
            Arc::new(Policy {
                paths_allow: vec![work_root.display().to_string()],
                ..Policy::default()
            }),
            ExecutorConfig {
                work_root,
                log_dir: dir.path().join("logs"),
                make_webhook_url: None,
                python_interpreter: "definitely-not-a-python-binary".to_string(),
            },
        )
        .unwrap();
        let run = executor
            .run_plan(
                &plan(serde_json::json!({
                    "intent": "python then write",
                    "steps": [
                        { "tool": "python", "args": { "code": "print(1)" } },
                        { "tool": "file_write", "args": { "path": "after.txt", "content": "ok" } }
                    ]
                })),
                "run_spawn",
            )
            .await
            .unwrap();
        assert!(run.aborted.is_none());
        assert_eq!(run.results.len(), 2);
        assert!(matches!(run.results[0].payload, Payload::Error(_)));
        assert!(!run.results[0].succeeded());
        assert!(run.results[1].succeeded());
    }
}
