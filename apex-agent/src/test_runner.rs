use crate::codegen::GeneratedTest;
use apex_tools::shell;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub errors: String,
}

impl TestOutcome {
    pub fn skipped(reason: &str) -> Self {
        Self {
            status: TestStatus::Skipped,
            returncode: None,
            output: reason.to_string(),
            errors: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Error,
            returncode: None,
            output: String::new(),
            errors: message.into(),
        }
    }

    pub fn blocks_apply(&self) -> bool {
        matches!(self.status, TestStatus::Failed | TestStatus::Error)
    }
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, candidate: &str, test: &GeneratedTest) -> TestOutcome;
}

/// Runs Python test scripts in a throwaway directory with a hard timeout.
#[derive(Debug, Clone)]
pub struct ScriptTestRunner {
    interpreter: String,
    timeout: Duration,
}

impl ScriptTestRunner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TestRunner for ScriptTestRunner {
    #[tracing::instrument(level = "info", skip_all, fields(language = test.language.as_str()))]
    async fn run(&self, candidate: &str, test: &GeneratedTest) -> TestOutcome {
        if test.language != crate::codegen::Language::Python {
            return TestOutcome::skipped("no runner for language");
        }
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return TestOutcome::error(format!("failed to create test dir: {e}")),
        };
        let script = dir.path().join("test_candidate.py");
        let written = async {
            tokio::fs::write(dir.path().join(&test.candidate_file), candidate).await?;
            tokio::fs::write(&script, &test.code).await
        }
        .await;
        if let Err(e) = written {
            return TestOutcome::error(format!("failed to write test files: {e}"));
        }

        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg(&script);
        match shell::run_process(cmd, dir.path(), self.timeout).await {
            Ok(out) => TestOutcome {
                status: if out.returncode == 0 {
                    TestStatus::Passed
                } else {
                    TestStatus::Failed
                },
                returncode: Some(out.returncode),
                output: out.stdout,
                errors: out.stderr,
            },
            Err(e) => {
                tracing::warn!(error = %e, "test execution failed");
                TestOutcome::error(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Language;

    #[tokio::test]
    async fn missing_interpreter_is_an_error_that_blocks() {
        let runner = ScriptTestRunner::new("definitely-not-python", Duration::from_secs(5));
        let outcome = runner
            .run(
                "x = 1\n",
                &GeneratedTest {
                    language: Language::Python,
                    candidate_file: "candidate.py".to_string(),
                    code: "print(1)\n".to_string(),
                },
            )
            .await;
        assert_eq!(outcome.status, TestStatus::Error);
        assert!(outcome.blocks_apply());
    }

    #[tokio::test]
    async fn non_python_tests_are_skipped() {
        let runner = ScriptTestRunner::new("python3", Duration::from_secs(5));
        let outcome = runner
            .run(
                "fn main() {}",
                &GeneratedTest {
                    language: Language::Rust,
                    candidate_file: "candidate.rs".to_string(),
                    code: String::new(),
                },
            )
            .await;
        assert_eq!(outcome.status, TestStatus::Skipped);
        assert!(!outcome.blocks_apply());
    }
}
