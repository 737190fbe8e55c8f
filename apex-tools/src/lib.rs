//! Policy-gated action execution for apex.
//!
//! A [`Plan`] is a bounded list of typed [`ToolCall`]s. The [`ToolExecutor`] checks each call
//! against the process-wide [`Policy`] before any side effect, runs it with a hard timeout and
//! appends one audit line per call to the run log.

pub mod error;
pub mod executor;
pub mod filesystem;
pub mod http;
pub mod plan;
pub mod policy;
pub mod run_log;
pub mod shell;

pub use error::{Result, ToolError};
pub use executor::{
    CapturedError, ExecutionResult, ExecutorConfig, Payload, PlanRun, StepFailure, ToolExecutor,
};
pub use filesystem::FileWritten;
pub use http::HttpResponse;
pub use plan::{
    FileWriteArgs, HttpRequestArgs, MakeHookArgs, Plan, PythonArgs, ShellArgs, ToolAction,
    ToolCall, ToolKind,
};
pub use policy::{NetworkPolicy, Policy, TimeoutPolicy};
pub use run_log::{RunLog, new_run_id};
pub use shell::ProcessOutput;
