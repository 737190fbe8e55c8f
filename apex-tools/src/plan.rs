//! Plan and tool-call model.
//!
//! The wire shape is `{tool, args, description}`; on parse each call is lifted into a closed
//! `ToolAction` union whose argument struct is validated up front, so nothing reaches the
//! executor with an unknown tool or malformed arguments.

use crate::error::{Result, ToolError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PLAN_STEPS_MIN: usize = 1;
pub const PLAN_STEPS_MAX: usize = 50;
pub const PLAN_INTENT_CHARS_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Shell,
    Python,
    FileWrite,
    HttpRequest,
    MakeHook,
    Docker,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::Shell,
        ToolKind::Python,
        ToolKind::FileWrite,
        ToolKind::HttpRequest,
        ToolKind::MakeHook,
        ToolKind::Docker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Python => "python",
            Self::FileWrite => "file_write",
            Self::HttpRequest => "http_request",
            Self::MakeHook => "make_hook",
            Self::Docker => "docker",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw.trim())
            .ok_or_else(|| {
                let names = Self::ALL.map(Self::as_str).join(", ");
                ToolError::InvalidArguments(format!("tool must be one of: {names}, got {raw:?}"))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellArgs {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PythonArgs {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileWriteArgs {
    #[serde(default = "default_file_write_path")]
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_file_write_path() -> String {
    "artifact.txt".to_string()
}

fn default_overwrite() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpRequestArgs {
    #[serde(default = "default_http_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MakeHookArgs {
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    Shell(ShellArgs),
    Docker(ShellArgs),
    Python(PythonArgs),
    FileWrite(FileWriteArgs),
    HttpRequest(HttpRequestArgs),
    MakeHook(MakeHookArgs),
}

impl ToolAction {
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Shell(_) => ToolKind::Shell,
            Self::Docker(_) => ToolKind::Docker,
            Self::Python(_) => ToolKind::Python,
            Self::FileWrite(_) => ToolKind::FileWrite,
            Self::HttpRequest(_) => ToolKind::HttpRequest,
            Self::MakeHook(_) => ToolKind::MakeHook,
        }
    }

    pub fn parse(kind: ToolKind, args: serde_json::Value) -> Result<Self> {
        let args = match args {
            serde_json::Value::Null => empty_object(),
            other => other,
        };
        let action = match kind {
            ToolKind::Shell => Self::Shell(parse_args(kind, args)?),
            ToolKind::Docker => Self::Docker(parse_args(kind, args)?),
            ToolKind::Python => Self::Python(parse_args(kind, args)?),
            ToolKind::FileWrite => Self::FileWrite(parse_args(kind, args)?),
            ToolKind::HttpRequest => Self::HttpRequest(parse_args(kind, args)?),
            ToolKind::MakeHook => Self::MakeHook(parse_args(kind, args)?),
        };
        action.validate()?;
        Ok(action)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Shell(args) | Self::Docker(args) => {
                if args.cmd.trim().is_empty() {
                    return Err(ToolError::InvalidArguments("cmd must not be empty".to_string()));
                }
            }
            Self::Python(args) => {
                if args.code.trim().is_empty() {
                    return Err(ToolError::InvalidArguments("code must not be empty".to_string()));
                }
            }
            Self::FileWrite(args) => {
                if args.path.trim().is_empty() {
                    return Err(ToolError::InvalidArguments("path must not be empty".to_string()));
                }
            }
            Self::HttpRequest(args) => {
                if args.url.trim().is_empty() {
                    return Err(ToolError::InvalidArguments("url must not be empty".to_string()));
                }
            }
            Self::MakeHook(_) => {}
        }
        Ok(())
    }

    pub fn args_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Shell(args) | Self::Docker(args) => serde_json::to_value(args),
            Self::Python(args) => serde_json::to_value(args),
            Self::FileWrite(args) => serde_json::to_value(args),
            Self::HttpRequest(args) => serde_json::to_value(args),
            Self::MakeHook(args) => serde_json::to_value(args),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(kind: ToolKind, args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| {
        ToolError::InvalidArguments(format!("invalid args for tool {}: {e}", kind.as_str()))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawToolCall", into = "RawToolCall")]
pub struct ToolCall {
    pub action: ToolAction,
    pub description: String,
}

impl ToolCall {
    pub fn new(action: ToolAction, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ToolKind {
        self.action.kind()
    }

    /// Maps a direct `{op, params}` request onto a single call. Only a subset of tools is
    /// reachable this way.
    pub fn from_op(op: &str, params: serde_json::Value) -> Result<Self> {
        let kind = match op.trim() {
            "file_write" => ToolKind::FileWrite,
            "shell" => ToolKind::Shell,
            "python" => ToolKind::Python,
            "make_hook" => ToolKind::MakeHook,
            other => {
                return Err(ToolError::InvalidArguments(format!("unknown op: {other:?}")));
            }
        };
        Ok(Self {
            action: ToolAction::parse(kind, params)?,
            description: String::new(),
        })
    }

    /// Wire-shaped summary used in audit records.
    pub fn audit_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tool": self.kind().as_str(),
            "description": self.description,
            "args": self.action.args_json(),
        })
    }
}

impl TryFrom<RawToolCall> for ToolCall {
    type Error = ToolError;

    fn try_from(raw: RawToolCall) -> Result<Self> {
        let kind = ToolKind::parse(&raw.tool)?;
        Ok(Self {
            action: ToolAction::parse(kind, raw.args)?,
            description: raw.description,
        })
    }
}

impl From<ToolCall> for RawToolCall {
    fn from(call: ToolCall) -> Self {
        Self {
            tool: call.kind().as_str().to_string(),
            args: call.action.args_json(),
            description: call.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub intent: String,
    pub steps: Vec<ToolCall>,
}

impl Plan {
    /// Parses and validates a plan. Errors are always `InvalidArguments`.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let plan: Plan = serde_json::from_value(value)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid plan: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        let intent_chars = self.intent.trim().chars().count();
        if intent_chars == 0 {
            return Err(ToolError::InvalidArguments("intent must not be empty".to_string()));
        }
        if intent_chars > PLAN_INTENT_CHARS_MAX {
            return Err(ToolError::InvalidArguments(format!(
                "intent exceeds {PLAN_INTENT_CHARS_MAX} characters"
            )));
        }
        if !(PLAN_STEPS_MIN..=PLAN_STEPS_MAX).contains(&self.steps.len()) {
            return Err(ToolError::InvalidArguments(format!(
                "plan must have between {PLAN_STEPS_MIN} and {PLAN_STEPS_MAX} steps, got {}",
                self.steps.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_parses_into_typed_action() {
        let call: ToolCall = serde_json::from_value(json!({
            "tool": "shell",
            "args": { "cmd": "dir" },
            "description": "list files"
        }))
        .expect("parse call");
        assert_eq!(
            call.action,
            ToolAction::Shell(ShellArgs {
                cmd: "dir".to_string(),
                cwd: None
            })
        );
        assert_eq!(call.description, "list files");
    }

    #[test]
    fn unknown_tool_is_rejected_at_parse_time() {
        let err = serde_json::from_value::<ToolCall>(json!({
            "tool": "powershell",
            "args": { "cmd": "dir" }
        }))
        .expect_err("unknown tool must fail");
        assert!(err.to_string().contains("tool must be one of"));
    }

    #[test]
    fn unknown_argument_fields_are_rejected() {
        let err = serde_json::from_value::<ToolCall>(json!({
            "tool": "python",
            "args": { "code": "print(1)", "sudo": true }
        }))
        .expect_err("unknown field must fail");
        assert!(err.to_string().contains("invalid args for tool python"));
    }

    #[test]
    fn file_write_defaults_match_wire_contract() {
        let call: ToolCall = serde_json::from_value(json!({ "tool": "file_write" }))
            .expect("parse file_write with defaults");
        let ToolAction::FileWrite(args) = call.action else {
            panic!("expected file_write action");
        };
        assert_eq!(args.path, "artifact.txt");
        assert!(args.overwrite);
        assert!(args.content.is_empty());
    }

    #[test]
    fn serialization_round_trips_through_wire_shape() {
        let call = ToolCall::new(
            ToolAction::HttpRequest(HttpRequestArgs {
                method: "POST".to_string(),
                url: "https://api.github.com/x".to_string(),
                headers: BTreeMap::new(),
                body: Some(json!({ "a": 1 })),
            }),
            "call api",
        );
        let wire = serde_json::to_value(&call).expect("serialize");
        assert_eq!(wire["tool"], "http_request");
        assert_eq!(wire["args"]["method"], "POST");
        let back: ToolCall = serde_json::from_value(wire).expect("deserialize");
        assert_eq!(back, call);
    }

    #[test]
    fn direct_ops_map_to_a_subset_of_tools() {
        let call = ToolCall::from_op("shell", json!({ "cmd": "git status" })).unwrap();
        assert_eq!(call.kind(), ToolKind::Shell);
        assert!(ToolCall::from_op("http_request", json!({ "url": "https://x" })).is_err());
        assert!(ToolCall::from_op("docker", json!({ "cmd": "docker ps" })).is_err());
    }

    #[test]
    fn plan_step_bounds_are_enforced() {
        let empty = Plan::from_json(json!({ "intent": "nothing", "steps": [] }));
        assert!(empty.is_err());

        let step = json!({ "tool": "shell", "args": { "cmd": "dir" } });
        let too_many = Plan::from_json(json!({
            "intent": "many",
            "steps": vec![step.clone(); PLAN_STEPS_MAX + 1]
        }));
        assert!(too_many.is_err());

        let max = Plan::from_json(json!({
            "intent": "many",
            "steps": vec![step; PLAN_STEPS_MAX]
        }))
        .expect("fifty steps are allowed");
        assert_eq!(max.steps.len(), PLAN_STEPS_MAX);
    }

    #[test]
    fn plan_requires_intent() {
        let err = Plan::from_json(json!({
            "intent": "  ",
            "steps": [{ "tool": "shell", "args": { "cmd": "dir" } }]
        }))
        .expect_err("blank intent must fail");
        assert!(err.to_string().contains("intent"));
    }
}
