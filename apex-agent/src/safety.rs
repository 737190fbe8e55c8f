//! Safety flags, kill switch, dangerous-operation scanner and incident log.
//!
//! Flags resolve env > persisted > default at construction and every mutation is persisted.
//! The kill switch lives behind a [`DurableFlag`] and is re-checked on every query, so an
//! operator can halt the agent by creating the flag file by hand.

use crate::error::{AgentError, Result};
use crate::flag::DurableFlag;
use crate::memory::Memory;
use crate::state::{StateStore, keys};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DANGEROUS_PATTERNS: [&str; 9] = [
    "rm -rf",
    "del /f /s",
    "format",
    "dd if=",
    "shutdown",
    "reboot",
    "> /dev/sda",
    "mkfs",
    ":(){",
];

pub const PROTECTED_PATHS: [&str; 6] = [
    "/etc",
    "/sys",
    "/proc",
    "/boot",
    "C:\\Windows",
    "C:\\Program Files",
];

pub const MAX_MODIFICATIONS_PER_DAY_LIMIT: u32 = 100;
const ERROR_RATE_WINDOW: usize = 100;
const ERROR_RATE_MAX: f64 = 0.30;
const MODIFICATION_SUCCESS_MIN: f64 = 0.70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyIncident {
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(rename = "type")]
    pub incident_type: String,
    pub description: String,
    pub severity: Severity,
}

/// Environment overrides, named `AGENT_<KEY>`.
#[derive(Debug, Clone, Default)]
pub struct SafetyOverrides {
    pub agent_enabled: Option<bool>,
    pub modifications_enabled: Option<bool>,
    pub sandbox_mode: Option<bool>,
    pub require_approval: Option<bool>,
    pub git_integration: Option<bool>,
    pub max_modifications_per_day: Option<u32>,
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_key(key: &str) -> String {
    format!("AGENT_{}", key.to_ascii_uppercase())
}

impl SafetyOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            let name = env_key(key);
            let raw = lookup(&name)?;
            let parsed = parse_bool(&raw);
            if parsed.is_none() {
                tracing::warn!(name = %name, value = %raw, "ignoring non-boolean safety override");
            }
            parsed
        };
        Self {
            agent_enabled: flag(keys::AGENT_ENABLED),
            modifications_enabled: flag(keys::MODIFICATIONS_ENABLED),
            sandbox_mode: flag(keys::SANDBOX_MODE),
            require_approval: flag(keys::REQUIRE_APPROVAL),
            git_integration: flag(keys::GIT_INTEGRATION),
            max_modifications_per_day: lookup(&env_key(keys::MAX_MODIFICATIONS_PER_DAY))
                .and_then(|raw| raw.trim().parse().ok()),
        }
    }
}

#[derive(Clone, Default)]
pub struct SafetySecrets {
    pub agent_enable_password: Option<String>,
    pub modifications_enable_password: Option<String>,
    pub kill_switch_password: Option<String>,
}

impl std::fmt::Debug for SafetySecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetySecrets")
            .field("agent_enable_password", &self.agent_enable_password.is_some())
            .field("modifications_enable_password", &self.modifications_enable_password.is_some())
            .field("kill_switch_password", &self.kill_switch_password.is_some())
            .finish()
    }
}

impl SafetySecrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secret = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            agent_enable_password: secret("AGENT_ENABLE_PASSWORD"),
            modifications_enable_password: secret("MODIFICATIONS_ENABLE_PASSWORD"),
            kill_switch_password: secret("KILL_SWITCH_PASSWORD"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub incident_log: PathBuf,
    pub auto_kill_on_critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SafetyFlags {
    agent_enabled: bool,
    modifications_enabled: bool,
    sandbox_mode: bool,
    require_approval: bool,
    git_integration: bool,
    max_modifications_per_day: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyChecks {
    pub agent_enabled: bool,
    pub modifications_enabled: bool,
    pub kill_switch_active: bool,
    pub sandbox_mode: bool,
    pub require_approval: bool,
    pub error_rate: f64,
    pub error_rate_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_rate_ok: Option<bool>,
}

impl SafetyChecks {
    pub fn ok(&self) -> bool {
        self.agent_enabled
            && !self.kill_switch_active
            && self.error_rate_ok
            && self.modification_rate_ok.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub agent_enabled: bool,
    pub modifications_enabled: bool,
    pub kill_switch_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_switch_details: Option<String>,
    pub sandbox_mode: bool,
    pub require_approval: bool,
    pub max_modifications_per_day: u32,
    pub git_integration: bool,
    pub safety_checks: SafetyChecks,
}

pub struct SafetyController {
    state: Arc<dyn StateStore>,
    memory: Arc<dyn Memory>,
    kill_switch: Arc<dyn DurableFlag>,
    secrets: SafetySecrets,
    config: SafetyConfig,
    flags: Mutex<SafetyFlags>,
}

/// Compares digests so the running time does not depend on where the inputs differ.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn check_secret(required: Option<&str>, provided: Option<&str>, action: &str) -> Result<()> {
    let Some(required) = required else {
        return Ok(());
    };
    if provided.is_some_and(|p| secrets_match(p, required)) {
        return Ok(());
    }
    tracing::error!(action, "invalid password");
    Err(AgentError::PermissionDenied(format!("invalid password for {action}")))
}

impl SafetyController {
    pub fn new(
        state: Arc<dyn StateStore>,
        memory: Arc<dyn Memory>,
        kill_switch: Arc<dyn DurableFlag>,
        overrides: SafetyOverrides,
        secrets: SafetySecrets,
        config: SafetyConfig,
    ) -> Result<Self> {
        let persisted_bool = |key: &str| -> Result<Option<bool>> {
            Ok(state.get(key)?.as_deref().and_then(parse_bool))
        };
        let mut flags = SafetyFlags {
            agent_enabled: overrides
                .agent_enabled
                .or(persisted_bool(keys::AGENT_ENABLED)?)
                .unwrap_or(false),
            modifications_enabled: overrides
                .modifications_enabled
                .or(persisted_bool(keys::MODIFICATIONS_ENABLED)?)
                .unwrap_or(false),
            sandbox_mode: overrides
                .sandbox_mode
                .or(persisted_bool(keys::SANDBOX_MODE)?)
                .unwrap_or(true),
            require_approval: overrides
                .require_approval
                .or(persisted_bool(keys::REQUIRE_APPROVAL)?)
                .unwrap_or(true),
            git_integration: overrides
                .git_integration
                .or(persisted_bool(keys::GIT_INTEGRATION)?)
                .unwrap_or(true),
            max_modifications_per_day: overrides
                .max_modifications_per_day
                .or(state
                    .get(keys::MAX_MODIFICATIONS_PER_DAY)?
                    .and_then(|v| v.trim().parse().ok()))
                .unwrap_or(5)
                .min(MAX_MODIFICATIONS_PER_DAY_LIMIT),
        };

        if kill_switch.is_set() {
            tracing::error!("kill switch present at startup; agent and modifications forced off");
            flags.agent_enabled = false;
            flags.modifications_enabled = false;
            state.set(keys::AGENT_ENABLED, "false")?;
            state.set(keys::MODIFICATIONS_ENABLED, "false")?;
        }

        tracing::info!(
            agent_enabled = flags.agent_enabled,
            modifications_enabled = flags.modifications_enabled,
            sandbox_mode = flags.sandbox_mode,
            max_modifications_per_day = flags.max_modifications_per_day,
            "safety controller initialized"
        );
        Ok(Self {
            state,
            memory,
            kill_switch,
            secrets,
            config,
            flags: Mutex::new(flags),
        })
    }

    fn flags(&self) -> Result<MutexGuard<'_, SafetyFlags>> {
        self.flags
            .lock()
            .map_err(|_| AgentError::Internal("safety flags lock poisoned".to_string()))
    }

    fn snapshot(&self) -> Option<SafetyFlags> {
        self.flags.lock().ok().map(|f| f.clone())
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.is_set()
    }

    /// Re-reads the kill switch on every call. Fails closed.
    pub fn is_enabled(&self) -> bool {
        if self.kill_switch.is_set() {
            return false;
        }
        self.snapshot().is_some_and(|f| f.agent_enabled)
    }

    pub fn modifications_enabled_check(&self) -> bool {
        self.is_enabled()
            && !self.kill_switch.is_set()
            && self.snapshot().is_some_and(|f| f.modifications_enabled)
    }

    pub fn max_modifications_per_day(&self) -> u32 {
        self.snapshot().map_or(0, |f| f.max_modifications_per_day)
    }

    pub fn git_integration_enabled(&self) -> bool {
        self.snapshot().is_some_and(|f| f.git_integration)
    }

    pub fn approval_required(&self) -> bool {
        self.snapshot().is_none_or(|f| f.require_approval)
    }

    pub fn is_sandbox_mode(&self) -> bool {
        self.snapshot().is_none_or(|f| f.sandbox_mode)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn enable_agent(&self, password: Option<&str>) -> Result<()> {
        check_secret(self.secrets.agent_enable_password.as_deref(), password, "agent enable")?;
        let mut flags = self.flags()?;
        self.state.set(keys::AGENT_ENABLED, "true")?;
        flags.agent_enabled = true;
        if self.kill_switch.is_set() {
            tracing::warn!("agent enabled while kill switch is active; it stays halted");
        }
        tracing::warn!("autonomous agent enabled");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn disable_agent(&self) -> Result<()> {
        let mut flags = self.flags()?;
        self.state.set(keys::AGENT_ENABLED, "false")?;
        flags.agent_enabled = false;
        tracing::info!("autonomous agent disabled");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn enable_modifications(&self, password: Option<&str>) -> Result<()> {
        check_secret(
            self.secrets.modifications_enable_password.as_deref(),
            password,
            "modifications enable",
        )?;
        let mut flags = self.flags()?;
        self.state.set(keys::MODIFICATIONS_ENABLED, "true")?;
        flags.modifications_enabled = true;
        tracing::warn!("code modifications enabled");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn disable_modifications(&self) -> Result<()> {
        let mut flags = self.flags()?;
        self.state.set(keys::MODIFICATIONS_ENABLED, "false")?;
        flags.modifications_enabled = false;
        tracing::info!("code modifications disabled");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn activate_kill_switch(&self, reason: &str) -> Result<()> {
        let mut flags = self.flags()?;
        self.kill_switch.set(&format!(
            "KILL SWITCH ACTIVATED\nTimestamp: {}\nReason: {}\n",
            Utc::now().to_rfc3339(),
            reason
        ))?;
        flags.agent_enabled = false;
        flags.modifications_enabled = false;
        self.state.set(keys::AGENT_ENABLED, "false")?;
        self.state.set(keys::MODIFICATIONS_ENABLED, "false")?;
        tracing::error!(reason, "kill switch activated; all autonomous operations halted");
        Ok(())
    }

    /// Removes the kill switch. The agent stays disabled until enabled again.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn deactivate_kill_switch(&self, password: Option<&str>) -> Result<()> {
        check_secret(
            self.secrets.kill_switch_password.as_deref(),
            password,
            "kill switch deactivation",
        )?;
        let _flags = self.flags()?;
        self.kill_switch.clear()?;
        tracing::warn!("kill switch deactivated");
        Ok(())
    }

    pub fn set_max_modifications_per_day(&self, max: i64) -> Result<()> {
        let max = u32::try_from(max)
            .ok()
            .filter(|m| *m <= MAX_MODIFICATIONS_PER_DAY_LIMIT)
            .ok_or_else(|| {
                AgentError::InvalidArguments(format!(
                    "max modifications per day must be within 0..={MAX_MODIFICATIONS_PER_DAY_LIMIT}, got {max}"
                ))
            })?;
        let mut flags = self.flags()?;
        self.state.set(keys::MAX_MODIFICATIONS_PER_DAY, &max.to_string())?;
        flags.max_modifications_per_day = max;
        tracing::info!(max, "max modifications per day updated");
        Ok(())
    }

    /// Scans an operation before it runs. Returns `(allowed, reason)`.
    pub fn validate_operation(&self, operation: &str, params: &serde_json::Value) -> (bool, String) {
        match operation {
            "shell" | "docker" => {
                let cmd = params
                    .get("cmd")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_lowercase();
                if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| cmd.contains(*p)) {
                    tracing::error!(pattern, "blocked dangerous command");
                    return (false, format!("Dangerous pattern detected: {pattern}"));
                }
            }
            "file_write" => {
                let path = params
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_lowercase();
                if let Some(protected) = PROTECTED_PATHS
                    .iter()
                    .find(|p| path.contains(&p.to_lowercase()))
                {
                    tracing::error!(path = %path, "blocked write to protected path");
                    return (false, format!("Protected path: {protected}"));
                }
            }
            _ => {}
        }
        if !self.is_enabled() {
            return (false, "Agent is disabled".to_string());
        }
        (true, "Operation validated".to_string())
    }

    /// Aggregated checks. Any read failure counts against the check.
    pub fn check_safety_limits(&self) -> SafetyChecks {
        let kill_switch_active = self.kill_switch.is_set();
        let error_rate = match self.memory.get_execution_history(ERROR_RATE_WINDOW, None) {
            Ok(history) if history.is_empty() => Some(0.0),
            Ok(history) => {
                Some(history.iter().filter(|e| !e.success).count() as f64 / history.len() as f64)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read execution history for safety check");
                None
            }
        };
        let (modification_success_rate, modification_rate_ok) = match self.memory.get_statistics() {
            Ok(stats) if stats.total_modifications > 0 => {
                let rate = stats.applied_modifications as f64 / stats.total_modifications as f64;
                (Some(rate), Some(rate > MODIFICATION_SUCCESS_MIN))
            }
            Ok(_) => (None, None),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read statistics for safety check");
                (None, Some(false))
            }
        };
        let flags = self.snapshot();
        SafetyChecks {
            agent_enabled: self.is_enabled(),
            modifications_enabled: self.modifications_enabled_check(),
            kill_switch_active,
            sandbox_mode: flags.as_ref().is_none_or(|f| f.sandbox_mode),
            require_approval: flags.as_ref().is_none_or(|f| f.require_approval),
            error_rate: error_rate.unwrap_or(1.0),
            error_rate_ok: error_rate.is_some_and(|r| r < ERROR_RATE_MAX),
            modification_success_rate,
            modification_rate_ok,
        }
    }

    pub fn record_safety_incident(
        &self,
        incident_type: &str,
        description: &str,
        severity: Severity,
    ) -> Result<SafetyIncident> {
        let incident = SafetyIncident {
            timestamp: Utc::now(),
            incident_type: incident_type.to_string(),
            description: description.to_string(),
            severity,
        };
        if let Some(parent) = self.config.incident_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.incident_log)?;
        writeln!(
            file,
            "{} [{}] {}: {}",
            incident.timestamp.to_rfc3339(),
            severity.as_str().to_uppercase(),
            incident_type,
            description
        )?;
        tracing::error!(incident_type, severity = severity.as_str(), description, "safety incident");

        if severity == Severity::Critical {
            if self.config.auto_kill_on_critical {
                self.activate_kill_switch(&format!("critical incident: {incident_type}"))?;
            } else {
                tracing::error!("critical safety incident; consider activating the kill switch");
            }
        }
        Ok(incident)
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub fn emergency_shutdown(&self, reason: &str) -> Result<()> {
        tracing::error!(reason, "emergency shutdown");
        self.activate_kill_switch(reason)?;
        self.disable_agent()?;
        self.disable_modifications()?;
        self.record_safety_incident("emergency_shutdown", reason, Severity::Critical)?;
        Ok(())
    }

    pub fn status(&self) -> SafetyStatus {
        let flags = self.snapshot();
        let kill_switch_active = self.kill_switch.is_set();
        SafetyStatus {
            agent_enabled: self.is_enabled(),
            modifications_enabled: self.modifications_enabled_check(),
            kill_switch_active,
            kill_switch_details: if kill_switch_active {
                self.kill_switch.details()
            } else {
                None
            },
            sandbox_mode: flags.as_ref().is_none_or(|f| f.sandbox_mode),
            require_approval: flags.as_ref().is_none_or(|f| f.require_approval),
            max_modifications_per_day: flags.as_ref().map_or(0, |f| f.max_modifications_per_day),
            git_integration: flags.as_ref().is_some_and(|f| f.git_integration),
            safety_checks: self.check_safety_limits(),
        }
    }
}
