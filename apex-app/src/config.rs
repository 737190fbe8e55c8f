//! Apex configuration loader.
//!
//! `~/.apex/config.toml` (or `--config`) is parsed with serde, then environment overrides are
//! applied, then the result is validated. A missing default file falls back to built-in defaults.

use apex_tools::Policy;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const SHARED_KEY_MIN_CHARS: usize = 32;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApexConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub integrations: IntegrationsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// HMAC key for signed routes. Usually supplied via `APEX_SHARED_KEY`.
    #[serde(default)]
    pub shared_key: Option<String>,
    /// Serves `POST /auth/echo-sign`, which signs arbitrary bodies with the server key.
    #[serde(default)]
    pub echo_sign_enabled: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            max_body_bytes: default_max_body_bytes(),
            shared_key: None,
            echo_sign_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Root that self-modification targets must resolve inside.
    #[serde(default = "default_source_root")]
    pub source_root: String,
}

fn default_work_dir() -> String {
    "~/.apex/work".to_string()
}

fn default_log_dir() -> String {
    "~/.apex/logs".to_string()
}

fn default_data_dir() -> String {
    "~/.apex/data".to_string()
}

fn default_source_root() -> String {
    ".".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            log_dir: default_log_dir(),
            data_dir: default_data_dir(),
            source_root: default_source_root(),
        }
    }
}

impl PathsConfig {
    pub fn work_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.work_dir)
    }

    pub fn log_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.log_dir)
    }

    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.data_dir)
    }

    pub fn source_root_path(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.source_root)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntegrationsConfig {
    #[serde(default)]
    pub make_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_loop_interval_seconds")]
    pub loop_interval_seconds: u64,
    #[serde(default = "default_python_interpreter")]
    pub python_interpreter: String,
    #[serde(default = "default_test_timeout_seconds")]
    pub test_timeout_seconds: u64,
    #[serde(default)]
    pub auto_kill_on_critical: bool,
    /// Relative paths are resolved under `paths.data_dir`.
    #[serde(default = "default_kill_switch_file")]
    pub kill_switch_file: String,
}

fn default_loop_interval_seconds() -> u64 {
    apex_agent::DEFAULT_LOOP_INTERVAL.as_secs()
}

fn default_python_interpreter() -> String {
    "python3".to_string()
}

fn default_test_timeout_seconds() -> u64 {
    60
}

fn default_kill_switch_file() -> String {
    "AGENT_KILL_SWITCH".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            loop_interval_seconds: default_loop_interval_seconds(),
            python_interpreter: default_python_interpreter(),
            test_timeout_seconds: default_test_timeout_seconds(),
            auto_kill_on_critical: false,
            kill_switch_file: default_kill_switch_file(),
        }
    }
}

impl ApexConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    /// Returns the config and the file it came from, if any.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let (mut cfg, source) = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => (Self::parse(&contents, &path)?, Some(path)),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults");
                (Self::default(), None)
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, source))
    }

    pub fn parse(contents: &str, path: &Path) -> anyhow::Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("APEX_SHARED_KEY") {
            self.server.shared_key = Some(v);
        }
        if let Some(v) = non_empty("APEX_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = non_empty("APEX_WORK_DIR") {
            self.paths.work_dir = v;
        }
        if let Some(v) = non_empty("APEX_LOG_DIR") {
            self.paths.log_dir = v;
        }
        if let Some(v) = non_empty("MAKE_WEBHOOK_URL") {
            self.integrations.make_webhook_url = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("server.max_body_bytes must be > 0"));
        }
        if self.agent.loop_interval_seconds == 0 {
            return Err(anyhow::anyhow!("agent.loop_interval_seconds must be > 0"));
        }
        if self.agent.test_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("agent.test_timeout_seconds must be > 0"));
        }
        if self.agent.kill_switch_file.trim().is_empty() {
            return Err(anyhow::anyhow!("agent.kill_switch_file must not be empty"));
        }
        self.policy
            .validate()
            .map_err(|e| anyhow::anyhow!("policy: {e}"))?;
        match self.shared_key() {
            None => tracing::warn!("APEX_SHARED_KEY is not set; signed routes will refuse requests"),
            Some(key) if key.chars().count() < SHARED_KEY_MIN_CHARS => tracing::warn!(
                min_chars = SHARED_KEY_MIN_CHARS,
                "APEX_SHARED_KEY is shorter than recommended"
            ),
            Some(_) => {}
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn shared_key(&self) -> Option<&str> {
        self.server
            .shared_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn kill_switch_path(&self) -> anyhow::Result<PathBuf> {
        let raw = expand_home(&self.agent.kill_switch_file)?;
        if raw.is_absolute() {
            return Ok(raw);
        }
        Ok(self.paths.data_dir_path()?.join(raw))
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".apex").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix("~/") else {
        return Ok(PathBuf::from(trimmed));
    };
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(rest))
}
