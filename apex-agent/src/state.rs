use crate::error::Result;

/// Persisted string key/value state shared by the safety controller, the self-modifier and the
/// orchestration loop.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

pub mod keys {
    pub const AGENT_ENABLED: &str = "agent_enabled";
    pub const MODIFICATIONS_ENABLED: &str = "modifications_enabled";
    pub const SANDBOX_MODE: &str = "sandbox_mode";
    pub const REQUIRE_APPROVAL: &str = "require_approval";
    pub const GIT_INTEGRATION: &str = "git_integration";
    pub const MAX_MODIFICATIONS_PER_DAY: &str = "max_modifications_per_day";
    pub const MODIFICATIONS_TODAY: &str = "modifications_today";
    pub const LAST_MODIFICATION_DATE: &str = "last_modification_date";
    pub const CURRENT_OPPORTUNITIES: &str = "current_opportunities";
}
