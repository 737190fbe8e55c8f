//! Propose/apply/rollback pipeline for changes to the service's own source files.
//!
//! A proposal is computed and persisted without touching the target. Applying it re-checks the
//! safety gate and the live file hash, runs the generated test, then swaps the file in atomically.
//! Every failure after the write starts restores the backup.

use crate::clock::Clock;
use crate::codegen::{CodeGenerator, GeneratedTest, Language, OptimizationKind, QualityReport};
use crate::error::{AgentError, Result};
use crate::memory::{Memory, ModificationRecord};
use crate::safety::SafetyController;
use crate::state::{StateStore, keys};
use crate::test_runner::{TestOutcome, TestRunner};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationType {
    Optimize,
    AddFeature,
    FixBug,
    Refactor,
}

impl ModificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimize => "optimize",
            Self::AddFeature => "add_feature",
            Self::FixBug => "fix_bug",
            Self::Refactor => "refactor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    PendingApproval,
    Applied,
    Blocked,
    TestFailed,
    Error,
    RolledBack,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Applied => "applied",
            Self::Blocked => "blocked",
            Self::TestFailed => "test_failed",
            Self::Error => "error",
            Self::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationProposal {
    pub id: String,
    pub target_file: String,
    pub modification_type: ModificationType,
    pub description: String,
    pub reason: String,
    pub current_code_hash: String,
    pub modified_code_hash: String,
    pub modified_code: String,
    pub backup_path: String,
    pub validation: QualityReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_code: Option<GeneratedTest>,
    pub created_at: DateTime<Utc>,
    pub status: ProposalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub target_file: String,
    pub modification_type: ModificationType,
    pub description: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalPreview {
    pub current_lines: usize,
    pub modified_lines: usize,
    pub quality_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProposeOutcome {
    Proposed {
        proposal: Box<ModificationProposal>,
        preview: ProposalPreview,
    },
    Blocked {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        file: String,
        backup: String,
        test_results: TestOutcome,
        modifications_remaining_today: u32,
    },
    Blocked {
        reason: String,
        modifications_remaining_today: u32,
    },
    TestFailed {
        test_results: TestOutcome,
    },
    Error {
        error: String,
        rolled_back: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub proposal_id: String,
    pub file: String,
    pub restored_from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationStats {
    pub modifications_today: u32,
    pub max_per_day: u32,
    pub remaining_today: u32,
    pub last_modification_date: Option<String>,
}

/// One JSON file per proposal under a directory.
#[derive(Debug, Clone)]
pub struct ProposalStore {
    dir: PathBuf,
}

impl ProposalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AgentError::InvalidArguments(format!("invalid proposal id {id:?}")));
        }
        Ok(self.dir.join(format!("proposal_{id}.json")))
    }

    pub async fn save(&self, proposal: &ModificationProposal) -> Result<()> {
        let path = self.path_for(&proposal.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(proposal)?;
        write_atomically(&path, &body).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<ModificationProposal>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(AgentError::InvalidArguments(format!(
            "path has no parent: {}",
            path.display()
        )));
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp-{}", ulid::Ulid::new()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct SelfModifierConfig {
    pub source_root: PathBuf,
    pub data_dir: PathBuf,
}

enum Gate {
    Allowed { remaining: u32 },
    Blocked { reason: String, remaining: u32 },
}

pub struct SelfModifier {
    safety: Arc<SafetyController>,
    memory: Arc<dyn Memory>,
    state: Arc<dyn StateStore>,
    codegen: Arc<dyn CodeGenerator>,
    tests: Arc<dyn TestRunner>,
    clock: Arc<dyn Clock>,
    source_root: PathBuf,
    backups_dir: PathBuf,
    proposals: ProposalStore,
    lock: tokio::sync::Mutex<()>,
}

impl SelfModifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SelfModifierConfig,
        safety: Arc<SafetyController>,
        memory: Arc<dyn Memory>,
        state: Arc<dyn StateStore>,
        codegen: Arc<dyn CodeGenerator>,
        tests: Arc<dyn TestRunner>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let source_root = std::fs::canonicalize(&config.source_root).map_err(|e| {
            AgentError::InvalidArguments(format!(
                "source root {} is not accessible: {e}",
                config.source_root.display()
            ))
        })?;
        let backups_dir = config.data_dir.join("backups");
        std::fs::create_dir_all(&backups_dir)?;
        Ok(Self {
            safety,
            memory,
            state,
            codegen,
            tests,
            clock,
            source_root,
            backups_dir,
            proposals: ProposalStore::new(config.data_dir.join("proposals")),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    fn counter(&self, today: NaiveDate) -> Result<(u32, Option<String>)> {
        let last = self.state.get(keys::LAST_MODIFICATION_DATE)?;
        let count = if last.as_deref() == Some(today.to_string().as_str()) {
            self.state
                .get(keys::MODIFICATIONS_TODAY)?
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0)
        } else {
            0
        };
        Ok((count, last))
    }

    /// Resets the counter on UTC date rollover, then checks flags and quota.
    fn gate(&self) -> Result<Gate> {
        let today = self.today();
        let (count, last) = self.counter(today)?;
        if last.as_deref() != Some(today.to_string().as_str()) {
            self.state.set(keys::MODIFICATIONS_TODAY, "0")?;
            self.state.set(keys::LAST_MODIFICATION_DATE, &today.to_string())?;
        }
        let max = self.safety.max_modifications_per_day();
        let remaining = max.saturating_sub(count);
        if !self.safety.modifications_enabled_check() {
            return Ok(Gate::Blocked {
                reason: "Modifications disabled by safety controller".to_string(),
                remaining,
            });
        }
        if count >= max {
            return Ok(Gate::Blocked {
                reason: format!("Daily modification limit reached ({max})"),
                remaining,
            });
        }
        Ok(Gate::Allowed { remaining })
    }

    fn resolve_target(&self, target_file: &str) -> Result<PathBuf> {
        let requested = Path::new(target_file.trim());
        if requested.as_os_str().is_empty() {
            return Err(AgentError::InvalidArguments("target_file must not be empty".to_string()));
        }
        let joined = self.source_root.join(requested);
        let resolved = std::fs::canonicalize(&joined).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                AgentError::NotFound(format!("file not found: {target_file}"))
            }
            _ => e.into(),
        })?;
        if !resolved.starts_with(&self.source_root) {
            return Err(AgentError::PermissionDenied(format!(
                "target {} is outside the source root",
                resolved.display()
            )));
        }
        if !resolved.is_file() {
            return Err(AgentError::InvalidArguments(format!(
                "target is not a regular file: {}",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    fn candidate(&self, request: &ProposeRequest, code: &str, language: Language) -> Result<String> {
        let codegen = &self.codegen;
        Ok(match request.modification_type {
            ModificationType::Optimize => codegen.generate_optimization(
                code,
                OptimizationKind::from_reason(&request.reason),
                language,
            ),
            ModificationType::AddFeature => {
                let feature = codegen.generate_function(&request.description, language)?;
                format!("{}\n\n{}", code.trim_end(), feature.code)
            }
            ModificationType::FixBug => codegen.improve_error_handling(code, language),
            ModificationType::Refactor => codegen.refactor(code, &request.reason, language),
        })
    }

    /// `(allowed, reason)` for a new proposal or apply right now.
    pub fn can_modify(&self) -> Result<(bool, String)> {
        Ok(match self.gate()? {
            Gate::Allowed { .. } => (true, "Modification allowed".to_string()),
            Gate::Blocked { reason, .. } => (false, reason),
        })
    }

    #[tracing::instrument(level = "info", skip_all, fields(target = %request.target_file, kind = request.modification_type.as_str()))]
    pub async fn propose(&self, request: ProposeRequest) -> Result<ProposeOutcome> {
        let _guard = self.lock.lock().await;
        if let Gate::Blocked { reason, .. } = self.gate()? {
            tracing::warn!(reason = %reason, "proposal blocked");
            return Ok(ProposeOutcome::Blocked { reason });
        }

        let target = self.resolve_target(&request.target_file)?;
        let language = Language::from_path(&target);
        let current = tokio::fs::read_to_string(&target).await?;
        let modified = self.candidate(&request, &current, language)?;
        let validation = self.codegen.analyze_code_quality(&modified, language);
        let test_code = self.codegen.generate_test_case(&modified, language);

        let id = ulid::Ulid::new().to_string();
        let now = self.clock.now();
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        let backup_path = self.backups_dir.join(format!(
            "{file_name}.backup_{}_{id}",
            now.format("%Y%m%d_%H%M%S")
        ));
        tokio::fs::write(&backup_path, current.as_bytes()).await?;

        let preview = ProposalPreview {
            current_lines: current.lines().count(),
            modified_lines: modified.lines().count(),
            quality_score: validation.quality_score,
        };
        let proposal = ModificationProposal {
            id,
            target_file: target.display().to_string(),
            modification_type: request.modification_type,
            description: request.description,
            reason: request.reason,
            current_code_hash: hash_code(&current),
            modified_code_hash: hash_code(&modified),
            modified_code: modified,
            backup_path: backup_path.display().to_string(),
            validation,
            test_code,
            created_at: now,
            status: ProposalStatus::PendingApproval,
        };
        self.proposals.save(&proposal).await?;
        tracing::info!(
            proposal_id = %proposal.id,
            quality_score = preview.quality_score,
            "modification proposed"
        );
        Ok(ProposeOutcome::Proposed {
            proposal: Box::new(proposal),
            preview,
        })
    }

    pub async fn get_proposal(&self, id: &str) -> Result<ModificationProposal> {
        self.proposals
            .load(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("proposal {id}")))
    }

    async fn set_status(&self, proposal: &mut ModificationProposal, status: ProposalStatus) -> Result<()> {
        proposal.status = status;
        self.proposals.save(proposal).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(proposal_id = %id, auto_test))]
    pub async fn apply(&self, id: &str, auto_test: bool) -> Result<ApplyOutcome> {
        let _guard = self.lock.lock().await;
        let mut proposal = self.get_proposal(id).await?;
        if proposal.status != ProposalStatus::PendingApproval {
            return Err(AgentError::Conflict(format!(
                "proposal {id} is {}, not pending_approval",
                proposal.status.as_str()
            )));
        }

        if let Gate::Blocked { reason, remaining } = self.gate()? {
            tracing::warn!(reason = %reason, "apply blocked");
            self.set_status(&mut proposal, ProposalStatus::Blocked).await?;
            return Ok(ApplyOutcome::Blocked {
                reason,
                modifications_remaining_today: remaining,
            });
        }

        let target = PathBuf::from(&proposal.target_file);
        let live = match tokio::fs::read_to_string(&target).await {
            Ok(live) => live,
            Err(e) => {
                self.set_status(&mut proposal, ProposalStatus::Error).await?;
                return Err(e.into());
            }
        };
        if hash_code(&live) != proposal.current_code_hash {
            self.set_status(&mut proposal, ProposalStatus::Error).await?;
            return Err(AgentError::Conflict(format!(
                "{} changed since proposal {id} was created",
                proposal.target_file
            )));
        }

        let test_results = match (&proposal.test_code, auto_test) {
            (_, false) => TestOutcome::skipped("auto_test disabled"),
            (None, true) => TestOutcome::skipped("no test for language"),
            (Some(test), true) => self.tests.run(&proposal.modified_code, test).await,
        };
        if test_results.blocks_apply() {
            tracing::warn!(status = ?test_results.status, "generated test did not pass");
            self.memory.record_modification(ModificationRecord {
                modification_type: proposal.modification_type.as_str().to_string(),
                target_file: proposal.target_file.clone(),
                description: proposal.description.clone(),
                code_before: live,
                code_after: proposal.modified_code.clone(),
                test_results: serde_json::to_value(&test_results)?,
                applied: false,
                rolled_back: false,
                reason: proposal.reason.clone(),
            })?;
            self.set_status(&mut proposal, ProposalStatus::TestFailed).await?;
            return Ok(ApplyOutcome::TestFailed { test_results });
        }

        let (count_before, _) = self.counter(self.today())?;
        match self.write_change(&mut proposal, &target, &live, &test_results).await {
            Ok(remaining) => {
                if self.safety.git_integration_enabled() {
                    self.git_commit(&target, &proposal).await;
                }
                tracing::warn!(file = %proposal.target_file, remaining, "modification applied");
                Ok(ApplyOutcome::Applied {
                    file: proposal.target_file.clone(),
                    backup: proposal.backup_path.clone(),
                    test_results,
                    modifications_remaining_today: remaining,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "apply failed; restoring backup");
                let rolled_back = match self.restore_backup(&proposal, &target).await {
                    Ok(()) => true,
                    Err(restore) => {
                        tracing::error!(error = %restore, "backup restore failed");
                        false
                    }
                };
                if let Err(reset) = self
                    .state
                    .set(keys::MODIFICATIONS_TODAY, &count_before.to_string())
                {
                    tracing::error!(error = %reset, "daily counter reset failed");
                }
                let audit = ModificationRecord {
                    modification_type: proposal.modification_type.as_str().to_string(),
                    target_file: proposal.target_file.clone(),
                    description: proposal.description.clone(),
                    code_before: live,
                    code_after: proposal.modified_code.clone(),
                    test_results: serde_json::to_value(&test_results).unwrap_or_default(),
                    applied: false,
                    rolled_back,
                    reason: format!("{} (apply failed: {e})", proposal.reason),
                };
                if let Err(audit) = self.memory.record_modification(audit) {
                    tracing::error!(error = %audit, "failed apply not recorded");
                }
                self.set_status(&mut proposal, ProposalStatus::Error).await?;
                Ok(ApplyOutcome::Error {
                    error: e.to_string(),
                    rolled_back,
                })
            }
        }
    }

    /// Everything from the first byte written to the target. Any error here is rolled back, so
    /// the quota and the `applied` audit row are written last.
    async fn write_change(
        &self,
        proposal: &mut ModificationProposal,
        target: &Path,
        live: &str,
        test_results: &TestOutcome,
    ) -> Result<u32> {
        write_atomically(target, proposal.modified_code.as_bytes()).await?;
        self.set_status(proposal, ProposalStatus::Applied).await?;

        let today = self.today();
        let (count, _) = self.counter(today)?;
        let count = count.saturating_add(1);
        self.state.set(keys::LAST_MODIFICATION_DATE, &today.to_string())?;
        self.state.set(keys::MODIFICATIONS_TODAY, &count.to_string())?;

        self.memory.record_modification(ModificationRecord {
            modification_type: proposal.modification_type.as_str().to_string(),
            target_file: proposal.target_file.clone(),
            description: proposal.description.clone(),
            code_before: live.to_string(),
            code_after: proposal.modified_code.clone(),
            test_results: serde_json::to_value(test_results)?,
            applied: true,
            rolled_back: false,
            reason: proposal.reason.clone(),
        })?;
        Ok(self.safety.max_modifications_per_day().saturating_sub(count))
    }

    async fn restore_backup(&self, proposal: &ModificationProposal, target: &Path) -> Result<()> {
        let original = tokio::fs::read(&proposal.backup_path).await?;
        write_atomically(target, &original).await
    }

    async fn git_commit(&self, target: &Path, proposal: &ModificationProposal) {
        let message = format!(
            "[apex-agent] {} (proposal {})",
            proposal.description, proposal.id
        );
        let mut add = tokio::process::Command::new("git");
        add.arg("add").arg(target);
        let mut commit = tokio::process::Command::new("git");
        commit.arg("commit").arg("-m").arg(&message);

        for (step, cmd) in [("add", add), ("commit", commit)] {
            match apex_tools::shell::run_process(cmd, &self.source_root, GIT_TIMEOUT).await {
                Ok(out) if out.returncode == 0 => {}
                Ok(out) => {
                    tracing::warn!(step, returncode = out.returncode, stderr = %out.stderr, "git step failed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(step, error = %e, "git step failed");
                    return;
                }
            }
        }
        tracing::info!(proposal_id = %proposal.id, "modification committed");
    }

    #[tracing::instrument(level = "info", skip_all, fields(proposal_id = %id))]
    pub async fn rollback(&self, id: &str) -> Result<RollbackOutcome> {
        let _guard = self.lock.lock().await;
        let mut proposal = self.get_proposal(id).await?;
        if proposal.status != ProposalStatus::Applied {
            return Err(AgentError::Conflict(format!(
                "proposal {id} is {}, only applied proposals can be rolled back",
                proposal.status.as_str()
            )));
        }
        let target = PathBuf::from(&proposal.target_file);
        let current = tokio::fs::read_to_string(&target).await.unwrap_or_default();
        self.restore_backup(&proposal, &target).await?;
        let restored = tokio::fs::read_to_string(&target).await.unwrap_or_default();

        self.memory.record_modification(ModificationRecord {
            modification_type: proposal.modification_type.as_str().to_string(),
            target_file: proposal.target_file.clone(),
            description: format!("rollback of proposal {id}"),
            code_before: current,
            code_after: restored,
            test_results: serde_json::Value::Null,
            applied: true,
            rolled_back: true,
            reason: proposal.reason.clone(),
        })?;
        self.set_status(&mut proposal, ProposalStatus::RolledBack).await?;
        tracing::warn!(file = %proposal.target_file, "modification rolled back");
        Ok(RollbackOutcome {
            proposal_id: proposal.id,
            file: proposal.target_file,
            restored_from: proposal.backup_path,
        })
    }

    pub fn modification_stats(&self) -> Result<ModificationStats> {
        let today = self.today();
        let (count, last) = self.counter(today)?;
        let max = self.safety.max_modifications_per_day();
        Ok(ModificationStats {
            modifications_today: count,
            max_per_day: max,
            remaining_today: max.saturating_sub(count),
            last_modification_date: last,
        })
    }
}
