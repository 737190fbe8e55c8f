//! Autonomy layer for apex: safety controller, execution memory, learner, code generator,
//! self-modification pipeline and the background orchestration loop.

pub mod agent_loop;
pub mod clock;
pub mod codegen;
pub mod error;
pub mod flag;
pub mod learner;
pub mod memory;
pub mod safety;
pub mod self_modify;
pub mod state;
pub mod test_runner;

pub use agent_loop::{
    AgentComponents, AgentLoop, AgentStatus, CycleReport, DEFAULT_LOOP_INTERVAL, LearningReport,
    LoopState, LoopStatus,
};
pub use clock::{Clock, SystemClock};
pub use codegen::{CodeGenerator, Language, QualityReport, TemplateCodeGenerator};
pub use error::{AgentError, Result};
pub use flag::{DurableFlag, FileFlag};
pub use learner::{HistoryLearner, Learner};
pub use memory::{ExecutionRecord, Memory, MemoryStatistics, NewExecution, SqliteMemory};
pub use safety::{
    SafetyConfig, SafetyController, SafetyIncident, SafetyOverrides, SafetySecrets, SafetyStatus,
    Severity,
};
pub use self_modify::{
    ApplyOutcome, ModificationProposal, ModificationStats, ModificationType, ProposalStatus,
    ProposeOutcome, ProposeRequest, RollbackOutcome, SelfModifier, SelfModifierConfig,
};
pub use state::StateStore;
pub use test_runner::{ScriptTestRunner, TestOutcome, TestRunner, TestStatus};
