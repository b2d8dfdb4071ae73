//! 核心执行层：错误分类、资源账本、任务生命周期、执行监督与失败恢复

pub mod builder;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod recovery;
pub mod task;

pub use builder::{create_llm_from_config, AgentBuilder};
pub use error::{
    AgentError, FailureKind, ModelError, PlanError, RulesError, TaskError, ToolError,
};
pub use ledger::{
    LedgerError, LedgerStats, Reservation, ResourceAllocation, ResourceKind, ResourceLedger,
    ResourceUsage,
};
pub use monitor::{ExecutionMonitor, MonitorSettings};
pub use recovery::{RecoveryAction, RecoveryContext, RecoveryPolicy, RecoverySettings};
pub use task::{
    DispatchRecord, StepOutcome, StepResult, Task, TaskFailure, TaskHandle, TaskId, TaskManager, TaskMetrics,
    TaskSnapshot, TaskStatus, TaskSummary,
};
