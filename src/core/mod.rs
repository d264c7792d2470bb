//! 核心编排层：错误与恢复、状态机、任务投影、取消监管、协调循环

pub mod backoff;
pub mod builder;
pub mod coordinator;
pub mod error;
pub mod recovery;
pub mod state;
pub mod supervisor;
pub mod task;

pub use backoff::BackoffScheduler;
pub use builder::{create_engine_builder, EngineBuilder};
pub use coordinator::{EngineParts, TaskEngine};
pub use error::{FailureCategory, PlanError};
pub use recovery::{
    classify, classify_message, FailurePatterns, FailureRecord, NodeBudget, RecoveryDecision,
    RecoverySystem,
};
pub use state::{SubtaskStatus, TaskState};
pub use supervisor::TaskSupervisor;
pub use task::{
    recovery_suggestions, Escalation, NodeView, Priority, ProgressSummary, RoadmapView, Task,
    TaskId, TaskSnapshot, TaskStatusReport,
};
