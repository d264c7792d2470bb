//! 执行层：工具编排、工作池、结果处理

pub mod orchestrator;
pub mod pool;
pub mod result;

pub use orchestrator::{lookup, LayerJob, NodeOutcome, NodeRun, ToolOrchestrator};
pub use pool::WorkerPool;
pub use result::{parse_as, sniff, ExecutionResult, ResultProcessor};
