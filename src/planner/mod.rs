//! 规划层：分解 → 路线图 → 校验 → 轨迹保持
//!
//! - decomposer：调用推理后端把任务描述拆成子任务，展平嵌套并解析依赖
//! - roadmap：arena DAG、环检测与断环、确定性分层与拓扑序
//! - validator：六项检查并给出批准 / 拒绝
//! - tracker：执行位置、检查点、偏离检测与回滚

pub mod decomposer;
pub mod roadmap;
pub mod text;
pub mod tracker;
pub mod types;
pub mod validator;

pub use decomposer::{decomposition_schema, DecompositionRequest, TaskDecomposer};
pub use roadmap::{find_cycle, Roadmap, RoadmapGenerator};
pub use tracker::{Checkpoint, TrackKeeper, TrackVerdict};
pub use types::{
    ActionProposal, ChainMode, ChainStep, Complexity, Decomposition, DecompositionOutput, Dependency,
    DependencyHint, FieldMapping, PlannedAction, Subtask, SubtaskDescriptor,
};
pub use validator::{CheckOutcome, ValidationReport, Validator};
