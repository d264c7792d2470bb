//! 规划数据结构
//!
//! - DecompositionOutput / SubtaskDescriptor：推理后端的结构化输出（schema 由 schemars 生成）
//! - Subtask：路线图 arena 中的不可变节点，依赖以 arena 下标表示
//! - ActionProposal / PlannedAction：执行前「准备做什么」，TrackKeeper 用它检测偏离

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::TaskId;
use crate::tools::{Capability, DataType};

/// 分解输出（结构化）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecompositionOutput {
    /// 模型对拆分方式的简短说明
    #[serde(default)]
    pub reasoning: Option<String>,
    pub subtasks: Vec<SubtaskDescriptor>,
}

/// 单个子任务描述；subtasks 字段允许再分解（深度受 planner.max_depth 限制）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubtaskDescriptor {
    /// 在同一列表中唯一的短 id，如 "s1"
    pub id: String,
    pub description: String,
    /// 依赖的其他子任务 id；可带权重，权重越低越先被断环
    #[serde(default)]
    pub depends_on: Vec<DependencyHint>,
    /// 显式工具名
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub capability: Option<Capability>,
    /// 工具的结构化输入
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub expected_output: Option<DataType>,
    /// 追加的工具链：上一步的结构化输出经字段映射进入下一步输入
    #[serde(default)]
    pub chain: Vec<ChainStep>,
    #[serde(default)]
    pub chain_mode: ChainMode,
    /// 完成把握 [0,1]
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    /// 执行前需要人工批准
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub subtasks: Vec<SubtaskDescriptor>,
}

/// 依赖提示：纯 id 或 {id, weight}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum DependencyHint {
    Id(String),
    Weighted {
        id: String,
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

fn default_weight() -> f64 {
    1.0
}

impl DependencyHint {
    pub fn id(&self) -> &str {
        match self {
            DependencyHint::Id(id) => id,
            DependencyHint::Weighted { id, .. } => id,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            DependencyHint::Id(_) => default_weight(),
            DependencyHint::Weighted { weight, .. } => *weight,
        }
    }
}

/// 工具链执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// 逐步执行，映射字段取自上一步输出
    #[default]
    Sequential,
    /// 各步同时执行，映射字段都取自主工具输出
    Parallel,
}

/// 工具链中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChainStep {
    pub tool: String,
    /// 静态输入，与映射字段合并
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub map: Vec<FieldMapping>,
}

/// 字段映射：from 为上一步结构化输出中的点路径，to 为本步输入的键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FieldMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
    VeryComplex,
}

impl Complexity {
    /// 关键路径 / 成本估算使用的权重
    pub fn cost(self) -> u32 {
        match self {
            Complexity::Simple => 1,
            Complexity::Moderate => 2,
            Complexity::Complex => 3,
            Complexity::VeryComplex => 5,
        }
    }
}

/// 一条依赖：arena 下标 + 提示权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Dependency {
    pub index: usize,
    pub weight: f64,
}

/// 路线图节点（创建后不可变，状态由 TrackKeeper 单独保存）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subtask {
    /// arena 下标，也是创建顺序
    pub index: usize,
    /// 唯一 key；嵌套子任务为 "parent.child"
    pub key: String,
    pub task_id: TaskId,
    pub description: String,
    pub dependencies: Vec<Dependency>,
    pub tool: Option<String>,
    pub capability: Option<Capability>,
    pub input: Option<Value>,
    pub expected_output: Option<DataType>,
    pub chain: Vec<ChainStep>,
    pub chain_mode: ChainMode,
    pub confidence: f64,
    pub complexity: Complexity,
    pub requires_approval: bool,
    pub timeout_secs: Option<u64>,
}

impl Subtask {
    /// 最小节点（测试与手工构造路线图用）
    pub fn new(index: usize, key: impl Into<String>, task_id: TaskId, description: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            task_id,
            description: description.into(),
            dependencies: Vec::new(),
            tool: None,
            capability: None,
            input: None,
            expected_output: None,
            chain: Vec::new(),
            chain_mode: ChainMode::default(),
            confidence: 1.0,
            complexity: Complexity::default(),
            requires_approval: false,
            timeout_secs: None,
        }
    }

    pub fn with_dependency(mut self, index: usize) -> Self {
        self.dependencies.push(Dependency { index, weight: 1.0 });
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, input: Value) -> Self {
        self.tool = Some(tool.into());
        self.input = Some(input);
        self
    }

    pub fn dependency_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.dependencies.iter().map(|d| d.index)
    }

    /// 显式能力，否则从描述推断，都没有时按文本处理
    pub fn effective_capability(&self) -> Capability {
        self.capability
            .or_else(|| Capability::infer(&self.description))
            .unwrap_or(Capability::Text)
    }
}

/// 分解结果（已展平、依赖已解析为下标）
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub reasoning: Option<String>,
    pub subtasks: Vec<Subtask>,
}

/// 推理后端为缺少输入的节点给出的动作提议（结构化）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActionProposal {
    /// 提议执行的子任务 key
    pub subtask: String,
    /// 对将要执行的动作的一句话描述
    pub summary: String,
    #[serde(default)]
    pub input: Value,
}

/// 即将派发的动作
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    /// 动作声称对应的节点 key
    pub node: String,
    pub tool: String,
    pub summary: String,
    pub input: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependency_hint_accepts_both_forms() {
        let hints: Vec<DependencyHint> =
            serde_json::from_value(json!(["s1", {"id": "s2", "weight": 0.2}, {"id": "s3"}])).unwrap();
        assert_eq!(hints[0].id(), "s1");
        assert_eq!(hints[0].weight(), 1.0);
        assert_eq!(hints[1].weight(), 0.2);
        assert_eq!(hints[2].weight(), 1.0);
    }

    #[test]
    fn test_descriptor_defaults() {
        let d: SubtaskDescriptor =
            serde_json::from_value(json!({"id": "s1", "description": "say hi"})).unwrap();
        assert!(d.depends_on.is_empty());
        assert!(!d.requires_approval);
        assert!(d.subtasks.is_empty());
    }

    #[test]
    fn test_schema_title_is_type_name() {
        let schema = serde_json::to_value(schemars::schema_for!(DecompositionOutput)).unwrap();
        assert_eq!(schema["title"], "DecompositionOutput");
    }

    #[test]
    fn test_effective_capability_falls_back_to_description() {
        let s = Subtask::new(0, "s1", TaskId::from("t"), "read file A");
        assert_eq!(s.effective_capability(), Capability::FileRead);
        let vague = Subtask::new(1, "s2", TaskId::from("t"), "contemplate");
        assert_eq!(vague.effective_capability(), Capability::Text);
    }
}
