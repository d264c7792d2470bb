//! 任务与对外状态投影
//!
//! Task 只由该任务的协调循环修改；外部通过 TaskSnapshot（watch 通道中的快照）观察，
//! get_status / inspect_roadmap 返回的是快照上的视图。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{FailureCategory, FailureRecord, TaskState};
use crate::core::state::SubtaskStatus;
use crate::execution::ExecutionResult;
use crate::planner::{Checkpoint, Roadmap};

/// 任务 ID：`task_<uuid>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("task_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// 升级报告：哪个节点、什么类别、为什么、尝试过什么
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Escalation {
    pub node: Option<String>,
    pub category: FailureCategory,
    pub message: String,
    pub last_checkpoint: Option<u64>,
    pub attempts: Vec<FailureRecord>,
    /// 人工通道对升级通知的答复
    pub human_reply: Option<String>,
    /// 由本任务失败统计得出的改进建议
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub context: Value,
    pub state: TaskState,
    pub priority: Priority,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    /// 终态 COMPLETED 时各节点结构化输出（按 key）
    pub result: Option<Value>,
    pub escalation: Option<Escalation>,
}

impl Task {
    pub fn new(description: impl Into<String>, context: Value, priority: Priority) -> Self {
        Self {
            id: TaskId::generate(),
            description: description.into(),
            context,
            state: TaskState::Pending,
            priority,
            created_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
            result: None,
            escalation: None,
        }
    }
}

/// 节点视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub key: String,
    pub description: String,
    pub tool: Option<String>,
    pub capability: String,
    pub confidence: f64,
    pub depends_on: Vec<String>,
}

/// 路线图视图（观测用）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoadmapView {
    pub roadmap_id: String,
    pub revision: u32,
    pub nodes: Vec<NodeView>,
    /// (dependency, dependent)
    pub edges: Vec<(String, String)>,
    pub layers: Vec<Vec<String>>,
    pub node_statuses: BTreeMap<String, SubtaskStatus>,
    pub dropped_edges: Vec<(String, String)>,
    /// 按复杂度成本计的最长依赖链
    pub critical_path: Vec<String>,
    /// 每层取最大成本后求和
    pub estimated_cost: u32,
}

impl RoadmapView {
    pub fn from_roadmap(roadmap: &Roadmap, statuses: &[SubtaskStatus]) -> Self {
        let key = |i: usize| roadmap.nodes.get(i).map(|n| n.key.clone()).unwrap_or_default();
        Self {
            roadmap_id: roadmap.id.clone(),
            revision: roadmap.revision,
            nodes: roadmap
                .nodes
                .iter()
                .map(|n| NodeView {
                    key: n.key.clone(),
                    description: n.description.clone(),
                    tool: n.tool.clone(),
                    capability: n.effective_capability().as_str().to_string(),
                    confidence: n.confidence,
                    depends_on: n.dependency_indices().map(key).collect(),
                })
                .collect(),
            edges: roadmap.edges.iter().map(|&(a, b)| (key(a), key(b))).collect(),
            layers: roadmap
                .layers
                .iter()
                .map(|layer| layer.iter().map(|&i| key(i)).collect())
                .collect(),
            node_statuses: roadmap
                .nodes
                .iter()
                .map(|n| {
                    let status = statuses.get(n.index).copied().unwrap_or(SubtaskStatus::Pending);
                    (n.key.clone(), status)
                })
                .collect(),
            dropped_edges: roadmap
                .dropped_edges
                .iter()
                .map(|&(a, b)| (key(a), key(b)))
                .collect(),
            critical_path: roadmap.critical_path().into_iter().map(key).collect(),
            estimated_cost: roadmap.estimated_cost(),
        }
    }
}

/// 任务完整快照（watch 通道的值）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task: Task,
    pub current_node: Option<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub last_error: Option<String>,
    pub failures: Vec<FailureRecord>,
    pub roadmap: Option<RoadmapView>,
    pub results: BTreeMap<String, ExecutionResult>,
    pub validation_rounds: u32,
    pub replans: u32,
    pub deviations: u32,
}

impl TaskSnapshot {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            current_node: None,
            checkpoints: Vec::new(),
            last_error: None,
            failures: Vec::new(),
            roadmap: None,
            results: BTreeMap::new(),
            validation_rounds: 0,
            replans: 0,
            deviations: 0,
        }
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }
}

/// 进度摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub revision: u32,
    pub total_nodes: usize,
    pub succeeded: usize,
    pub running: usize,
    pub failed: usize,
    /// succeeded / total_nodes；尚无路线图时为 0
    pub progress: f64,
    pub checkpoint_count: usize,
    /// 最近三个检查点
    pub recent_checkpoints: Vec<Checkpoint>,
    pub validation_rounds: u32,
    pub replans: u32,
    pub deviations: u32,
}

impl ProgressSummary {
    pub fn from_snapshot(s: &TaskSnapshot) -> Self {
        let count = |status: SubtaskStatus| {
            s.roadmap
                .as_ref()
                .map(|r| r.node_statuses.values().filter(|v| **v == status).count())
                .unwrap_or(0)
        };
        let total_nodes = s.roadmap.as_ref().map(|r| r.nodes.len()).unwrap_or(0);
        let succeeded = count(SubtaskStatus::Succeeded);
        let progress = if total_nodes == 0 {
            0.0
        } else {
            succeeded as f64 / total_nodes as f64
        };
        let skip = s.checkpoints.len().saturating_sub(3);
        Self {
            revision: s.roadmap.as_ref().map(|r| r.revision).unwrap_or(0),
            total_nodes,
            succeeded,
            running: count(SubtaskStatus::Running),
            failed: count(SubtaskStatus::Failed),
            progress,
            checkpoint_count: s.checkpoints.len(),
            recent_checkpoints: s.checkpoints[skip..].to_vec(),
            validation_rounds: s.validation_rounds,
            replans: s.replans,
            deviations: s.deviations,
        }
    }
}

/// 按任务当前状态给出的处理建议
pub fn recovery_suggestions(s: &TaskSnapshot) -> Vec<String> {
    let mut out = Vec::new();
    match s.task.state {
        TaskState::Escalated | TaskState::Failed => {
            if let Some(e) = &s.task.escalation {
                out.push(format!(
                    "Resolve the {} failure at {}: {}",
                    e.category,
                    e.node.as_deref().unwrap_or("planning"),
                    e.message
                ));
                out.extend(e.suggestions.iter().cloned());
            } else if let Some(err) = &s.last_error {
                out.push(format!("Task stopped: {}", err));
            }
            match s.checkpoints.last() {
                Some(cp) => out.push(format!(
                    "Last good checkpoint is #{} after {} ({} subtasks done); resubmit the remaining work",
                    cp.position,
                    cp.node,
                    cp.completed.len()
                )),
                None => out.push("No checkpoint reached; refine the task description and resubmit".into()),
            }
        }
        _ if s.deviations > 0 => out.push(format!(
            "{} deviation(s) so far; review the current subtask requirements",
            s.deviations
        )),
        _ => {}
    }
    out
}

/// get_status 的返回
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusReport {
    pub state: TaskState,
    pub current_node: Option<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub last_error: Option<String>,
    pub progress: ProgressSummary,
    pub suggestions: Vec<String>,
}

impl From<&TaskSnapshot> for TaskStatusReport {
    fn from(s: &TaskSnapshot) -> Self {
        Self {
            state: s.task.state,
            current_node: s.current_node.clone(),
            checkpoints: s.checkpoints.clone(),
            last_error: s.last_error.clone(),
            progress: ProgressSummary::from_snapshot(s),
            suggestions: recovery_suggestions(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{RoadmapGenerator, Subtask};

    #[test]
    fn test_task_id_format() {
        let id = TaskId::generate();
        assert!(id.as_str().starts_with("task_"));
        assert_ne!(id, TaskId::generate());
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("say hi", Value::Null, Priority::default());
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.completed_at.is_none());
        assert_eq!(task.priority, Priority::Normal);
    }

    #[test]
    fn test_roadmap_view_uses_keys() {
        let tid = TaskId::from("t");
        let nodes = vec![
            Subtask::new(0, "s1", tid.clone(), "create file A"),
            Subtask::new(1, "s2", tid.clone(), "read file A").with_dependency(0),
        ];
        let roadmap = RoadmapGenerator::default().generate(&tid, nodes, 0).unwrap();
        let view = RoadmapView::from_roadmap(&roadmap, &[SubtaskStatus::Succeeded]);
        assert_eq!(view.edges, vec![("s1".to_string(), "s2".to_string())]);
        assert_eq!(view.layers, vec![vec!["s1".to_string()], vec!["s2".to_string()]]);
        assert_eq!(view.node_statuses["s1"], SubtaskStatus::Succeeded);
        assert_eq!(view.node_statuses["s2"], SubtaskStatus::Pending);
        assert_eq!(view.nodes[1].depends_on, vec!["s1"]);
        assert_eq!(view.critical_path, vec!["s1", "s2"]);
        // 两层各一个 Moderate 节点
        assert_eq!(view.estimated_cost, 4);
    }

    fn checkpoint(position: u64, node: &str) -> Checkpoint {
        Checkpoint {
            position,
            revision: 0,
            completed: (1..=position).map(|i| format!("s{}", i)).collect(),
            node: node.into(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_progress_summary_counts_nodes_and_recent_checkpoints() {
        let tid = TaskId::from("t");
        let nodes = vec![
            Subtask::new(0, "s1", tid.clone(), "create file A"),
            Subtask::new(1, "s2", tid.clone(), "read file A").with_dependency(0),
            Subtask::new(2, "s3", tid.clone(), "append to file A").with_dependency(1),
            Subtask::new(3, "s4", tid.clone(), "summarize file A").with_dependency(2),
        ];
        let roadmap = RoadmapGenerator::default().generate(&tid, nodes, 0).unwrap();
        let mut snap = TaskSnapshot::new(Task::new("files", Value::Null, Priority::default()));
        snap.task.state = TaskState::Executing;
        snap.roadmap = Some(RoadmapView::from_roadmap(
            &roadmap,
            &[SubtaskStatus::Succeeded, SubtaskStatus::Succeeded, SubtaskStatus::Running],
        ));
        snap.checkpoints = (1..=4).map(|p| checkpoint(p, "s1")).collect();

        let summary = ProgressSummary::from_snapshot(&snap);
        assert_eq!(summary.total_nodes, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.failed, 0);
        assert!((summary.progress - 0.5).abs() < 1e-9);
        assert_eq!(summary.checkpoint_count, 4);
        let recent: Vec<u64> = summary.recent_checkpoints.iter().map(|c| c.position).collect();
        assert_eq!(recent, vec![2, 3, 4]);

        let report = TaskStatusReport::from(&snap);
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn test_escalated_task_suggests_resolution_and_checkpoint() {
        let mut snap = TaskSnapshot::new(Task::new("files", Value::Null, Priority::default()));
        snap.task.state = TaskState::Escalated;
        snap.checkpoints = vec![checkpoint(1, "s1")];
        snap.task.escalation = Some(Escalation {
            node: Some("s2".into()),
            category: FailureCategory::Config,
            message: "missing path".into(),
            last_checkpoint: Some(1),
            attempts: Vec::new(),
            human_reply: None,
            suggestions: vec!["Configuration failures: review tool parameters and settings".into()],
        });

        let report = TaskStatusReport::from(&snap);
        assert_eq!(report.progress.total_nodes, 0);
        assert_eq!(report.progress.progress, 0.0);
        assert_eq!(report.suggestions.len(), 3);
        assert!(report.suggestions[0].contains("config failure at s2"));
        assert!(report.suggestions[1].starts_with("Configuration"));
        assert!(report.suggestions[2].contains("#1 after s1"));
    }
}
