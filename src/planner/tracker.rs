//! 轨迹保持器
//!
//! 每个运行中的任务一份：当前路线图、拓扑序中的位置指针、各节点状态、检查点列表。
//! - validate_on_track：比较即将执行的动作与当前位置应执行的节点，超出容差即为偏离
//! - 节点进入 SUCCEEDED 之后才追加检查点；检查点只追加不修改，位置严格递增
//! - 回滚：丢弃目标检查点之后的节点状态，这些节点重置为 PENDING
//! - 重规划：换上新路线图，位置继续递增，之前版本完成的 key 保留在检查点快照里

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::state::SubtaskStatus;
use crate::core::PlanError;
use crate::planner::roadmap::Roadmap;
use crate::planner::text::similarity;
use crate::planner::types::PlannedAction;

/// 检查点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub position: u64,
    /// 所属路线图版本
    pub revision: u32,
    /// 截至此刻已完成的节点 key（含更早版本）
    pub completed: BTreeSet<String>,
    /// 本次完成的节点
    pub node: String,
    pub timestamp_ms: i64,
}

/// 偏离判定
#[derive(Debug, Clone, PartialEq)]
pub enum TrackVerdict {
    OnTrack,
    Deviation {
        expected: Option<String>,
        actual: String,
        similarity: f64,
        reason: String,
    },
}

impl TrackVerdict {
    pub fn is_on_track(&self) -> bool {
        matches!(self, TrackVerdict::OnTrack)
    }
}

#[derive(Debug)]
pub struct TrackKeeper {
    roadmap: Roadmap,
    statuses: Vec<SubtaskStatus>,
    /// 指向 topo_order 中第一个未完成节点
    cursor: usize,
    checkpoints: Vec<Checkpoint>,
    next_position: u64,
    /// 更早版本完成的 key
    carried: BTreeSet<String>,
    /// 当前版本第一个检查点的下标
    revision_start: usize,
    tolerance: f64,
}

impl TrackKeeper {
    pub fn start(roadmap: Roadmap, tolerance: f64) -> Self {
        let n = roadmap.len();
        Self {
            roadmap,
            statuses: vec![SubtaskStatus::Pending; n],
            cursor: 0,
            checkpoints: Vec::new(),
            next_position: 1,
            carried: BTreeSet::new(),
            revision_start: 0,
            tolerance,
        }
    }

    pub fn roadmap(&self) -> &Roadmap {
        &self.roadmap
    }

    pub fn statuses(&self) -> &[SubtaskStatus] {
        &self.statuses
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// 所有已完成的 key（含更早版本）
    pub fn completed_keys(&self) -> BTreeSet<String> {
        let mut keys = self.carried.clone();
        keys.extend(
            self.roadmap
                .nodes
                .iter()
                .filter(|n| self.statuses[n.index] == SubtaskStatus::Succeeded)
                .map(|n| n.key.clone()),
        );
        keys
    }

    /// 已完成节点的描述（重规划时告诉分解器不要重复）
    pub fn completed_descriptions(&self) -> Vec<String> {
        self.roadmap
            .nodes
            .iter()
            .filter(|n| self.statuses[n.index] == SubtaskStatus::Succeeded)
            .map(|n| n.description.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(|s| *s == SubtaskStatus::Succeeded)
    }

    /// 当前位置期望执行的节点
    pub fn expected_node(&self) -> Option<usize> {
        self.roadmap.topo_order.get(self.cursor).copied()
    }

    /// 当前层（与期望节点同层、尚未成功的节点）
    pub fn current_layer(&self) -> Vec<usize> {
        let Some(expected) = self.expected_node() else {
            return Vec::new();
        };
        let Some(layer) = self.roadmap.layer_of(expected) else {
            return Vec::new();
        };
        self.roadmap.layers[layer]
            .iter()
            .copied()
            .filter(|&i| self.statuses[i] != SubtaskStatus::Succeeded)
            .collect()
    }

    /// 动作是否对得上当前层中它声称的节点
    ///
    /// 同层节点可并发执行，所以只要动作指向当前层的某个节点即可；随后比较动作摘要与节点描述。
    pub fn validate_on_track(&self, action: &PlannedAction) -> TrackVerdict {
        let layer = self.current_layer();
        let expected_key = self.expected_node().map(|i| self.roadmap.key_of(i).to_string());
        let target = layer
            .iter()
            .copied()
            .find(|&i| self.roadmap.key_of(i) == action.node);

        let Some(index) = target else {
            return TrackVerdict::Deviation {
                expected: expected_key,
                actual: action.node.clone(),
                similarity: 0.0,
                reason: format!("action targets {} which is not due at this position", action.node),
            };
        };

        let description = self
            .roadmap
            .node(index)
            .map(|n| n.description.as_str())
            .unwrap_or_default();
        let score = similarity(&action.summary, description);
        if score < self.tolerance {
            return TrackVerdict::Deviation {
                expected: Some(action.node.clone()),
                actual: action.summary.clone(),
                similarity: score,
                reason: format!(
                    "action \"{}\" diverges from \"{}\" (similarity {:.2} < {:.2})",
                    action.summary, description, score, self.tolerance
                ),
            };
        }
        TrackVerdict::OnTrack
    }

    /// PENDING → RUNNING；依赖未全部 SUCCEEDED 时拒绝
    pub fn mark_running(&mut self, index: usize) -> Result<(), PlanError> {
        let node = self
            .roadmap
            .node(index)
            .ok_or_else(|| PlanError::Logic(format!("no node at index {}", index)))?;
        if let Some(dep) = node
            .dependency_indices()
            .find(|&d| self.statuses[d] != SubtaskStatus::Succeeded)
        {
            return Err(PlanError::Logic(format!(
                "{} cannot start before {} succeeds",
                node.key,
                self.roadmap.key_of(dep)
            )));
        }
        self.transition(index, SubtaskStatus::Running)
    }

    /// RUNNING → SUCCEEDED，并追加检查点
    pub fn mark_succeeded(&mut self, index: usize) -> Result<&Checkpoint, PlanError> {
        self.transition(index, SubtaskStatus::Succeeded)?;
        self.advance_cursor();
        let checkpoint = Checkpoint {
            position: self.next_position,
            revision: self.roadmap.revision,
            completed: self.completed_keys(),
            node: self.roadmap.key_of(index).to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.next_position += 1;
        tracing::info!(
            node = %checkpoint.node,
            position = checkpoint.position,
            completed = checkpoint.completed.len(),
            "checkpoint recorded"
        );
        self.checkpoints.push(checkpoint);
        self.checkpoints
            .last()
            .ok_or_else(|| PlanError::Logic("checkpoint list empty".to_string()))
    }

    /// RUNNING → FAILED
    pub fn mark_failed(&mut self, index: usize) -> Result<(), PlanError> {
        self.transition(index, SubtaskStatus::Failed)
    }

    /// 把 RUNNING 节点放回 PENDING（取消 / 重试前使用，不产生检查点）
    pub fn release(&mut self, index: usize) {
        if self.statuses.get(index) == Some(&SubtaskStatus::Running) {
            self.statuses[index] = SubtaskStatus::Pending;
        }
    }

    /// 失败节点重新进入 PENDING（恢复策略决定重试 / 换工具时）
    pub fn reset_failed(&mut self, index: usize) {
        if self.statuses.get(index) == Some(&SubtaskStatus::Failed) {
            self.statuses[index] = SubtaskStatus::Pending;
        }
    }

    fn transition(&mut self, index: usize, next: SubtaskStatus) -> Result<(), PlanError> {
        let current = self
            .statuses
            .get(index)
            .copied()
            .ok_or_else(|| PlanError::Logic(format!("no node at index {}", index)))?;
        if !current.can_transition_to(next) {
            return Err(PlanError::InvalidTransition {
                from: format!("{}:{}", self.roadmap.key_of(index), current),
                to: next.to_string(),
            });
        }
        self.statuses[index] = next;
        Ok(())
    }

    fn advance_cursor(&mut self) {
        while let Some(&i) = self.roadmap.topo_order.get(self.cursor) {
            if self.statuses[i] != SubtaskStatus::Succeeded {
                break;
            }
            self.cursor += 1;
        }
    }

    /// 回滚到指定位置的检查点：之后完成的节点全部重置为 PENDING
    ///
    /// 只能回滚到当前版本内的检查点；更早的位置等价于回到当前版本起点。
    pub fn rollback_to(&mut self, position: u64) -> Result<Option<&Checkpoint>, PlanError> {
        let current_revision = &self.checkpoints[self.revision_start..];
        let keep = current_revision
            .iter()
            .position(|c| c.position == position)
            .map(|p| self.revision_start + p + 1);
        let keep = match keep {
            Some(k) => k,
            None if position < self.current_revision_first_position() => self.revision_start,
            None => {
                return Err(PlanError::Logic(format!(
                    "no checkpoint at position {}",
                    position
                )))
            }
        };
        self.truncate_to(keep);
        Ok(self.checkpoints.get(keep.wrapping_sub(1)).filter(|_| keep > self.revision_start))
    }

    /// 回滚到最近的检查点（丢弃其后的 RUNNING / FAILED 状态）
    pub fn rollback_to_last(&mut self) -> Option<&Checkpoint> {
        let keep = self.checkpoints.len();
        self.truncate_to(keep);
        if keep > self.revision_start {
            self.checkpoints.last()
        } else {
            None
        }
    }

    fn current_revision_first_position(&self) -> u64 {
        self.checkpoints
            .get(self.revision_start)
            .map_or(self.next_position, |c| c.position)
    }

    /// 保留前 keep 个检查点，按最后一个保留检查点的 completed 集恢复节点状态
    fn truncate_to(&mut self, keep: usize) {
        let keep = keep.max(self.revision_start);
        let completed: BTreeSet<String> = if keep > self.revision_start {
            self.checkpoints[keep - 1].completed.clone()
        } else {
            BTreeSet::new()
        };
        let dropped = self.checkpoints.len().saturating_sub(keep);
        self.checkpoints.truncate(keep);
        for node in &self.roadmap.nodes {
            self.statuses[node.index] = if completed.contains(&node.key) {
                SubtaskStatus::Succeeded
            } else {
                SubtaskStatus::Pending
            };
        }
        self.cursor = 0;
        self.advance_cursor();
        tracing::warn!(
            revision = self.roadmap.revision,
            dropped_checkpoints = dropped,
            resume_at = ?self.expected_node().map(|i| self.roadmap.key_of(i).to_string()),
            "rolled back"
        );
    }

    /// 换上重规划得到的新路线图；完成的 key 延续到后续检查点
    pub fn replace_roadmap(&mut self, roadmap: Roadmap) {
        self.carried = self.completed_keys();
        self.statuses = vec![SubtaskStatus::Pending; roadmap.len()];
        self.roadmap = roadmap;
        self.cursor = 0;
        self.revision_start = self.checkpoints.len();
        tracing::info!(
            revision = self.roadmap.revision,
            carried = self.carried.len(),
            "roadmap replaced"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskId;
    use crate::planner::roadmap::RoadmapGenerator;
    use crate::planner::types::Subtask;
    use serde_json::Value;

    fn tid() -> TaskId {
        TaskId::from("task_k")
    }

    fn roadmap(revision: u32) -> Roadmap {
        let nodes = vec![
            Subtask::new(0, "s1", tid(), "create file A"),
            Subtask::new(1, "s2", tid(), "read file A").with_dependency(0),
            Subtask::new(2, "s3", tid(), "report the contents").with_dependency(1),
        ];
        RoadmapGenerator::default().generate(&tid(), nodes, revision).unwrap()
    }

    fn action(node: &str, summary: &str) -> PlannedAction {
        PlannedAction {
            node: node.to_string(),
            tool: "echo".to_string(),
            summary: summary.to_string(),
            input: Value::Null,
        }
    }

    fn complete(keeper: &mut TrackKeeper, index: usize) {
        keeper.mark_running(index).unwrap();
        keeper.mark_succeeded(index).unwrap();
    }

    #[test]
    fn test_dependencies_gate_running() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        assert!(matches!(keeper.mark_running(1), Err(PlanError::Logic(_))));
        complete(&mut keeper, 0);
        assert!(keeper.mark_running(1).is_ok());
    }

    #[test]
    fn test_checkpoints_strictly_increase() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        for i in 0..3 {
            complete(&mut keeper, i);
        }
        let positions: Vec<u64> = keeper.checkpoints().iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert!(keeper.is_complete());
        assert_eq!(keeper.last_checkpoint().unwrap().completed.len(), 3);
    }

    #[test]
    fn test_deviation_on_wrong_node_and_drifted_summary() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        assert!(keeper.validate_on_track(&action("s1", "create file A")).is_on_track());
        assert!(!keeper.validate_on_track(&action("s2", "read file A")).is_on_track());
        complete(&mut keeper, 0);
        let verdict = keeper.validate_on_track(&action("s2", "delete every backup"));
        assert!(matches!(verdict, TrackVerdict::Deviation { similarity, .. } if similarity < 0.5));
    }

    #[test]
    fn test_rollback_resets_later_nodes() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        complete(&mut keeper, 0);
        complete(&mut keeper, 1);
        keeper.mark_running(2).unwrap();
        keeper.mark_failed(2).unwrap();

        let cp = keeper.rollback_to(1).unwrap().cloned();
        assert_eq!(cp.map(|c| c.node), Some("s1".to_string()));
        assert_eq!(keeper.statuses(), &[SubtaskStatus::Succeeded, SubtaskStatus::Pending, SubtaskStatus::Pending]);
        assert_eq!(keeper.checkpoints().len(), 1);
        assert_eq!(keeper.expected_node(), Some(1));

        // 回滚不复用位置
        complete(&mut keeper, 1);
        assert_eq!(keeper.last_checkpoint().unwrap().position, 3);
    }

    #[test]
    fn test_rollback_to_last_clears_failed_node() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        complete(&mut keeper, 0);
        keeper.mark_running(1).unwrap();
        keeper.mark_failed(1).unwrap();
        let cp = keeper.rollback_to_last().cloned();
        assert_eq!(cp.map(|c| c.position), Some(1));
        assert_eq!(keeper.statuses()[1], SubtaskStatus::Pending);
    }

    #[test]
    fn test_replan_carries_completed_keys() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        complete(&mut keeper, 0);
        let next = {
            let nodes = vec![Subtask::new(0, "r1.s1", tid(), "read file A")];
            RoadmapGenerator::default().generate(&tid(), nodes, 1).unwrap()
        };
        keeper.replace_roadmap(next);
        assert_eq!(keeper.expected_node(), Some(0));
        assert!(keeper.rollback_to_last().is_none());
        complete(&mut keeper, 0);
        let cp = keeper.last_checkpoint().unwrap();
        assert_eq!(cp.position, 2);
        assert_eq!(cp.revision, 1);
        assert!(cp.completed.contains("s1") && cp.completed.contains("r1.s1"));
        assert!(keeper.rollback_to(1).unwrap().is_none());
        assert_eq!(keeper.checkpoints().len(), 1);
    }

    #[test]
    fn test_unknown_position_is_an_error() {
        let mut keeper = TrackKeeper::start(roadmap(0), 0.5);
        complete(&mut keeper, 0);
        assert!(keeper.rollback_to(42).is_err());
    }
}
