//! 状态机：任务状态与子任务状态
//!
//! 任务：PENDING → DECOMPOSING → PLANNING → VALIDATING → EXECUTING → COMPLETED / FAILED / ESCALATED；
//! VALIDATING 可回到 PLANNING（重新生成），EXECUTING 可回到 PLANNING（偏离后重规划）。
//! 子任务：PENDING → RUNNING → SUCCEEDED / FAILED，只有回滚能把节点重置为 PENDING。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::PlanError;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Decomposing,
    Planning,
    Validating,
    Executing,
    Completed,
    Failed,
    Escalated,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Escalated
        )
    }

    /// 是否允许从 self 迁移到 next
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        // 任一非终态都可以失败或升级（取消、致命错误、预算耗尽）
        if matches!(next, Failed | Escalated) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Decomposing)
                | (Decomposing, Planning)
                | (Planning, Validating)
                | (Validating, Planning)
                | (Validating, Executing)
                | (Executing, Planning)
                | (Executing, Completed)
        )
    }

    /// 校验并返回新状态
    pub fn transition(self, next: TaskState) -> Result<TaskState, PlanError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PlanError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Decomposing => "DECOMPOSING",
            TaskState::Planning => "PLANNING",
            TaskState::Validating => "VALIDATING",
            TaskState::Executing => "EXECUTING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Escalated => "ESCALATED",
        };
        f.write_str(s)
    }
}

/// 子任务（路线图节点）状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SubtaskStatus {
    /// 正向迁移；回滚不走这里
    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        matches!(
            (self, next),
            (SubtaskStatus::Pending, SubtaskStatus::Running)
                | (SubtaskStatus::Running, SubtaskStatus::Succeeded)
                | (SubtaskStatus::Running, SubtaskStatus::Failed)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SubtaskStatus::Succeeded | SubtaskStatus::Failed)
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubtaskStatus::Pending => "PENDING",
            SubtaskStatus::Running => "RUNNING",
            SubtaskStatus::Succeeded => "SUCCEEDED",
            SubtaskStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
