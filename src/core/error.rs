//! 错误类型与失败类别
//!
//! PlanError 覆盖「分解 → 路线图 → 校验 → 执行」全链路；FailureCategory 决定 RecoverySystem
//! 采用的策略（重试 / 升级 / 重规划 / 终止）。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 失败类别（恢复策略的输入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// 网络 / 超时，指数退避重试
    Transient,
    /// 参数缺失或非法，不自动重试，直接升级
    Config,
    /// 计划层面的不一致在执行期暴露，触发重规划
    Logic,
    /// 不可恢复，立即终止任务
    Fatal,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCategory::Transient => write!(f, "transient"),
            FailureCategory::Config => write!(f, "config"),
            FailureCategory::Logic => write!(f, "logic"),
            FailureCategory::Fatal => write!(f, "fatal"),
        }
    }
}

/// 规划与执行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    /// 携带环上的子任务 key（首尾相同）
    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Execution timeout: {0}")]
    ExecutionTimeout(String),

    #[error("Transient tool error: {0}")]
    TransientTool(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task still running: {0}")]
    TaskRunning(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl PlanError {
    /// 映射到失败类别
    pub fn category(&self) -> FailureCategory {
        match self {
            PlanError::ExecutionTimeout(_) | PlanError::TransientTool(_) => {
                FailureCategory::Transient
            }
            PlanError::Config(_) | PlanError::ToolNotFound(_) => FailureCategory::Config,
            PlanError::Decomposition(_)
            | PlanError::CyclicDependency(_)
            | PlanError::ValidationFailure(_)
            | PlanError::Logic(_) => FailureCategory::Logic,
            PlanError::Fatal(_)
            | PlanError::Cancelled
            | PlanError::TaskNotFound(_)
            | PlanError::TaskRunning(_)
            | PlanError::InvalidTransition { .. } => FailureCategory::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == FailureCategory::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = PlanError::ExecutionTimeout("file_read".to_string());
        assert_eq!(err.category(), FailureCategory::Transient);
        assert!(err.is_transient());
    }

    #[test]
    fn test_tool_not_found_is_config() {
        let err = PlanError::ToolNotFound("teleport".to_string());
        assert_eq!(err.category(), FailureCategory::Config);
    }

    #[test]
    fn test_cycle_message_lists_keys() {
        let err = PlanError::CyclicDependency(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
        assert_eq!(err.category(), FailureCategory::Logic);
    }
}
