//! 任务监管：根取消令牌 + 每个任务一个子令牌
//!
//! 取消根令牌会级联到所有任务（进程退出）；cancel(task_id) 只取消该任务的子令牌。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::TaskId;

#[derive(Debug, Default)]
pub struct TaskSupervisor {
    root: CancellationToken,
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 为任务创建子令牌（重复调用返回同一个）
    pub fn register(&self, task_id: &TaskId) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(task_id.clone())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 取消单个任务；未知任务返回 false
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 任务结束后移除令牌
    pub fn release(&self, task_id: &TaskId) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(task_id);
    }

    /// 取消全部任务
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_per_task() {
        let sup = TaskSupervisor::new();
        let a = sup.register(&TaskId::from("a"));
        let b = sup.register(&TaskId::from("b"));
        assert!(sup.cancel(&TaskId::from("a")));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sup.cancel(&TaskId::from("missing")));
    }

    #[test]
    fn test_shutdown_cascades() {
        let sup = TaskSupervisor::new();
        let a = sup.register(&TaskId::from("a"));
        sup.shutdown();
        assert!(a.is_cancelled());
    }
}
