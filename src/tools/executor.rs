//! 工具执行器
//!
//! invoke(tool, node, input, timeout, cancel) 在超时内调用工具，同时监听取消令牌；
//! 取消时丢弃工具的部分输出。每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::tools::{RawOutput, Tool, ToolError};

/// 工具执行器：超时 + 取消 + 审计
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 执行工具；timeout 为 None 时用默认超时
    pub async fn invoke(
        &self,
        tool: &Arc<dyn Tool>,
        node: &str,
        input: Value,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<RawOutput, ToolError> {
        let start = Instant::now();
        let input_preview = input_preview(&input);
        let limit = limit.unwrap_or(self.default_timeout);
        let call_token = cancel.child_token();

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                call_token.cancel();
                Err(ToolError::Cancelled)
            }
            r = timeout(limit, tool.invoke(input, call_token.clone())) => match r {
                Ok(inner) => inner,
                Err(_) => {
                    call_token.cancel();
                    Err(ToolError::Timeout(format!("{} exceeded {:?}", tool.name(), limit)))
                }
            },
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(ToolError::Timeout(_)) => (false, "timeout"),
            Err(ToolError::Cancelled) => (false, "cancelled"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name(),
            "node": node,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "input_preview": input_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(30)
    }
}

fn input_preview(input: &Value) -> String {
    let s = input.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Capability;
    use async_trait::async_trait;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps until cancelled"
        }

        fn capability(&self) -> Capability {
            Capability::Shell
        }

        async fn invoke(
            &self,
            _input: Value,
            cancel: CancellationToken,
        ) -> Result<RawOutput, ToolError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(ToolError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(RawOutput::Text("late".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_tool_timeout() {
        let executor = ToolExecutor::new(30);
        let tool: Arc<dyn Tool> = Arc::new(SlowTool);
        let token = CancellationToken::new();
        let result = executor
            .invoke(&tool, "s1", Value::Null, Some(Duration::from_millis(20)), &token)
            .await;
        assert!(matches!(result, Err(ToolError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_discards_output() {
        let executor = ToolExecutor::new(30);
        let tool: Arc<dyn Tool> = Arc::new(SlowTool);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result = executor.invoke(&tool, "s1", Value::Null, None, &token).await;
        assert_eq!(result, Err(ToolError::Cancelled));
    }

    #[test]
    fn test_input_preview_truncates() {
        let long = Value::String("x".repeat(500));
        assert!(input_preview(&long).ends_with("..."));
        assert_eq!(input_preview(&long).chars().count(), 203);
    }
}
