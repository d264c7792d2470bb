//! 推理后端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 InferenceBackend：
//! complete(prompt, context, schema?) 返回结构化 JSON 或纯文本。
//! RetryingBackend 包装任意后端，对超时 / 限流 / 供应商错误做指数退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::LlmSection;
use crate::core::BackoffScheduler;

/// 推理请求失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// 推理响应：带 schema 请求时后端应返回 Structured，否则为 Text
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceResponse {
    Structured(Value),
    Text(String),
}

impl InferenceResponse {
    /// 尝试取 JSON：Structured 直接返回；Text 的全文（可带 ```json 围栏）必须是 JSON
    pub fn into_json(self) -> Option<Value> {
        match self {
            InferenceResponse::Structured(v) => Some(v),
            InferenceResponse::Text(text) => {
                let body = strip_fence(text.trim());
                serde_json::from_str(body).ok()
            }
        }
    }
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// 推理后端 trait
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// 完成一次推理；schema 为 JSON Schema（其 title 标识请求的输出类型）
    async fn complete(
        &self,
        prompt: &str,
        context: &Value,
        schema: Option<&Value>,
    ) -> Result<InferenceResponse, LlmError>;

    fn name(&self) -> &str {
        "backend"
    }
}

/// 重试参数
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: BackoffScheduler,
    pub request_timeout: Duration,
}

impl RetryConfig {
    pub fn from_config(cfg: &LlmSection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff: BackoffScheduler::new(
                Duration::from_millis(cfg.retry_base_delay_ms),
                Duration::from_millis(cfg.retry_max_delay_ms),
                2.0,
                cfg.retry_jitter,
            ),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_config(&LlmSection::default())
    }
}

/// 带超时与重试的后端包装；所有 LlmError 都视为可重试（与工具级恢复策略无关）
pub struct RetryingBackend {
    inner: Arc<dyn InferenceBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn InferenceBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl InferenceBackend for RetryingBackend {
    async fn complete(
        &self,
        prompt: &str,
        context: &Value,
        schema: Option<&Value>,
    ) -> Result<InferenceResponse, LlmError> {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                self.inner.complete(prompt, context, schema),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout(self.config.request_timeout)),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.backoff.delay_for(attempt);
                    tracing::warn!(
                        backend = self.inner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "inference failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
