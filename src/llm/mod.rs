//! 推理层：后端抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockBackend, ScriptedBackend};
pub use openai::{OpenAiBackend, TokenUsage};
pub use traits::{InferenceBackend, InferenceResponse, LlmError, RetryConfig, RetryingBackend};

use crate::config::LlmSection;

/// 按配置构造后端：provider = openai 且存在 OPENAI_API_KEY 时走 OpenAI，否则 Mock；外层统一包重试
pub fn create_backend(cfg: &LlmSection) -> Arc<dyn InferenceBackend> {
    let inner: Arc<dyn InferenceBackend> =
        if cfg.provider == "openai" && std::env::var("OPENAI_API_KEY").is_ok() {
            tracing::info!(model = %cfg.model, "using openai backend");
            Arc::new(OpenAiBackend::new(cfg.base_url.as_deref(), &cfg.model, None))
        } else {
            if cfg.provider == "openai" {
                tracing::warn!("OPENAI_API_KEY not set, falling back to mock backend");
            }
            Arc::new(MockBackend::new())
        };
    Arc::new(RetryingBackend::new(inner, RetryConfig::from_config(cfg)))
}
