//! 引擎构建器：统一的初始化逻辑
//!
//! CLI 与测试共用：未显式注入的部件按配置补齐（推理后端、内置工具、进程内记忆）。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::coordinator::{EngineParts, TaskEngine};
use crate::human::HumanInput;
use crate::llm::{create_backend, InferenceBackend};
use crate::memory::{InMemoryStore, MemoryStore};
use crate::tools::{builtin_registry, ToolRegistry};

pub struct EngineBuilder {
    config: AppConfig,
    workspace: PathBuf,
    backend: Option<Arc<dyn InferenceBackend>>,
    registry: Option<ToolRegistry>,
    memory: Option<Arc<dyn MemoryStore>>,
    human: Option<Arc<dyn HumanInput>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            backend: None,
            registry: None,
            memory: None,
            human: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 替换默认工具集
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_human(mut self, human: Arc<dyn HumanInput>) -> Self {
        self.human = Some(human);
        self
    }

    /// 内置工具，文件工具沙箱在 workspace 下
    pub fn build_tool_registry(&self) -> ToolRegistry {
        builtin_registry(&self.workspace)
    }

    pub fn build(self) -> EngineParts {
        let registry = match self.registry {
            Some(r) => r,
            None => builtin_registry(&self.workspace),
        };
        tracing::info!(
            tools = ?registry.tool_names(),
            workspace = %self.workspace.display(),
            "engine components ready"
        );
        EngineParts {
            backend: self
                .backend
                .unwrap_or_else(|| create_backend(&self.config.llm)),
            registry: Arc::new(registry),
            memory: self
                .memory
                .unwrap_or_else(|| Arc::new(InMemoryStore::default())),
            human: self.human,
            config: self.config,
        }
    }

    pub fn build_engine(self) -> TaskEngine {
        TaskEngine::new(self.build())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// 便捷函数：加载配置（失败则用默认值），准备工作目录
pub fn create_engine_builder(config_path: Option<PathBuf>) -> EngineBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = config.executor.workspace_root.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("workspace")
    });
    std::fs::create_dir_all(&workspace).ok();
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.clone());

    EngineBuilder::new(config, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;

    #[test]
    fn test_defaults_fill_missing_parts() {
        let dir = tempfile::tempdir().unwrap();
        let parts = EngineBuilder::new(AppConfig::default(), dir.path().to_path_buf())
            .with_backend(Arc::new(MockBackend::new()))
            .build();
        assert_eq!(parts.backend.name(), "mock");
        assert!(parts.registry.get("file_write").is_some());
        assert!(parts.registry.get("file_read").is_some());
        assert!(parts.human.is_none());
    }

    #[test]
    fn test_custom_registry_replaces_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::EchoTool);
        let parts = EngineBuilder::new(AppConfig::default(), dir.path().to_path_buf())
            .with_backend(Arc::new(MockBackend::new()))
            .with_registry(registry)
            .build();
        assert_eq!(parts.registry.tool_names(), vec!["echo".to_string()]);
    }
}
