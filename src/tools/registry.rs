//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / capability / schema / invoke），由 ToolRegistry 按名注册，
//! 并按能力（Capability）解析出候选工具列表；ToolExecutor 在调用时加超时与取消。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::DataType;

/// 已知的工具能力类别（路由时按能力匹配，而不是按名字猜）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FileRead,
    FileWrite,
    Shell,
    WebSearch,
    Calculation,
    HumanInput,
    Browser,
    Email,
    CodeExecution,
    /// 纯文本处理 / 回显
    Text,
}

/// 关键词 → 能力，按顺序匹配，先命中先得
const CAPABILITY_KEYWORDS: &[(Capability, &[&str])] = &[
    (Capability::Email, &["email", "mail", "inbox"]),
    (Capability::Browser, &["browser", "navigate", "click", "webpage"]),
    (Capability::WebSearch, &["search", "research", "lookup", "google"]),
    (Capability::Calculation, &["calculate", "compute", "sum", "math", "multiply"]),
    (Capability::HumanInput, &["ask", "confirm", "approval", "approve"]),
    (Capability::CodeExecution, &["python", "script", "evaluate"]),
    (Capability::FileWrite, &["create", "write", "save", "append", "store"]),
    (Capability::FileRead, &["read", "open", "cat", "load", "inspect"]),
    (Capability::Shell, &["run", "execute", "install", "command", "shell"]),
    (Capability::Text, &["echo", "say", "print", "summarize", "report", "reply"]),
];

impl Capability {
    /// 从描述里的关键词推断能力（子任务未显式声明时使用）
    pub fn infer(description: &str) -> Option<Capability> {
        let words: Vec<String> = description
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect();
        CAPABILITY_KEYWORDS
            .iter()
            .find(|(_, keywords)| words.iter().any(|w| keywords.contains(&w.as_str())))
            .map(|(cap, _)| *cap)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::FileRead => "file_read",
            Capability::FileWrite => "file_write",
            Capability::Shell => "shell",
            Capability::WebSearch => "web_search",
            Capability::Calculation => "calculation",
            Capability::HumanInput => "human_input",
            Capability::Browser => "browser",
            Capability::Email => "email",
            Capability::CodeExecution => "code_execution",
            Capability::Text => "text",
        }
    }
}

/// 工具原始输出
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

impl RawOutput {
    pub fn is_empty(&self) -> bool {
        match self {
            RawOutput::Text(s) => s.trim().is_empty(),
            RawOutput::Json(v) => match v {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            },
            RawOutput::Binary(b) => b.is_empty(),
        }
    }

    /// 文本视图（二进制只给出长度）
    pub fn as_text(&self) -> String {
        match self {
            RawOutput::Text(s) => s.clone(),
            RawOutput::Json(v) => v.to_string(),
            RawOutput::Binary(b) => format!("<{} bytes>", b.len()),
        }
    }
}

/// 工具执行错误；Failed 的具体类别由 RecoverySystem 按消息内容判定
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Failed(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

/// 工具 trait：名称、能力、输入/输出声明、可取消的异步调用
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（子任务的 tool 提示引用它）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    fn capability(&self) -> Capability;

    /// 输入 JSON Schema；Orchestrator 依据 required 字段做检查
    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 声明的输出形态；None 表示交给 ResultProcessor 嗅探
    fn output_type(&self) -> Option<DataType> {
        None
    }

    /// 单个任务内允许的最大调用次数（资源限制），None 为不限
    fn max_invocations(&self) -> Option<usize> {
        None
    }

    /// 执行工具；cancel 触发时应尽快返回，部分输出丢弃
    async fn invoke(&self, input: Value, cancel: CancellationToken)
        -> Result<RawOutput, ToolError>;
}

/// 工具注册表：保留注册顺序，支持按名查找与按能力解析
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具会被替换（保留原位置）
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.by_name.get(&name) {
            Some(&idx) => self.tools[idx] = tool,
            None => {
                self.by_name.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| self.tools[idx].clone())
    }

    /// 按能力取第一个注册的工具
    pub fn resolve(&self, capability: Capability) -> Option<Arc<dyn Tool>> {
        self.tools
            .iter()
            .find(|t| t.capability() == capability)
            .cloned()
    }

    /// 某能力的全部候选：先按 preference 中的顺序，其余按注册顺序
    pub fn candidates(&self, capability: Capability, preference: &[String]) -> Vec<Arc<dyn Tool>> {
        let mut matching: Vec<(usize, Arc<dyn Tool>)> = self
            .tools
            .iter()
            .enumerate()
            .filter(|(_, t)| t.capability() == capability)
            .map(|(i, t)| (i, t.clone()))
            .collect();
        matching.sort_by_key(|(registered, tool)| {
            let rank = preference
                .iter()
                .position(|p| p == tool.name())
                .unwrap_or(usize::MAX);
            (rank, *registered)
        });
        matching.into_iter().map(|(_, t)| t).collect()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.tools.iter().any(|t| t.capability() == capability)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 工具目录 JSON（拼入分解 prompt，让模型只引用真实存在的工具）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "capability": tool.capability(),
                    "description": tool.description(),
                    "input": tool.input_schema(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedTool(&'static str, Capability);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn capability(&self) -> Capability {
            self.1
        }

        async fn invoke(
            &self,
            _input: Value,
            _cancel: CancellationToken,
        ) -> Result<RawOutput, ToolError> {
            Ok(RawOutput::Text(self.0.to_string()))
        }
    }

    #[test]
    fn test_infer_capability_from_description() {
        assert_eq!(Capability::infer("create file A"), Some(Capability::FileWrite));
        assert_eq!(Capability::infer("Read file A"), Some(Capability::FileRead));
        assert_eq!(Capability::infer("search the web for rust news"), Some(Capability::WebSearch));
        assert_eq!(Capability::infer("contemplate"), None);
    }

    #[test]
    fn test_candidates_follow_preference_then_registration() {
        let mut registry = ToolRegistry::new();
        registry.register(NamedTool("local_fs", Capability::FileRead));
        registry.register(NamedTool("echo", Capability::Text));
        registry.register(NamedTool("remote_fs", Capability::FileRead));

        let names = |prefs: &[String]| -> Vec<String> {
            registry
                .candidates(Capability::FileRead, prefs)
                .iter()
                .map(|t| t.name().to_string())
                .collect()
        };
        assert_eq!(names(&[]), vec!["local_fs", "remote_fs"]);
        assert_eq!(names(&["remote_fs".to_string()]), vec!["remote_fs", "local_fs"]);
        assert_eq!(registry.resolve(Capability::FileRead).unwrap().name(), "local_fs");
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(NamedTool("echo", Capability::Text));
        registry.register(NamedTool("echo", Capability::Shell));
        assert_eq!(registry.len(), 1);
        assert!(registry.has_capability(Capability::Shell));
        assert!(!registry.has_capability(Capability::Text));
    }

    #[test]
    fn test_raw_output_emptiness() {
        assert!(RawOutput::Text("  ".into()).is_empty());
        assert!(RawOutput::Json(Value::Null).is_empty());
        assert!(!RawOutput::Json(serde_json::json!({"a": 1})).is_empty());
        assert_eq!(RawOutput::Binary(vec![1, 2]).as_text(), "<2 bytes>");
    }
}
