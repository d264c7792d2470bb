//! Mock / Scripted 推理后端（用于测试与离线运行，无需 API）
//!
//! MockBackend 按请求 schema 的 title 分派：DecompositionOutput 按「then / ;」把描述切成顺序子任务，
//! ActionProposal 从节点描述里抽取工具参数。ScriptedBackend 依次回放预置响应并记录 prompt。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::llm::{InferenceBackend, InferenceResponse, LlmError};
use crate::tools::Capability;

static STEP_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:,\s*and\s+then\b|,\s*then\b|\band\s+then\b|\bthen\b|;)\s*")
        .expect("step separator regex must compile")
});

static FILE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bfile\s+([\w./-]+)").expect("file path regex must compile"));

/// 确定性的本地规划器
#[derive(Debug, Default)]
pub struct MockBackend;

impl MockBackend {
    pub fn new() -> Self {
        Self
    }

    fn extract_path(&self, text: &str) -> Option<String> {
        FILE_PATH
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_end_matches(['.', ',']).to_string())
    }

    fn decompose(&self, context: &Value) -> Value {
        let description = context
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let completed: Vec<String> = context
            .get("completed")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|d| d.as_str().map(|s| s.to_lowercase()))
                    .collect()
            })
            .unwrap_or_default();

        let segments: Vec<&str> = STEP_SEPARATOR
            .split(description)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter(|s| !completed.contains(&s.to_lowercase()))
            .collect();

        let mut subtasks = Vec::new();
        let mut previous: Option<String> = None;
        for (i, segment) in segments.iter().enumerate() {
            let id = format!("s{}", i + 1);
            let (tool, input) = self.tool_for(segment);
            let depends_on: Vec<Value> = previous.iter().map(|p| json!(p)).collect();
            subtasks.push(json!({
                "id": id,
                "description": segment,
                "depends_on": depends_on,
                "tool": tool,
                "input": input,
                "confidence": 0.9,
                "complexity": "simple",
            }));
            previous = Some(id);
        }
        json!({
            "reasoning": "sequential steps in the order given",
            "subtasks": subtasks,
        })
    }

    fn tool_for(&self, segment: &str) -> (&'static str, Value) {
        let path = self.extract_path(segment);
        match (Capability::infer(segment), path) {
            (Some(Capability::FileWrite), Some(path)) => (
                "file_write",
                json!({ "path": path, "content": format!("content of {}", path) }),
            ),
            (Some(Capability::FileRead), Some(path)) => ("file_read", json!({ "path": path })),
            _ => ("echo", json!({ "text": segment })),
        }
    }

    fn propose_action(&self, context: &Value) -> Value {
        let node = context.get("node").and_then(|v| v.as_str()).unwrap_or_default();
        let description = context
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let mut input = serde_json::Map::new();
        if let Some(required) = context.get("required").and_then(|v| v.as_array()) {
            for field in required.iter().filter_map(|f| f.as_str()) {
                let value = match field {
                    "path" => self
                        .extract_path(description)
                        .unwrap_or_else(|| "output.txt".to_string()),
                    _ => description.to_string(),
                };
                input.insert(field.to_string(), Value::String(value));
            }
        }
        json!({
            "subtask": node,
            "summary": description,
            "input": input,
        })
    }
}

fn schema_title(schema: Option<&Value>) -> Option<&str> {
    schema.and_then(|s| s.get("title")).and_then(|t| t.as_str())
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn complete(
        &self,
        _prompt: &str,
        context: &Value,
        schema: Option<&Value>,
    ) -> Result<InferenceResponse, LlmError> {
        match schema_title(schema) {
            Some("DecompositionOutput") => Ok(InferenceResponse::Structured(self.decompose(context))),
            Some("ActionProposal") => Ok(InferenceResponse::Structured(self.propose_action(context))),
            _ => Ok(InferenceResponse::Text("mock response".to_string())),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 按顺序回放预置响应；耗尽后返回 Provider 错误
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<InferenceResponse, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Result<InferenceResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 便捷构造：全部为结构化响应
    pub fn structured(values: Vec<Value>) -> Self {
        Self::new(
            values
                .into_iter()
                .map(|v| Ok(InferenceResponse::Structured(v)))
                .collect(),
        )
    }

    pub fn push(&self, response: Result<InferenceResponse, LlmError>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(response);
        }
    }

    /// 已收到的 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn complete(
        &self,
        prompt: &str,
        _context: &Value,
        _schema: Option<&Value>,
    ) -> Result<InferenceResponse, LlmError> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(LlmError::Provider("script exhausted".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decomposition_schema() -> Value {
        json!({"title": "DecompositionOutput"})
    }

    #[tokio::test]
    async fn test_mock_splits_sequential_steps() {
        let backend = MockBackend::new();
        let ctx = json!({"description": "create file A, then read file A"});
        let r = backend
            .complete("", &ctx, Some(&decomposition_schema()))
            .await
            .unwrap()
            .into_json()
            .unwrap();
        let subtasks = r["subtasks"].as_array().unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0]["tool"], "file_write");
        assert_eq!(subtasks[0]["input"]["path"], "A");
        assert_eq!(subtasks[1]["tool"], "file_read");
        assert_eq!(subtasks[1]["depends_on"], json!(["s1"]));
    }

    #[tokio::test]
    async fn test_mock_skips_completed_steps() {
        let backend = MockBackend::new();
        let ctx = json!({
            "description": "create file A; read file A; say done",
            "completed": ["create file A"],
        });
        let r = backend
            .complete("", &ctx, Some(&decomposition_schema()))
            .await
            .unwrap()
            .into_json()
            .unwrap();
        let subtasks = r["subtasks"].as_array().unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0]["description"], "read file A");
        assert_eq!(subtasks[0]["depends_on"], json!([]));
        assert_eq!(subtasks[1]["tool"], "echo");
    }

    #[tokio::test]
    async fn test_mock_action_proposal_fills_required() {
        let backend = MockBackend::new();
        let ctx = json!({
            "node": "s1",
            "description": "write file notes.txt",
            "required": ["path", "content"],
        });
        let r = backend
            .complete("", &ctx, Some(&json!({"title": "ActionProposal"})))
            .await
            .unwrap()
            .into_json()
            .unwrap();
        assert_eq!(r["subtask"], "s1");
        assert_eq!(r["input"]["path"], "notes.txt");
        assert_eq!(r["input"]["content"], "write file notes.txt");
    }

    #[tokio::test]
    async fn test_scripted_exhaustion() {
        let backend = ScriptedBackend::structured(vec![json!({"x": 1})]);
        assert!(backend.complete("a", &Value::Null, None).await.is_ok());
        assert!(backend.complete("b", &Value::Null, None).await.is_err());
        assert_eq!(backend.prompts(), vec!["a", "b"]);
    }
}
