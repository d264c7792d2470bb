//! Echo 工具：回显文本（文本类子任务的兜底工具）

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::tools::schema::{object_schema, DataType};
use crate::tools::{Capability, RawOutput, Tool, ToolError};

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn capability(&self) -> Capability {
        Capability::Text
    }

    fn input_schema(&self) -> Value {
        object_schema(&[("text", "string", "text to echo")], &[])
    }

    fn output_type(&self) -> Option<DataType> {
        Some(DataType::Text)
    }

    async fn invoke(&self, input: Value, _cancel: CancellationToken) -> Result<RawOutput, ToolError> {
        let text = match &input {
            Value::String(s) => s.clone(),
            other => other
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("(empty)")
                .to_string(),
        };
        Ok(RawOutput::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_text_field() {
        let out = EchoTool
            .invoke(serde_json::json!({"text": "hi"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, RawOutput::Text("hi".into()));
    }

    #[tokio::test]
    async fn test_echo_without_text() {
        let out = EchoTool
            .invoke(Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.as_text(), "(empty)");
    }
}
