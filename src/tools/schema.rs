//! 工具输入 / 输出声明
//!
//! DataType 是输出形态的封闭集合（子任务的 expected_output 与工具的 output_type 共用）；
//! 输入侧只关心 JSON Schema 的 required 字段，供 Orchestrator 在派发前检查。

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 输出数据形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Json,
    Number,
    Boolean,
    Csv,
    Html,
    Xml,
    Binary,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Text => "text",
            DataType::Json => "json",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Csv => "csv",
            DataType::Html => "html",
            DataType::Xml => "xml",
            DataType::Binary => "binary",
        };
        f.write_str(s)
    }
}

/// 输入 schema 中声明为 required 的字段
pub fn required_fields(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// 返回 input 缺失的 required 字段；input 不是对象时全部视为缺失
pub fn missing_required(schema: &Value, input: &Value) -> Vec<String> {
    let required = required_fields(schema);
    match input.as_object() {
        Some(obj) => required
            .into_iter()
            .filter(|f| obj.get(f).map_or(true, Value::is_null))
            .collect(),
        None => required,
    }
}

/// 简单的对象 schema 构造（内置工具用）
pub fn object_schema(properties: &[(&str, &str, &str)], required: &[&str]) -> Value {
    let mut props = serde_json::Map::new();
    for (name, ty, description) in properties {
        props.insert(
            name.to_string(),
            serde_json::json!({ "type": ty, "description": description }),
        );
    }
    serde_json::json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_required_fields() {
        let schema = object_schema(
            &[("path", "string", "file"), ("content", "string", "body")],
            &["path", "content"],
        );
        assert_eq!(required_fields(&schema), vec!["path", "content"]);
        assert_eq!(missing_required(&schema, &json!({"path": "a.txt"})), vec!["content"]);
        assert!(missing_required(&schema, &json!({"path": "a", "content": ""})).is_empty());
        assert_eq!(missing_required(&schema, &json!("a.txt")).len(), 2);
    }

    #[test]
    fn test_data_type_serde_names() {
        let t: DataType = serde_json::from_value(json!("csv")).unwrap();
        assert_eq!(t, DataType::Csv);
        assert_eq!(DataType::Json.to_string(), "json");
    }
}
