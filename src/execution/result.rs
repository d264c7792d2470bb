//! 结果处理器
//!
//! 工具原始输出 → ExecutionResult：
//! 1. 形态：子任务 expected_output，其次工具 output_type，都没有时按内容嗅探
//! 2. 按形态解析出结构化值，解析失败即形态不符
//! 3. 置信度 = Σ 权重·信号（工具成功、非空、无错误标记、形态相符）

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::config::ResultsSection;
use crate::core::recovery::{classify, classify_message};
use crate::core::FailureCategory;
use crate::tools::{DataType, RawOutput, ToolError};

static JSON_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[\{\[]").expect("json pattern must compile"));
static HTML_DOC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*(<!doctype\s+html|<html\b|<(head|body|div|p|span|table|ul|h[1-6])\b)")
        .expect("html pattern must compile")
});
static XML_DOC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*(<\?xml\b|<[A-Za-z_][\w:.-]*(\s[^>]*)?>.*</[A-Za-z_][\w:.-]*>\s*$)")
        .expect("xml pattern must compile")
});
static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*-?\d+(\.\d+)?([eE][+-]?\d+)?\s*$").expect("number pattern must compile")
});
static BOOLEAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(true|false)\s*$").expect("boolean pattern must compile"));

/// 一次节点执行的处理结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// 原始输出的文本视图（二进制只记录长度）
    pub raw: String,
    pub structured: Value,
    pub data_type: DataType,
    pub confidence: f64,
    pub retry_recommended: bool,
    pub error_category: Option<FailureCategory>,
    pub message: Option<String>,
}

impl ExecutionResult {
    /// 没有可用输出的失败结果（调用前的检查失败也用它）
    pub fn failure(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            success: false,
            raw: String::new(),
            structured: Value::Null,
            data_type: DataType::Text,
            confidence: 0.0,
            retry_recommended: category == FailureCategory::Transient,
            error_category: Some(category),
            message: Some(message.into()),
        }
    }

    /// 工具调用本身失败时的结果
    pub fn from_tool_error(err: &ToolError) -> Self {
        Self::failure(
            classify(err).unwrap_or(FailureCategory::Logic),
            err.to_string(),
        )
    }

    pub fn category(&self) -> FailureCategory {
        self.error_category.unwrap_or(FailureCategory::Logic)
    }

    pub fn failure_message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "result rejected".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ResultProcessor {
    cfg: ResultsSection,
    markers: Vec<String>,
}

impl ResultProcessor {
    pub fn new(cfg: ResultsSection) -> Self {
        let markers = cfg.error_markers.iter().map(|m| m.to_lowercase()).collect();
        Self { cfg, markers }
    }

    /// 处理一次成功返回的工具输出
    pub fn process(&self, raw: &RawOutput, expected: Option<DataType>) -> ExecutionResult {
        let data_type = expected.unwrap_or_else(|| sniff(raw));
        let parsed = parse_as(raw, data_type);
        let text = raw.as_text();
        let non_empty = !raw.is_empty();
        let marker = self.find_marker(raw);
        let shape_ok = parsed.is_ok();

        let confidence = (self.cfg.tool_success_weight
            + signal(non_empty) * self.cfg.non_empty_weight
            + signal(marker.is_none()) * self.cfg.no_error_marker_weight
            + signal(shape_ok) * self.cfg.shape_match_weight)
            .clamp(0.0, 1.0);

        let (error_category, message) = if !non_empty {
            (
                Some(FailureCategory::Transient),
                Some("tool returned empty output".to_string()),
            )
        } else if let Some(line) = &marker {
            (Some(classify_message(line)), Some(format!("error marker in output: {}", line)))
        } else if let Err(e) = &parsed {
            (Some(FailureCategory::Logic), Some(e.clone()))
        } else if confidence < self.cfg.min_success_confidence {
            (
                Some(FailureCategory::Logic),
                Some(format!(
                    "confidence {:.2} below {:.2}",
                    confidence, self.cfg.min_success_confidence
                )),
            )
        } else {
            (None, None)
        };

        ExecutionResult {
            success: error_category.is_none(),
            raw: text,
            structured: parsed.unwrap_or(Value::Null),
            data_type,
            confidence,
            retry_recommended: error_category == Some(FailureCategory::Transient),
            error_category,
            message,
        }
    }

    /// 第一条含错误标记的行（二进制不检查）
    fn find_marker(&self, raw: &RawOutput) -> Option<String> {
        if matches!(raw, RawOutput::Binary(_)) {
            return None;
        }
        let text = raw.as_text();
        text.lines()
            .find(|line| {
                let lower = line.to_lowercase();
                self.markers.iter().any(|m| lower.contains(m.as_str()))
            })
            .map(|line| line.trim().to_string())
    }
}

impl Default for ResultProcessor {
    fn default() -> Self {
        Self::new(ResultsSection::default())
    }
}

fn signal(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// 按内容嗅探输出形态
pub fn sniff(raw: &RawOutput) -> DataType {
    match raw {
        RawOutput::Binary(_) => DataType::Binary,
        RawOutput::Json(Value::Number(_)) => DataType::Number,
        RawOutput::Json(Value::Bool(_)) => DataType::Boolean,
        RawOutput::Json(Value::String(s)) => sniff_text(s),
        RawOutput::Json(_) => DataType::Json,
        RawOutput::Text(s) => sniff_text(s),
    }
}

fn sniff_text(s: &str) -> DataType {
    if JSON_START.is_match(s) && serde_json::from_str::<Value>(s.trim()).is_ok() {
        DataType::Json
    } else if HTML_DOC.is_match(s) {
        DataType::Html
    } else if XML_DOC.is_match(s) {
        DataType::Xml
    } else if NUMBER.is_match(s) {
        DataType::Number
    } else if BOOLEAN.is_match(s) {
        DataType::Boolean
    } else if parse_csv(s).is_some() {
        DataType::Csv
    } else {
        DataType::Text
    }
}

/// 按声明的形态解析；Err 里是形态不符的原因
pub fn parse_as(raw: &RawOutput, data_type: DataType) -> Result<Value, String> {
    let mismatch = || format!("output is not valid {}", data_type);
    match (raw, data_type) {
        (RawOutput::Binary(b), DataType::Binary) => Ok(serde_json::json!({ "bytes": b.len() })),
        (RawOutput::Binary(_), _) => Err(mismatch()),
        (_, DataType::Binary) => Err(mismatch()),
        (RawOutput::Json(v), DataType::Json) => Ok(v.clone()),
        (RawOutput::Json(Value::Number(n)), DataType::Number) => {
            n.as_f64().map(Value::from).ok_or_else(mismatch)
        }
        (RawOutput::Json(Value::Bool(b)), DataType::Boolean) => Ok(Value::Bool(*b)),
        (RawOutput::Json(Value::String(s)), _) | (RawOutput::Text(s), _) => {
            parse_text(s, data_type).ok_or_else(mismatch)
        }
        (RawOutput::Json(v), DataType::Text) => Ok(Value::String(v.to_string())),
        (RawOutput::Json(_), _) => Err(mismatch()),
    }
}

fn parse_text(s: &str, data_type: DataType) -> Option<Value> {
    let trimmed = s.trim();
    match data_type {
        DataType::Text => Some(Value::String(s.to_string())),
        DataType::Json => serde_json::from_str(trimmed).ok(),
        DataType::Number => {
            if NUMBER.is_match(trimmed) {
                trimmed.parse::<f64>().ok().map(Value::from)
            } else {
                None
            }
        }
        DataType::Boolean => match trimmed.to_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        DataType::Csv => parse_csv(s),
        DataType::Html => HTML_DOC.is_match(s).then(|| Value::String(s.to_string())),
        DataType::Xml => XML_DOC.is_match(s).then(|| Value::String(s.to_string())),
        DataType::Binary => None,
    }
}

/// 至少两行、每行列数一致且大于 1 才算 CSV
fn parse_csv(s: &str) -> Option<Value> {
    let rows: Vec<Vec<String>> = s
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.split(',').map(|c| c.trim().to_string()).collect())
        .collect();
    let width = rows.first()?.len();
    if rows.len() < 2 || width < 2 || rows.iter().any(|r| r.len() != width) {
        return None;
    }
    Some(Value::Array(
        rows.into_iter()
            .map(|r| Value::Array(r.into_iter().map(Value::String).collect()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> RawOutput {
        RawOutput::Text(s.to_string())
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff(&text(r#"{"a": 1}"#)), DataType::Json);
        assert_eq!(sniff(&text("<html><body>hi</body></html>")), DataType::Html);
        assert_eq!(sniff(&text("<note><to>A</to></note>")), DataType::Xml);
        assert_eq!(sniff(&text(" 42.5 ")), DataType::Number);
        assert_eq!(sniff(&text("TRUE")), DataType::Boolean);
        assert_eq!(sniff(&text("a,b\n1,2\n3,4")), DataType::Csv);
        assert_eq!(sniff(&text("hello, world")), DataType::Text);
        assert_eq!(sniff(&RawOutput::Binary(vec![1, 2])), DataType::Binary);
        assert_eq!(sniff(&RawOutput::Json(json!(3))), DataType::Number);
    }

    #[test]
    fn test_clean_text_succeeds_with_full_confidence() {
        let rp = ResultProcessor::default();
        let r = rp.process(&text("content of A"), Some(DataType::Text));
        assert!(r.success);
        assert!((r.confidence - 1.0).abs() < 1e-9);
        assert_eq!(r.structured, json!("content of A"));
        assert!(r.error_category.is_none());
    }

    #[test]
    fn test_csv_structured_rows() {
        let rp = ResultProcessor::default();
        let r = rp.process(&text("name,qty\napple,3"), None);
        assert_eq!(r.data_type, DataType::Csv);
        assert_eq!(r.structured, json!([["name", "qty"], ["apple", "3"]]));
    }

    #[test]
    fn test_empty_output_is_transient() {
        let rp = ResultProcessor::default();
        let r = rp.process(&text("   "), None);
        assert!(!r.success);
        assert!(r.retry_recommended);
        assert_eq!(r.error_category, Some(FailureCategory::Transient));
    }

    #[test]
    fn test_error_marker_classified_by_line() {
        let rp = ResultProcessor::default();
        let r = rp.process(&text("step 1 ok\nError: connection refused"), None);
        assert!(!r.success);
        assert_eq!(r.error_category, Some(FailureCategory::Transient));
        assert!((r.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_shape_mismatch_is_logic() {
        let rp = ResultProcessor::default();
        let r = rp.process(&text("not a number"), Some(DataType::Number));
        assert!(!r.success);
        assert_eq!(r.error_category, Some(FailureCategory::Logic));
        assert!((r.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_binary_summary() {
        let rp = ResultProcessor::default();
        let r = rp.process(&RawOutput::Binary(vec![0; 16]), None);
        assert!(r.success);
        assert_eq!(r.structured, json!({"bytes": 16}));
    }

    #[test]
    fn test_tool_error_result() {
        let r = ExecutionResult::from_tool_error(&ToolError::Timeout("slow".into()));
        assert!(!r.success);
        assert!(r.retry_recommended);
        assert_eq!(r.error_category, Some(FailureCategory::Transient));
        assert_eq!(r.confidence, 0.0);

        let r = ExecutionResult::from_tool_error(&ToolError::InvalidInput("path".into()));
        assert_eq!(r.category(), FailureCategory::Config);
        assert!(!r.retry_recommended);
        assert!(r.failure_message().contains("path"));
    }
}
