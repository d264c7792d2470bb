//! 恢复系统
//!
//! 失败先分类（transient / config / logic / fatal），再结合节点的重试预算给出决策：
//! 重试（带退避）、换同能力的备用工具、升级给人、重规划或直接终止。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::RecoverySection;
use crate::core::backoff::BackoffScheduler;
use crate::core::{FailureCategory, PlanError};
use crate::tools::ToolError;

/// 消息关键词 → 类别；严重的在前
const MESSAGE_PATTERNS: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::Fatal,
        &["fatal", "crash", "corrupt", "unrecoverable", "disk full"],
    ),
    (
        FailureCategory::Config,
        &["missing", "invalid parameter", "argument", "not configured", "permission denied"],
    ),
    (
        FailureCategory::Transient,
        &[
            "timeout",
            "timed out",
            "connection",
            "network",
            "temporarily",
            "unavailable",
            "rate limit",
            "throttl",
            "busy",
        ],
    ),
];

/// 按消息内容判定类别，都不命中时视为计划层面的问题
pub fn classify_message(message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map_or(FailureCategory::Logic, |(cat, _)| *cat)
}

/// 工具错误的类别；取消不算失败，返回 None
pub fn classify(err: &ToolError) -> Option<FailureCategory> {
    match err {
        ToolError::Timeout(_) | ToolError::Transient(_) => Some(FailureCategory::Transient),
        ToolError::InvalidInput(_) => Some(FailureCategory::Config),
        ToolError::Fatal(_) => Some(FailureCategory::Fatal),
        ToolError::Failed(msg) => Some(classify_message(msg)),
        ToolError::Cancelled => None,
    }
}

/// 一次失败尝试的记录（进入升级报告与任务快照）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub node: String,
    pub tool: Option<String>,
    /// 该节点上的第几次尝试（跨工具累计）
    pub attempt: u32,
    pub category: FailureCategory,
    pub message: String,
    /// 该次尝试结果的置信度（调用失败为 0）
    pub confidence: f64,
    /// 毫秒时间戳
    pub at: i64,
}

/// 一段时间窗口内的失败统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailurePatterns {
    pub total: usize,
    pub by_category: BTreeMap<FailureCategory, usize>,
    pub by_tool: BTreeMap<String, usize>,
    /// 错误信息中出现最多的词（长度大于 3），至多 5 个
    pub common_terms: Vec<(String, usize)>,
    pub failures_per_minute: f64,
}

impl FailurePatterns {
    /// 统计 now_ms 之前 window 内的失败；tool 为 Some 时只看该工具
    pub fn analyze<'a>(
        records: impl IntoIterator<Item = &'a FailureRecord>,
        tool: Option<&str>,
        window: Duration,
        now_ms: i64,
    ) -> Self {
        let since = now_ms.saturating_sub(i64::try_from(window.as_millis()).unwrap_or(i64::MAX));
        let mut patterns = Self::default();
        let mut terms: BTreeMap<String, usize> = BTreeMap::new();

        let in_scope = records
            .into_iter()
            .filter(|r| r.at >= since)
            .filter(|r| tool.map_or(true, |t| r.tool.as_deref() == Some(t)));
        for record in in_scope {
            patterns.total += 1;
            *patterns.by_category.entry(record.category).or_default() += 1;
            if let Some(t) = &record.tool {
                *patterns.by_tool.entry(t.clone()).or_default() += 1;
            }
            for word in record
                .message
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.chars().count() > 3)
            {
                *terms.entry(word.to_lowercase()).or_default() += 1;
            }
        }

        let mut common: Vec<(String, usize)> = terms.into_iter().collect();
        common.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        common.truncate(5);
        patterns.common_terms = common;

        let minutes = (window.as_secs_f64() / 60.0).max(1.0);
        patterns.failures_per_minute = patterns.total as f64 / minutes;
        patterns
    }

    pub fn count(&self, category: FailureCategory) -> usize {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    /// 根据统计给出改进建议；没有失败时为空
    pub fn suggestions(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.total == 0 {
            return out;
        }
        if self.failures_per_minute > 1.0 {
            out.push(format!(
                "High failure rate ({:.1}/min): check tool and backend health",
                self.failures_per_minute
            ));
        }
        if self.count(FailureCategory::Transient) >= 3 {
            out.push("Repeated transient failures: check network connectivity and external services".into());
        }
        if self.count(FailureCategory::Config) > 0 {
            out.push("Configuration failures: review tool parameters and settings".into());
        }
        if self.count(FailureCategory::Logic) >= 2 {
            out.push("Repeated result mismatches: refine the task description or subtask requirements".into());
        }
        if self.count(FailureCategory::Fatal) > 0 {
            out.push("Fatal failures: inspect the execution environment before resubmitting".into());
        }
        let flaky: Vec<&str> = self
            .by_tool
            .iter()
            .filter(|(_, n)| **n >= 3)
            .map(|(t, _)| t.as_str())
            .collect();
        if !flaky.is_empty() {
            out.push(format!(
                "Tools failing repeatedly: {}; consider a fallback tool or maintenance",
                flaky.join(", ")
            ));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Retry { delay: Duration },
    Fallback { tool: String },
    Escalate,
    Replan,
    Abort,
}

/// 单节点的重试预算；换工具后重新计数
#[derive(Debug, Clone, Default)]
pub struct NodeBudget {
    tool: Option<String>,
    attempts_on_tool: u32,
    total_attempts: u32,
    tried: Vec<String>,
}

impl NodeBudget {
    /// 记录一次在 tool 上的尝试，返回该工具上的尝试次数
    pub fn begin(&mut self, tool: &str) -> u32 {
        if self.tool.as_deref() != Some(tool) {
            self.tool = Some(tool.to_string());
            self.attempts_on_tool = 0;
            if !self.tried.iter().any(|t| t == tool) {
                self.tried.push(tool.to_string());
            }
        }
        self.attempts_on_tool += 1;
        self.total_attempts += 1;
        self.attempts_on_tool
    }

    pub fn attempts_on_tool(&self) -> u32 {
        self.attempts_on_tool
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub fn current_tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    pub fn tried(&self) -> &[String] {
        &self.tried
    }
}

#[derive(Debug, Clone)]
pub struct RecoverySystem {
    max_retries: u32,
    max_replans: u32,
    backoff: BackoffScheduler,
}

impl RecoverySystem {
    pub fn new(max_retries: u32, max_replans: u32, backoff: BackoffScheduler) -> Self {
        Self {
            max_retries: max_retries.max(1),
            max_replans,
            backoff,
        }
    }

    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self::new(cfg.max_retries, cfg.max_replans, BackoffScheduler::from_config(cfg))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_replans(&self) -> u32 {
        self.max_replans
    }

    /// 根据类别、预算、可用备用工具和已用重规划次数给出决策
    ///
    /// alternates 为同能力、尚未尝试过的工具，按偏好排序。
    pub fn decide(
        &self,
        category: FailureCategory,
        budget: &NodeBudget,
        alternates: &[String],
        replans_used: u32,
    ) -> RecoveryDecision {
        let decision = match category {
            FailureCategory::Transient => {
                if budget.attempts_on_tool() < self.max_retries {
                    RecoveryDecision::Retry {
                        delay: self.backoff.delay_for(budget.attempts_on_tool()),
                    }
                } else if let Some(tool) = alternates.first() {
                    RecoveryDecision::Fallback { tool: tool.clone() }
                } else {
                    RecoveryDecision::Escalate
                }
            }
            FailureCategory::Config => RecoveryDecision::Escalate,
            FailureCategory::Logic => {
                if replans_used < self.max_replans {
                    RecoveryDecision::Replan
                } else {
                    RecoveryDecision::Escalate
                }
            }
            FailureCategory::Fatal => RecoveryDecision::Abort,
        };
        tracing::debug!(
            category = %category,
            attempts = budget.attempts_on_tool(),
            tool = ?budget.current_tool(),
            decision = ?decision,
            "recovery decision"
        );
        decision
    }

    /// 退避等待；令牌取消时返回 Cancelled
    pub async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), PlanError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PlanError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Default for RecoverySystem {
    fn default() -> Self {
        Self::from_config(&RecoverySection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(max_retries: u32) -> RecoverySystem {
        RecoverySystem::new(
            max_retries,
            1,
            BackoffScheduler::new(Duration::from_millis(1), Duration::from_millis(5), 2.0, false),
        )
    }

    fn record(tool: &str, category: FailureCategory, message: &str, at: i64) -> FailureRecord {
        FailureRecord {
            node: "s1".into(),
            tool: Some(tool.into()),
            attempt: 1,
            category,
            message: message.into(),
            confidence: 0.0,
            at,
        }
    }

    #[test]
    fn test_failure_patterns_window_and_terms() {
        let now = 10 * 60_000;
        let records = vec![
            record("search", FailureCategory::Transient, "upstream timeout talking to index", now - 1_000),
            record("search", FailureCategory::Transient, "upstream timeout again", now - 2_000),
            record("search", FailureCategory::Transient, "connection reset", now - 3_000),
            record("write_file", FailureCategory::Config, "missing path", now - 4_000),
            // 窗口外
            record("search", FailureCategory::Fatal, "disk full", now - 9 * 60_000),
        ];
        let p = FailurePatterns::analyze(&records, None, Duration::from_secs(120), now);
        assert_eq!(p.total, 4);
        assert_eq!(p.count(FailureCategory::Transient), 3);
        assert_eq!(p.count(FailureCategory::Fatal), 0);
        assert_eq!(p.by_tool.get("search"), Some(&3));
        assert_eq!(p.common_terms[0], ("timeout".to_string(), 2));
        assert_eq!(p.common_terms[1], ("upstream".to_string(), 2));
        assert!((p.failures_per_minute - 2.0).abs() < 1e-9);

        let suggestions = p.suggestions();
        assert!(suggestions.iter().any(|s| s.starts_with("High failure rate")));
        assert!(suggestions.iter().any(|s| s.contains("transient")));
        assert!(suggestions.iter().any(|s| s.starts_with("Configuration")));
        assert!(suggestions.iter().any(|s| s.contains("search")));

        let only_writes = FailurePatterns::analyze(&records, Some("write_file"), Duration::from_secs(120), now);
        assert_eq!(only_writes.total, 1);
        assert!(only_writes.by_tool.get("search").is_none());
    }

    #[test]
    fn test_no_failures_no_suggestions() {
        let p = FailurePatterns::analyze(&Vec::<FailureRecord>::new(), None, Duration::from_secs(3600), 0);
        assert_eq!(p.total, 0);
        assert!(p.suggestions().is_empty());
    }

    #[test]
    fn test_classify_variants() {
        assert_eq!(classify(&ToolError::Timeout("x".into())), Some(FailureCategory::Transient));
        assert_eq!(classify(&ToolError::InvalidInput("x".into())), Some(FailureCategory::Config));
        assert_eq!(classify(&ToolError::Fatal("x".into())), Some(FailureCategory::Fatal));
        assert_eq!(classify(&ToolError::Cancelled), None);
    }

    #[test]
    fn test_classify_message_keywords() {
        assert_eq!(classify_message("Connection reset by peer"), FailureCategory::Transient);
        assert_eq!(classify_message("service temporarily unavailable"), FailureCategory::Transient);
        assert_eq!(classify_message("missing argument: path"), FailureCategory::Config);
        assert_eq!(classify_message("database corrupt"), FailureCategory::Fatal);
        assert_eq!(classify_message("fatal: network down"), FailureCategory::Fatal);
        assert_eq!(classify_message("expected a number, got prose"), FailureCategory::Logic);
    }

    #[test]
    fn test_transient_retries_until_budget_exhausted() {
        let rs = system(3);
        let mut budget = NodeBudget::default();
        let mut decisions = Vec::new();
        for _ in 0..3 {
            budget.begin("slow");
            decisions.push(rs.decide(FailureCategory::Transient, &budget, &[], 0));
        }
        assert!(matches!(decisions[0], RecoveryDecision::Retry { .. }));
        assert!(matches!(decisions[1], RecoveryDecision::Retry { .. }));
        assert_eq!(decisions[2], RecoveryDecision::Escalate);
        assert_eq!(budget.total_attempts(), 3);
    }

    #[test]
    fn test_fallback_gets_fresh_budget() {
        let rs = system(2);
        let mut budget = NodeBudget::default();
        budget.begin("primary");
        budget.begin("primary");
        let alternates = vec!["backup".to_string()];
        assert_eq!(
            rs.decide(FailureCategory::Transient, &budget, &alternates, 0),
            RecoveryDecision::Fallback { tool: "backup".into() }
        );
        assert_eq!(budget.begin("backup"), 1);
        assert!(matches!(
            rs.decide(FailureCategory::Transient, &budget, &[], 0),
            RecoveryDecision::Retry { .. }
        ));
        assert_eq!(budget.tried(), &["primary".to_string(), "backup".to_string()]);
    }

    #[test]
    fn test_policy_per_category() {
        let rs = system(3);
        let budget = NodeBudget::default();
        assert_eq!(rs.decide(FailureCategory::Config, &budget, &[], 0), RecoveryDecision::Escalate);
        assert_eq!(rs.decide(FailureCategory::Fatal, &budget, &[], 0), RecoveryDecision::Abort);
        assert_eq!(rs.decide(FailureCategory::Logic, &budget, &[], 0), RecoveryDecision::Replan);
        assert_eq!(rs.decide(FailureCategory::Logic, &budget, &[], 1), RecoveryDecision::Escalate);
    }

    #[tokio::test]
    async fn test_pause_observes_cancel() {
        let rs = system(3);
        let token = CancellationToken::new();
        token.cancel();
        let r = rs.pause(Duration::from_secs(10), &token).await;
        assert_eq!(r, Err(PlanError::Cancelled));
    }
}
