//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_PLANNER__*` 覆盖（双下划线表示嵌套，如
//! `BEE_PLANNER__RECOVERY__MAX_RETRIES=5`）。所有段都带默认值，缺省文件也能跑。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub planner: PlannerSection,
    pub validator: ValidatorSection,
    pub tracker: TrackerSection,
    pub executor: ExecutorSection,
    pub recovery: RecoverySection,
    pub results: ResultsSection,
}

/// [llm] 段：推理后端选择、超时与后端自身的重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    /// 推理请求失败（超时 / 限流 / 供应商错误）时的额外重试次数
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
            max_retries: 2,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
            retry_jitter: true,
        }
    }
}

/// [planner] 段：分解数量与嵌套深度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub min_subtasks: usize,
    pub max_subtasks: usize,
    /// 子任务再分解的最大层数（顶层为 1）
    pub max_depth: usize,
    /// 检测到环时是否尝试删除一条最低优先级的边
    pub auto_break_cycles: bool,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            min_subtasks: 1,
            max_subtasks: 20,
            max_depth: 3,
            auto_break_cycles: true,
        }
    }
}

/// [validator] 段：置信度下限、批准阈值、重新生成次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidatorSection {
    pub confidence_floor: f64,
    pub approval_threshold: f64,
    pub retry_limit: u32,
    pub max_chain_steps: usize,
    /// 两段描述的词重叠率达到此值视为「同一目标」
    pub coherence_similarity: f64,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            confidence_floor: 0.3,
            approval_threshold: 0.7,
            retry_limit: 3,
            max_chain_steps: 8,
            coherence_similarity: 0.9,
        }
    }
}

/// 偏离后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationPolicy {
    /// 回滚到最近检查点并重试同一节点
    Rollback,
    /// 以当前检查点为起点重新规划
    Replan,
}

/// [tracker] 段：偏离检测
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    pub similarity_tolerance: f64,
    pub deviation_policy: DeviationPolicy,
    pub max_deviation_recoveries: u32,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            similarity_tolerance: 0.5,
            deviation_policy: DeviationPolicy::Rollback,
            max_deviation_recoveries: 3,
        }
    }
}

/// [executor] 段：并发、超时、工具偏好
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// 全局并发上限（单层并发 = min(层大小, max_workers)）
    pub max_workers: usize,
    pub node_timeout_secs: u64,
    /// 同一能力有多个工具时的优先顺序
    pub tool_preference: Vec<String>,
    /// 内置文件工具的沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 引擎保留的已结束任务数，超出时丢弃最早结束的
    pub retained_tasks: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_workers: 8,
            node_timeout_secs: 30,
            tool_preference: Vec::new(),
            workspace_root: None,
            retained_tasks: 256,
        }
    }
}

/// [recovery] 段：重试预算与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 每个节点在单个工具上的最大尝试次数
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    /// 单个任务允许的重规划次数
    pub max_replans: u32,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            max_replans: 2,
        }
    }
}

/// [results] 段：结果置信度各信号的权重
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultsSection {
    pub tool_success_weight: f64,
    pub non_empty_weight: f64,
    pub no_error_marker_weight: f64,
    pub shape_match_weight: f64,
    pub min_success_confidence: f64,
    /// 输出中出现即视为失败的标记（大小写不敏感）
    pub error_markers: Vec<String>,
}

impl Default for ResultsSection {
    fn default() -> Self {
        Self {
            tool_success_weight: 0.4,
            non_empty_weight: 0.2,
            no_error_marker_weight: 0.2,
            shape_match_weight: 0.2,
            min_success_confidence: 0.6,
            error_markers: vec![
                "error:".into(),
                "traceback".into(),
                "exception:".into(),
                "fatal:".into(),
            ],
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE_PLANNER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_PLANNER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE_PLANNER")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("executor.tool_preference")
            .with_list_parse_key("results.error_markers")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_policy() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.planner.max_subtasks, 20);
        assert_eq!(cfg.planner.max_depth, 3);
        assert_eq!(cfg.validator.retry_limit, 3);
        assert!((cfg.validator.confidence_floor - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.recovery.max_retries, 3);
        assert_eq!(cfg.tracker.deviation_policy, DeviationPolicy::Rollback);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[recovery]\nmax_retries = 5\n\n[tracker]\ndeviation_policy = \"replan\"").unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.recovery.max_retries, 5);
        assert_eq!(cfg.recovery.base_delay_ms, 500);
        assert_eq!(cfg.tracker.deviation_policy, DeviationPolicy::Replan);
        assert_eq!(cfg.planner.max_subtasks, 20);
    }
}
