//! 工具编排器
//!
//! - route：显式工具提示优先，否则按能力匹配，同能力多个工具时按 tool_preference 排序
//! - plan_action：节点没有输入且工具声明了必填字段时，请推理后端给出 ActionProposal
//! - execute：必填字段检查 → 主工具 → 工具链
//!   - sequential：上一步结构化输出按字段映射进入下一步
//!   - parallel：各步并发，映射字段都取自主工具输出
//! - run_layer：同层节点在 WorkerPool 许可内并发执行

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;
use crate::core::{FailureCategory, PlanError};
use crate::execution::pool::WorkerPool;
use crate::execution::result::{ExecutionResult, ResultProcessor};
use crate::llm::InferenceBackend;
use crate::planner::{ActionProposal, ChainMode, ChainStep, PlannedAction, Subtask};
use crate::tools::schema::missing_required;
use crate::tools::{DataType, Tool, ToolError, ToolExecutor, ToolRegistry};

/// 单个节点的执行结局
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Succeeded(ExecutionResult),
    Failed {
        /// 出错的工具（链中某一步也可能）
        tool: String,
        category: FailureCategory,
        message: String,
        /// 失败尝试的处理结果
        result: ExecutionResult,
    },
    /// 取消：部分输出已丢弃
    Cancelled,
}

/// 一层中的一个待派发节点
pub struct LayerJob<'a> {
    pub node: &'a Subtask,
    pub action: PlannedAction,
    pub tool: Arc<dyn Tool>,
}

#[derive(Debug, Clone)]
pub struct NodeRun {
    pub index: usize,
    pub key: String,
    pub tool: String,
    pub outcome: NodeOutcome,
}

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    backend: Arc<dyn InferenceBackend>,
    executor: ToolExecutor,
    processor: ResultProcessor,
    preference: Vec<String>,
    max_workers: usize,
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        backend: Arc<dyn InferenceBackend>,
        cfg: &ExecutorSection,
        processor: ResultProcessor,
    ) -> Self {
        Self {
            registry,
            backend,
            executor: ToolExecutor::new(cfg.node_timeout_secs),
            processor,
            preference: cfg.tool_preference.clone(),
            max_workers: cfg.max_workers.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 为节点选主工具
    pub fn route(&self, node: &Subtask) -> Result<Arc<dyn Tool>, PlanError> {
        if let Some(name) = &node.tool {
            return self
                .registry
                .get(name)
                .ok_or_else(|| PlanError::ToolNotFound(name.clone()));
        }
        let capability = node.effective_capability();
        self.registry
            .candidates(capability, &self.preference)
            .into_iter()
            .next()
            .ok_or_else(|| {
                PlanError::ToolNotFound(format!("no tool provides {}", capability.as_str()))
            })
    }

    /// 同能力、未尝试过的备用工具（按偏好排序）
    pub fn alternates(&self, current: &str, tried: &[String]) -> Vec<String> {
        let Some(tool) = self.registry.get(current) else {
            return Vec::new();
        };
        self.registry
            .candidates(tool.capability(), &self.preference)
            .into_iter()
            .map(|t| t.name().to_string())
            .filter(|name| name != current && !tried.contains(name))
            .collect()
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    /// 生成即将派发的动作
    pub async fn plan_action(
        &self,
        node: &Subtask,
        tool: &Arc<dyn Tool>,
        goal: &str,
        cancel: &CancellationToken,
    ) -> Result<PlannedAction, PlanError> {
        let schema = tool.input_schema();
        let base = node.input.clone().unwrap_or_else(|| json!({}));
        let missing = missing_required(&schema, &base);
        if node.input.is_some() || missing.is_empty() {
            return Ok(PlannedAction {
                node: node.key.clone(),
                tool: tool.name().to_string(),
                summary: node.description.clone(),
                input: base,
            });
        }

        let proposal_schema = serde_json::to_value(schemars::schema_for!(ActionProposal))
            .map_err(|e| PlanError::Logic(e.to_string()))?;
        let context = json!({
            "goal": goal,
            "node": node.key,
            "description": node.description,
            "tool": tool.name(),
            "tool_schema": schema,
            "required": missing,
        });
        let prompt = format!(
            "Propose the input for subtask {} (\"{}\") using tool {}. \
             Reply with a JSON object {{\"subtask\", \"summary\", \"input\"}} only.",
            node.key,
            node.description,
            tool.name()
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PlanError::Cancelled),
            r = self.backend.complete(&prompt, &context, Some(&proposal_schema)) => r,
        }
        .map_err(|e| PlanError::TransientTool(format!("action proposal failed: {}", e)))?;

        let proposal: ActionProposal = response
            .into_json()
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or_else(|| {
                PlanError::Config(format!("no usable input proposed for {}", node.key))
            })?;

        Ok(PlannedAction {
            node: proposal.subtask,
            tool: tool.name().to_string(),
            summary: proposal.summary,
            input: merge(base, proposal.input),
        })
    }

    /// 执行一个节点（含工具链）
    pub async fn execute(
        &self,
        node: &Subtask,
        action: &PlannedAction,
        tool: &Arc<dyn Tool>,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let limit = node.timeout_secs.map(Duration::from_secs);
        let expected = if node.chain.is_empty() { node.expected_output } else { None };

        let first = match self
            .run_step(node, tool, action.input.clone(), expected, limit, cancel)
            .await
        {
            Ok(r) => r,
            Err(outcome) => return outcome,
        };
        if node.chain.is_empty() {
            return NodeOutcome::Succeeded(first);
        }

        let outcome = match node.chain_mode {
            ChainMode::Sequential => self.run_sequential_chain(node, first, limit, cancel).await,
            ChainMode::Parallel => self.run_parallel_chain(node, first, limit, cancel).await,
        };
        match outcome {
            Ok(result) => NodeOutcome::Succeeded(result),
            Err(outcome) => outcome,
        }
    }

    /// 逐步执行：每一步的映射字段取自上一步输出
    async fn run_sequential_chain(
        &self,
        node: &Subtask,
        mut result: ExecutionResult,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, NodeOutcome> {
        for (i, step) in node.chain.iter().enumerate() {
            let expected = if i + 1 == node.chain.len() { node.expected_output } else { None };
            result = self
                .run_chain_step(node, step, &result.structured, expected, limit, cancel)
                .await?;
        }
        Ok(result)
    }

    /// 各步同时执行，映射字段都取自主工具输出；结构化结果按步骤顺序组成数组
    async fn run_parallel_chain(
        &self,
        node: &Subtask,
        first: ExecutionResult,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, NodeOutcome> {
        let source = &first.structured;
        let steps = node
            .chain
            .iter()
            .map(|step| self.run_chain_step(node, step, source, None, limit, cancel));
        let results = join_all(steps).await;

        if results.iter().any(|r| matches!(r, Err(NodeOutcome::Cancelled))) {
            return Err(NodeOutcome::Cancelled);
        }
        let mut outputs = Vec::with_capacity(results.len());
        let mut raws = Vec::with_capacity(results.len());
        let mut confidence = first.confidence;
        for result in results {
            let result = result?;
            confidence = confidence.min(result.confidence);
            raws.push(result.raw);
            outputs.push(result.structured);
        }
        tracing::debug!(node = %node.key, steps = outputs.len(), "parallel chain finished");
        Ok(ExecutionResult {
            success: true,
            raw: raws.join("\n"),
            structured: Value::Array(outputs),
            data_type: DataType::Json,
            confidence,
            retry_recommended: false,
            error_category: None,
            message: None,
        })
    }

    async fn run_chain_step(
        &self,
        node: &Subtask,
        step: &ChainStep,
        source: &Value,
        expected: Option<DataType>,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, NodeOutcome> {
        let Some(step_tool) = self.registry.get(&step.tool) else {
            return Err(failed(
                &step.tool,
                ExecutionResult::failure(
                    FailureCategory::Config,
                    PlanError::ToolNotFound(step.tool.clone()).to_string(),
                ),
            ));
        };
        let input = chain_input(step, source).map_err(|message| {
            failed(&step.tool, ExecutionResult::failure(FailureCategory::Config, message))
        })?;
        self.run_step(node, &step_tool, input, expected, limit, cancel)
            .await
    }

    async fn run_step(
        &self,
        node: &Subtask,
        tool: &Arc<dyn Tool>,
        input: Value,
        expected: Option<DataType>,
        limit: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, NodeOutcome> {
        let name = tool.name();
        let missing = missing_required(&tool.input_schema(), &input);
        if !missing.is_empty() {
            return Err(failed(
                name,
                ExecutionResult::failure(
                    FailureCategory::Config,
                    format!("missing required input: {}", missing.join(", ")),
                ),
            ));
        }

        match self.executor.invoke(tool, &node.key, input, limit, cancel).await {
            Ok(raw) => {
                let result = self
                    .processor
                    .process(&raw, expected.or_else(|| tool.output_type()));
                if result.success {
                    Ok(result)
                } else {
                    Err(failed(name, result))
                }
            }
            Err(ToolError::Cancelled) => Err(NodeOutcome::Cancelled),
            Err(e) => Err(failed(name, ExecutionResult::from_tool_error(&e))),
        }
    }

    /// 并发执行一层节点，结果顺序与 jobs 一致
    pub async fn run_layer(&self, jobs: Vec<LayerJob<'_>>, cancel: &CancellationToken) -> Vec<NodeRun> {
        let pool = WorkerPool::for_layer(jobs.len(), self.max_workers);
        tracing::debug!(nodes = jobs.len(), workers = pool.size(), "dispatching layer");
        let runs = jobs.into_iter().map(|job| {
            let pool = pool.clone();
            async move {
                let outcome = match pool.acquire().await {
                    Ok(_permit) => {
                        if cancel.is_cancelled() {
                            NodeOutcome::Cancelled
                        } else {
                            self.execute(job.node, &job.action, &job.tool, cancel).await
                        }
                    }
                    Err(e) => failed(
                        job.tool.name(),
                        ExecutionResult::failure(FailureCategory::Fatal, e.to_string()),
                    ),
                };
                NodeRun {
                    index: job.node.index,
                    key: job.node.key.clone(),
                    tool: job.tool.name().to_string(),
                    outcome,
                }
            }
        });
        join_all(runs).await
    }
}

fn failed(tool: &str, result: ExecutionResult) -> NodeOutcome {
    NodeOutcome::Failed {
        tool: tool.to_string(),
        category: result.category(),
        message: result.failure_message(),
        result,
    }
}

/// 链上一步的输入：静态输入 + 映射字段
fn chain_input(step: &ChainStep, previous: &Value) -> Result<Value, String> {
    let mut input = match &step.input {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(format!("static input for {} must be an object, got {}", step.tool, other))
        }
        None => Map::new(),
    };
    for mapping in &step.map {
        let value = lookup(previous, &mapping.from).ok_or_else(|| {
            format!("mapped field {} missing from previous output", mapping.from)
        })?;
        input.insert(mapping.to.clone(), value.clone());
    }
    Ok(Value::Object(input))
}

/// 点路径取值；数字段用作数组下标，空路径为整个值
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() || path == "." {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// 对象浅合并，overlay 覆盖 base
fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut b), Value::Object(o)) => {
            b.extend(o);
            Value::Object(b)
        }
        (b, Value::Null) => b,
        (_, o) => o,
    }
}
