//! 协调循环与对外 API
//!
//! 每个任务一个协调循环（tokio task），持有自己的 TaskContext：
//! 分解 → 生成路线图 → 校验（不通过则带诊断重新分解）→ 按层执行 → 终态。
//! 路线图与 TrackKeeper 只由该循环修改；外部通过 watch 通道里的 TaskSnapshot 观察。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, DeviationPolicy};
use crate::core::recovery::{
    FailurePatterns, FailureRecord, NodeBudget, RecoveryDecision, RecoverySystem,
};
use crate::core::supervisor::TaskSupervisor;
use crate::core::task::{
    Escalation, Priority, RoadmapView, Task, TaskId, TaskSnapshot, TaskStatusReport,
};
use crate::core::{FailureCategory, PlanError, TaskState};
use crate::execution::{LayerJob, NodeOutcome, ResultProcessor, ToolOrchestrator};
use crate::human::{is_approval, HumanInput};
use crate::llm::InferenceBackend;
use crate::memory::MemoryStore;
use crate::planner::{
    Decomposition, DecompositionRequest, PlannedAction, Roadmap, RoadmapGenerator, Subtask,
    TaskDecomposer, TrackKeeper, TrackVerdict, Validator,
};
use crate::tools::{Tool, ToolRegistry};

/// 分解前从记忆取回的片段数
const MEMORY_RECALL: usize = 3;

/// 构造引擎所需的外部依赖
pub struct EngineParts {
    pub config: AppConfig,
    pub backend: Arc<dyn InferenceBackend>,
    pub registry: Arc<ToolRegistry>,
    pub memory: Arc<dyn MemoryStore>,
    pub human: Option<Arc<dyn HumanInput>>,
}

/// 所有任务共享的只读组件
struct Components {
    config: AppConfig,
    decomposer: TaskDecomposer,
    generator: RoadmapGenerator,
    validator: Validator,
    orchestrator: ToolOrchestrator,
    recovery: RecoverySystem,
    memory: Arc<dyn MemoryStore>,
    human: Option<Arc<dyn HumanInput>>,
}

/// 协调循环的终止原因
#[derive(Debug)]
enum Halt {
    Cancelled,
    Escalate {
        node: Option<String>,
        category: FailureCategory,
        message: String,
    },
    Abort {
        node: Option<String>,
        category: FailureCategory,
        message: String,
    },
}

impl Halt {
    fn severity(&self) -> u8 {
        match self {
            Halt::Cancelled => 1,
            Halt::Escalate { .. } => 2,
            Halt::Abort { .. } => 3,
        }
    }

    /// 同一层多个节点都要求终止时取最严重的
    fn worst(current: Option<Halt>, next: Halt) -> Option<Halt> {
        match current {
            Some(c) if c.severity() >= next.severity() => Some(c),
            _ => Some(next),
        }
    }
}

impl From<PlanError> for Halt {
    fn from(err: PlanError) -> Self {
        halt_at(None, err)
    }
}

fn halt_at(node: Option<&str>, err: PlanError) -> Halt {
    let node = node.map(str::to_string);
    match err {
        PlanError::Cancelled => Halt::Cancelled,
        other => {
            let category = other.category();
            let message = other.to_string();
            if category == FailureCategory::Fatal {
                Halt::Abort {
                    node,
                    category,
                    message,
                }
            } else {
                Halt::Escalate {
                    node,
                    category,
                    message,
                }
            }
        }
    }
}

enum LayerPlan {
    Ready(Vec<(Subtask, Arc<dyn Tool>, PlannedAction)>),
    Deviated { node: String, reason: String },
}

/// 单个任务的上下文（协调循环独占）
struct TaskContext {
    parts: Arc<Components>,
    supervisor: Arc<TaskSupervisor>,
    snapshot: TaskSnapshot,
    tx: watch::Sender<TaskSnapshot>,
    cancel: CancellationToken,
    tracker: Option<TrackKeeper>,
    budgets: HashMap<String, NodeBudget>,
    /// 备用工具替换：节点 key → 工具名
    overrides: HashMap<String, String>,
    approved: HashSet<String>,
    /// 更早版本完成的子任务描述（重规划时告诉分解器）
    completed_descriptions: Vec<String>,
}

impl TaskContext {
    fn id(&self) -> &TaskId {
        &self.snapshot.task.id
    }

    fn tracker(&self) -> Result<&TrackKeeper, Halt> {
        self.tracker
            .as_ref()
            .ok_or_else(|| PlanError::Logic("no active roadmap".to_string()).into())
    }

    fn tracker_mut(&mut self) -> Result<&mut TrackKeeper, Halt> {
        self.tracker
            .as_mut()
            .ok_or_else(|| PlanError::Logic("no active roadmap".to_string()).into())
    }

    fn publish(&mut self) {
        if let Some(tracker) = &self.tracker {
            self.snapshot.checkpoints = tracker.checkpoints().to_vec();
            self.snapshot.roadmap = Some(RoadmapView::from_roadmap(
                tracker.roadmap(),
                tracker.statuses(),
            ));
        }
        self.tx.send_replace(self.snapshot.clone());
    }

    fn set_state(&mut self, next: TaskState) -> Result<(), PlanError> {
        let from = self.snapshot.task.state;
        self.snapshot.task.state = from.transition(next)?;
        tracing::info!(task_id = %self.id(), from = %from, to = %next, "task state");
        self.publish();
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn ask_human(&self, prompt: String) -> Option<String> {
        let human = self.parts.human.as_ref()?;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            answer = human.ask(&prompt) => answer,
        }
    }

    async fn run(mut self) {
        let outcome = self.drive().await;
        self.finish(outcome).await;
    }

    async fn drive(&mut self) -> Result<(), Halt> {
        self.set_state(TaskState::Decomposing)?;
        let decomposition = self.initial_decomposition().await?;
        self.set_state(TaskState::Planning)?;
        let roadmap = self
            .plan(decomposition, Vec::new(), Vec::new(), None, 0)
            .await?;
        self.set_state(TaskState::Executing)?;
        self.tracker = Some(TrackKeeper::start(
            roadmap,
            self.parts.config.tracker.similarity_tolerance,
        ));
        self.publish();
        self.execute().await?;
        self.complete()
    }

    fn request(
        &self,
        feedback: Vec<String>,
        completed: Vec<String>,
        key_prefix: Option<String>,
    ) -> DecompositionRequest {
        let description = self.snapshot.task.description.clone();
        let mut req = DecompositionRequest::new(self.id().clone(), description.clone());
        req.context = self.snapshot.task.context.clone();
        req.memory = self.parts.memory.recall(&description, MEMORY_RECALL);
        req.feedback = feedback;
        req.completed = completed;
        req.key_prefix = key_prefix;
        req
    }

    async fn decompose(&self, req: &DecompositionRequest) -> Result<Decomposition, PlanError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PlanError::Cancelled),
            r = self.parts.decomposer.decompose(req) => r,
        }
    }

    /// 首次分解；失败时向人要一次澄清
    async fn initial_decomposition(&mut self) -> Result<Decomposition, Halt> {
        let mut request = self.request(Vec::new(), Vec::new(), None);
        match self.decompose(&request).await {
            Ok(d) => Ok(d),
            Err(PlanError::Decomposition(reason)) => {
                let prompt = format!(
                    "Could not break down \"{}\": {}. Please clarify the task.",
                    self.snapshot.task.description, reason
                );
                let clarification = self
                    .ask_human(prompt)
                    .await
                    .filter(|answer| !answer.trim().is_empty());
                self.check_cancel()?;
                match clarification {
                    Some(answer) => {
                        tracing::info!(task_id = %self.id(), "retrying decomposition with clarification");
                        request
                            .feedback
                            .push(format!("Clarification from the user: {}", answer));
                        Ok(self.decompose(&request).await?)
                    }
                    None => Err(PlanError::Decomposition(reason).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 生成 + 校验，不通过时带诊断重新分解，重新生成次数不超过 retry_limit
    async fn plan(
        &mut self,
        mut decomposition: Decomposition,
        base_feedback: Vec<String>,
        completed: Vec<String>,
        key_prefix: Option<String>,
        revision: u32,
    ) -> Result<Roadmap, Halt> {
        let parts = self.parts.clone();
        let retry_limit = parts.config.validator.retry_limit;
        let mut regenerations = 0u32;
        loop {
            self.check_cancel()?;
            let generated = parts
                .generator
                .generate(self.id(), decomposition.subtasks, revision);
            self.set_state(TaskState::Validating)?;
            self.snapshot.validation_rounds += 1;
            let diagnostics = match generated {
                Ok(roadmap) => {
                    let report = parts
                        .validator
                        .validate(&roadmap, &self.snapshot.task.description);
                    if report.approved {
                        if self.tracker.is_none() {
                            self.snapshot.roadmap = Some(RoadmapView::from_roadmap(&roadmap, &[]));
                        }
                        self.publish();
                        return Ok(roadmap);
                    }
                    report.diagnostics()
                }
                Err(PlanError::CyclicDependency(keys)) => {
                    vec![format!(
                        "circular_reasoning: cyclic dependency {}",
                        keys.join(" -> ")
                    )]
                }
                Err(e) => return Err(e.into()),
            };

            tracing::warn!(
                task_id = %self.id(),
                revision,
                regenerations,
                diagnostics = ?diagnostics,
                "roadmap rejected"
            );
            if regenerations >= retry_limit {
                return Err(PlanError::ValidationFailure(diagnostics.join("; ")).into());
            }
            regenerations += 1;
            self.set_state(TaskState::Planning)?;
            let mut feedback = base_feedback.clone();
            feedback.extend(diagnostics);
            let req = self.request(feedback, completed.clone(), key_prefix.clone());
            decomposition = self.decompose(&req).await?;
        }
    }

    async fn execute(&mut self) -> Result<(), Halt> {
        loop {
            self.check_cancel()?;
            let tracker = self.tracker()?;
            if tracker.is_complete() {
                return Ok(());
            }
            let layer = tracker.current_layer();
            self.step_layer(layer).await?;
        }
    }

    /// 路由并规划一层中每个节点的动作；遇到第一个偏离即停
    async fn plan_layer(&self, layer: &[usize]) -> Result<LayerPlan, Halt> {
        let parts = self.parts.clone();
        let goal = self.snapshot.task.description.clone();
        let mut planned = Vec::with_capacity(layer.len());
        for &index in layer {
            let node = self
                .tracker()?
                .roadmap()
                .node(index)
                .cloned()
                .ok_or_else(|| PlanError::Logic(format!("no node at index {}", index)))?;
            let key = node.key.clone();
            let tool = match self.overrides.get(&key) {
                Some(name) => parts
                    .orchestrator
                    .tool(name)
                    .ok_or_else(|| halt_at(Some(key.as_str()), PlanError::ToolNotFound(name.clone())))?,
                None => parts
                    .orchestrator
                    .route(&node)
                    .map_err(|e| halt_at(Some(key.as_str()), e))?,
            };
            let action = parts
                .orchestrator
                .plan_action(&node, &tool, &goal, &self.cancel)
                .await
                .map_err(|e| halt_at(Some(key.as_str()), e))?;
            if let TrackVerdict::Deviation { reason, .. } = self.tracker()?.validate_on_track(&action) {
                return Ok(LayerPlan::Deviated { node: key, reason });
            }
            planned.push((node, tool, action));
        }
        Ok(LayerPlan::Ready(planned))
    }

    async fn step_layer(&mut self, layer: Vec<usize>) -> Result<(), Halt> {
        let parts = self.parts.clone();
        let id = self.id().clone();

        let plan = self.plan_layer(&layer).await?;
        let planned = match plan {
            LayerPlan::Ready(planned) => planned,
            LayerPlan::Deviated { node, reason } => return self.handle_deviation(&node, reason).await,
        };

        for (node, _, _) in &planned {
            if !node.requires_approval || self.approved.contains(&node.key) {
                continue;
            }
            let prompt = format!(
                "Approve subtask {} (\"{}\")? [y/N]",
                node.key, node.description
            );
            match self.ask_human(prompt).await {
                Some(answer) if is_approval(&answer) => {
                    tracing::info!(task_id = %id, node = %node.key, "subtask approved");
                    self.approved.insert(node.key.clone());
                }
                _ => {
                    self.check_cancel()?;
                    return Err(Halt::Escalate {
                        node: Some(node.key.clone()),
                        category: FailureCategory::Config,
                        message: format!("subtask {} was not approved", node.key),
                    });
                }
            }
        }

        {
            let tracker = self.tracker_mut()?;
            for (node, _, _) in &planned {
                tracker
                    .mark_running(node.index)
                    .map_err(|e| halt_at(Some(node.key.as_str()), e))?;
            }
        }
        for (node, tool, _) in &planned {
            let attempt = self
                .budgets
                .entry(node.key.clone())
                .or_default()
                .begin(tool.name());
            tracing::info!(task_id = %id, node = %node.key, tool = tool.name(), attempt, "dispatching subtask");
        }
        self.snapshot.current_node = planned.first().map(|(n, _, _)| n.key.clone());
        self.publish();

        let jobs: Vec<LayerJob<'_>> = planned
            .iter()
            .map(|(node, tool, action)| LayerJob {
                node,
                action: action.clone(),
                tool: tool.clone(),
            })
            .collect();
        let runs = parts.orchestrator.run_layer(jobs, &self.cancel).await;

        if self.cancel.is_cancelled() {
            // 取消的层不提交任何结果
            let tracker = self.tracker_mut()?;
            for (node, _, _) in &planned {
                tracker.release(node.index);
            }
            return Err(Halt::Cancelled);
        }

        let mut halt: Option<Halt> = None;
        let mut replan_reason: Option<String> = None;
        let mut retry_delay: Option<Duration> = None;

        for run in runs {
            match run.outcome {
                NodeOutcome::Succeeded(result) => {
                    self.tracker_mut()?.mark_succeeded(run.index)?;
                    parts.memory.record_result(&id, &run.key, &result.structured);
                    self.snapshot.results.insert(run.key.clone(), result);
                    self.budgets.remove(&run.key);
                }
                NodeOutcome::Cancelled => {
                    self.tracker_mut()?.release(run.index);
                    halt = Halt::worst(halt, Halt::Cancelled);
                }
                NodeOutcome::Failed {
                    tool,
                    category,
                    message,
                    result,
                } => {
                    self.tracker_mut()?.mark_failed(run.index)?;
                    let budget = self.budgets.get(&run.key).cloned().unwrap_or_default();
                    tracing::warn!(
                        task_id = %id,
                        node = %run.key,
                        tool = %tool,
                        attempt = budget.total_attempts(),
                        category = %category,
                        confidence = result.confidence,
                        error = %message,
                        "subtask failed"
                    );
                    self.snapshot.failures.push(FailureRecord {
                        node: run.key.clone(),
                        tool: Some(tool),
                        attempt: budget.total_attempts(),
                        category,
                        message: message.clone(),
                        confidence: result.confidence,
                        at: chrono::Utc::now().timestamp_millis(),
                    });
                    self.snapshot.last_error = Some(format!("{}: {}", run.key, message));

                    let alternates = parts.orchestrator.alternates(&run.tool, budget.tried());
                    match parts
                        .recovery
                        .decide(category, &budget, &alternates, self.snapshot.replans)
                    {
                        RecoveryDecision::Retry { delay } => {
                            self.tracker_mut()?.reset_failed(run.index);
                            retry_delay = Some(retry_delay.map_or(delay, |d| d.max(delay)));
                        }
                        RecoveryDecision::Fallback { tool } => {
                            tracing::info!(task_id = %id, node = %run.key, fallback = %tool, "switching to fallback tool");
                            self.tracker_mut()?.reset_failed(run.index);
                            self.overrides.insert(run.key.clone(), tool);
                        }
                        RecoveryDecision::Replan => {
                            replan_reason
                                .get_or_insert_with(|| format!("{} failed: {}", run.key, message));
                        }
                        RecoveryDecision::Escalate => {
                            halt = Halt::worst(
                                halt,
                                Halt::Escalate {
                                    node: Some(run.key.clone()),
                                    category,
                                    message,
                                },
                            );
                        }
                        RecoveryDecision::Abort => {
                            halt = Halt::worst(
                                halt,
                                Halt::Abort {
                                    node: Some(run.key.clone()),
                                    category,
                                    message,
                                },
                            );
                        }
                    }
                }
            }
        }
        self.publish();

        if let Some(halt) = halt {
            return Err(halt);
        }
        if let Some(reason) = replan_reason {
            return self.replan(reason).await;
        }
        if let Some(delay) = retry_delay {
            tracing::debug!(task_id = %id, delay_ms = delay.as_millis() as u64, "backing off before retry");
            parts.recovery.pause(delay, &self.cancel).await?;
        }
        Ok(())
    }

    async fn handle_deviation(&mut self, node: &str, reason: String) -> Result<(), Halt> {
        let tracker_cfg = self.parts.config.tracker.clone();
        self.snapshot.deviations += 1;
        self.snapshot.last_error = Some(format!("deviation at {}: {}", node, reason));
        tracing::warn!(
            task_id = %self.id(),
            node,
            deviations = self.snapshot.deviations,
            reason = %reason,
            "deviation detected"
        );
        if self.snapshot.deviations > tracker_cfg.max_deviation_recoveries {
            return Err(Halt::Escalate {
                node: Some(node.to_string()),
                category: FailureCategory::Logic,
                message: format!("deviation limit reached: {}", reason),
            });
        }
        match tracker_cfg.deviation_policy {
            DeviationPolicy::Rollback => {
                let position = self
                    .tracker_mut()?
                    .rollback_to_last()
                    .map(|c| c.position);
                tracing::info!(task_id = %self.id(), checkpoint = ?position, "rolled back after deviation");
                self.prune_results()?;
                self.publish();
                Ok(())
            }
            DeviationPolicy::Replan => {
                self.replan(format!("deviation at {}: {}", node, reason))
                    .await
            }
        }
    }

    /// 丢弃已被回滚节点的结果
    fn prune_results(&mut self) -> Result<(), Halt> {
        let completed = self.tracker()?.completed_keys();
        self.snapshot.results.retain(|key, _| completed.contains(key));
        Ok(())
    }

    /// 以当前检查点为起点重新规划剩余部分
    async fn replan(&mut self, reason: String) -> Result<(), Halt> {
        let parts = self.parts.clone();
        if self.snapshot.replans >= parts.recovery.max_replans() {
            return Err(Halt::Escalate {
                node: self.snapshot.current_node.clone(),
                category: FailureCategory::Logic,
                message: format!("re-plan limit reached: {}", reason),
            });
        }
        self.snapshot.replans += 1;
        let (revision, done) = {
            let tracker = self.tracker()?;
            (tracker.roadmap().revision + 1, tracker.completed_descriptions())
        };
        self.completed_descriptions.extend(done);
        tracing::info!(task_id = %self.id(), revision, reason = %reason, "re-planning");

        self.set_state(TaskState::Planning)?;
        let feedback = vec![format!("Re-plan requested: {}", reason)];
        let completed = self.completed_descriptions.clone();
        let prefix = Some(format!("r{}", revision));
        let req = self.request(feedback.clone(), completed.clone(), prefix.clone());
        let decomposition = self.decompose(&req).await?;
        let roadmap = self
            .plan(decomposition, feedback, completed, prefix, revision)
            .await?;
        self.set_state(TaskState::Executing)?;
        self.tracker_mut()?.replace_roadmap(roadmap);
        self.budgets.clear();
        self.overrides.clear();
        self.publish();
        Ok(())
    }

    fn complete(&mut self) -> Result<(), Halt> {
        let results: Map<String, Value> = self
            .snapshot
            .results
            .iter()
            .map(|(key, r)| (key.clone(), r.structured.clone()))
            .collect();
        self.snapshot.task.result = Some(Value::Object(results));
        self.snapshot.current_node = None;
        self.set_state(TaskState::Completed)?;
        Ok(())
    }

    fn terminate(&mut self, state: TaskState) {
        if !self.snapshot.task.state.is_terminal() {
            self.snapshot.task.state = state;
        }
    }

    async fn finish(mut self, outcome: Result<(), Halt>) {
        let id = self.id().clone();
        let last_checkpoint = self
            .tracker
            .as_ref()
            .and_then(|t| t.last_checkpoint())
            .map(|c| c.position);
        let now = chrono::Utc::now().timestamp_millis();
        let lifetime = Duration::from_millis(u64::try_from(now - self.snapshot.task.created_at).unwrap_or(0));
        let suggestions = FailurePatterns::analyze(&self.snapshot.failures, None, lifetime, now).suggestions();

        match outcome {
            Ok(()) => {
                tracing::info!(task_id = %id, checkpoints = self.snapshot.checkpoints.len(), "task completed");
            }
            Err(Halt::Cancelled) => {
                tracing::warn!(task_id = %id, "task cancelled");
                self.snapshot.last_error = Some(PlanError::Cancelled.to_string());
                self.terminate(TaskState::Failed);
            }
            Err(Halt::Escalate {
                node,
                category,
                message,
            }) => {
                tracing::error!(task_id = %id, node = ?node, category = %category, error = %message, "task escalated");
                let prompt = format!(
                    "Task {} escalated{}: [{}] {}",
                    id,
                    node.as_deref().map(|n| format!(" at {}", n)).unwrap_or_default(),
                    category,
                    message
                );
                let reply = self.ask_human(prompt).await;
                self.snapshot.task.escalation = Some(Escalation {
                    node,
                    category,
                    message: message.clone(),
                    last_checkpoint,
                    attempts: self.snapshot.failures.clone(),
                    human_reply: reply,
                    suggestions,
                });
                self.snapshot.last_error = Some(message);
                self.terminate(TaskState::Escalated);
            }
            Err(Halt::Abort {
                node,
                category,
                message,
            }) => {
                tracing::error!(task_id = %id, node = ?node, category = %category, error = %message, "task aborted");
                self.snapshot.task.escalation = Some(Escalation {
                    node,
                    category,
                    message: message.clone(),
                    last_checkpoint,
                    attempts: self.snapshot.failures.clone(),
                    human_reply: None,
                    suggestions,
                });
                self.snapshot.last_error = Some(message);
                self.terminate(TaskState::Failed);
            }
        }
        self.snapshot.task.completed_at = Some(now);
        self.snapshot.current_node = None;

        let results: Map<String, Value> = self
            .snapshot
            .results
            .iter()
            .map(|(key, r)| (key.clone(), r.structured.clone()))
            .collect();
        self.parts.memory.record_outcome(
            &id,
            json!({
                "task_id": id,
                "description": self.snapshot.task.description,
                "state": self.snapshot.task.state,
                "results": results,
                "escalation": self.snapshot.task.escalation,
                "error": self.snapshot.last_error,
            }),
        );
        self.publish();
        self.supervisor.release(&id);
    }
}

/// 任务引擎：提交、查询、取消
pub struct TaskEngine {
    parts: Arc<Components>,
    supervisor: Arc<TaskSupervisor>,
    tasks: RwLock<HashMap<TaskId, watch::Receiver<TaskSnapshot>>>,
}

impl TaskEngine {
    pub fn new(parts: EngineParts) -> Self {
        let EngineParts {
            config,
            backend,
            registry,
            memory,
            human,
        } = parts;
        let decomposer = TaskDecomposer::new(backend.clone(), &config.planner)
            .with_tool_catalog(registry.to_schema_json());
        let validator = Validator::new(
            config.validator.clone(),
            &config.planner,
            registry.clone(),
            config.executor.tool_preference.clone(),
        );
        let orchestrator = ToolOrchestrator::new(
            registry,
            backend,
            &config.executor,
            ResultProcessor::new(config.results.clone()),
        );
        let components = Components {
            generator: RoadmapGenerator::from_config(&config.planner),
            recovery: RecoverySystem::from_config(&config.recovery),
            decomposer,
            validator,
            orchestrator,
            memory,
            human,
            config,
        };
        Self {
            parts: Arc::new(components),
            supervisor: Arc::new(TaskSupervisor::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.parts.config
    }

    /// 提交任务，立即返回任务 ID；协调循环在后台运行
    pub fn submit_task(&self, description: impl Into<String>, context: Value) -> TaskId {
        self.submit_task_with_priority(description, context, Priority::default())
    }

    pub fn submit_task_with_priority(
        &self,
        description: impl Into<String>,
        context: Value,
        priority: Priority,
    ) -> TaskId {
        let task = Task::new(description, context, priority);
        let id = task.id.clone();
        let snapshot = TaskSnapshot::new(task);
        let (tx, rx) = watch::channel(snapshot.clone());
        let cancel = self.supervisor.register(&id);
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), rx);
        self.evict_finished();

        let ctx = TaskContext {
            parts: self.parts.clone(),
            supervisor: self.supervisor.clone(),
            snapshot,
            tx,
            cancel,
            tracker: None,
            budgets: HashMap::new(),
            overrides: HashMap::new(),
            approved: HashSet::new(),
            completed_descriptions: Vec::new(),
        };
        tracing::info!(task_id = %id, priority = ?priority, "task submitted");
        tokio::spawn(ctx.run());
        id
    }

    fn receiver(&self, id: &TaskId) -> Option<watch::Receiver<TaskSnapshot>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.receiver(id).map(|rx| rx.borrow().clone())
    }

    pub fn get_status(&self, id: &TaskId) -> Option<TaskStatusReport> {
        self.receiver(id)
            .map(|rx| TaskStatusReport::from(&*rx.borrow()))
    }

    pub fn inspect_roadmap(&self, id: &TaskId) -> Option<RoadmapView> {
        self.receiver(id).and_then(|rx| rx.borrow().roadmap.clone())
    }

    /// 取消任务；已结束的任务视为成功，未知任务返回 TaskNotFound
    pub fn cancel(&self, id: &TaskId) -> Result<(), PlanError> {
        if self.supervisor.cancel(id) {
            tracing::info!(task_id = %id, "cancel requested");
            return Ok(());
        }
        if self.receiver(id).is_some() {
            Ok(())
        } else {
            Err(PlanError::TaskNotFound(id.to_string()))
        }
    }

    /// 等待任务进入终态，返回最终快照
    pub async fn wait(&self, id: &TaskId) -> Option<TaskSnapshot> {
        let mut rx = self.receiver(id)?;
        let done = rx
            .wait_for(|s| s.state().is_terminal())
            .await
            .map(|s| TaskSnapshot::clone(&s))
            .ok();
        Some(done.unwrap_or_else(|| rx.borrow().clone()))
    }

    /// 所有任务及其当前状态（按提交时间）
    pub fn list_tasks(&self) -> Vec<(TaskId, TaskState)> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<(i64, TaskId, TaskState)> = tasks
            .iter()
            .map(|(id, rx)| {
                let s = rx.borrow();
                (s.task.created_at, id.clone(), s.task.state)
            })
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        list.into_iter().map(|(_, id, state)| (id, state)).collect()
    }

    /// 丢弃一个已结束任务的记录并返回其最终快照
    pub fn forget(&self, id: &TaskId) -> Result<TaskSnapshot, PlanError> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let state = tasks
            .get(id)
            .map(|rx| rx.borrow().task.state)
            .ok_or_else(|| PlanError::TaskNotFound(id.to_string()))?;
        if !state.is_terminal() {
            return Err(PlanError::TaskRunning(id.to_string()));
        }
        let rx = tasks
            .remove(id)
            .ok_or_else(|| PlanError::TaskNotFound(id.to_string()))?;
        let snapshot = rx.borrow().clone();
        Ok(snapshot)
    }

    /// 已结束任务超过 retained_tasks 时，按结束时间丢弃最早的
    fn evict_finished(&self) {
        let cap = self.parts.config.executor.retained_tasks;
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let mut finished: Vec<(i64, TaskId)> = tasks
            .iter()
            .filter_map(|(id, rx)| {
                let s = rx.borrow();
                s.state()
                    .is_terminal()
                    .then(|| (s.task.completed_at.unwrap_or(s.task.created_at), id.clone()))
            })
            .collect();
        if finished.len() <= cap {
            return;
        }
        finished.sort();
        let excess = finished.len() - cap;
        for (_, id) in finished.into_iter().take(excess) {
            tasks.remove(&id);
            tracing::debug!(task_id = %id, "finished task evicted");
        }
    }

    /// 所有已记录任务在 window 内的失败统计；tool 为 Some 时只看该工具
    pub fn failure_patterns(&self, tool: Option<&str>, window: Duration) -> FailurePatterns {
        let records: Vec<FailureRecord> = self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(|rx| rx.borrow().failures.clone())
            .collect();
        FailurePatterns::analyze(&records, tool, window, chrono::Utc::now().timestamp_millis())
    }

    /// 取消全部任务
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::human::ScriptedHuman;
    use crate::llm::{MockBackend, ScriptedBackend};
    use crate::memory::InMemoryStore;
    use crate::tools::builtin_registry;

    fn engine_with(
        backend: Arc<dyn InferenceBackend>,
        workspace: &std::path::Path,
        human: Option<Arc<dyn HumanInput>>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> (TaskEngine, Arc<InMemoryStore>) {
        let mut config = AppConfig::default();
        config.recovery.base_delay_ms = 1;
        config.recovery.jitter = false;
        tweak(&mut config);
        let memory = Arc::new(InMemoryStore::default());
        let engine = TaskEngine::new(EngineParts {
            config,
            backend,
            registry: Arc::new(builtin_registry(workspace)),
            memory: memory.clone(),
            human,
        });
        (engine, memory)
    }

    #[tokio::test]
    async fn test_sequential_task_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, memory) = engine_with(Arc::new(MockBackend::new()), dir.path(), None, |_| {});
        let id = engine.submit_task("create file A, then read file A", Value::Null);
        let snap = engine.wait(&id).await.unwrap();
        assert_eq!(snap.state(), TaskState::Completed, "{:?}", snap.last_error);
        assert_eq!(snap.checkpoints.len(), 2);
        assert_eq!(snap.results["s2"].raw, "content of A");
        assert!(snap.task.completed_at.is_some());
        assert_eq!(memory.outcome(&id).unwrap()["state"], "COMPLETED");
        assert_eq!(memory.results(&id).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_task_queries() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(Arc::new(MockBackend::new()), dir.path(), None, |_| {});
        let ghost = TaskId::from("task_ghost");
        assert!(engine.get_status(&ghost).is_none());
        assert!(engine.inspect_roadmap(&ghost).is_none());
        assert!(matches!(engine.cancel(&ghost), Err(PlanError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_undecomposable_task_asks_for_clarification() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::structured(vec![
            json!({"subtasks": []}),
            json!({"subtasks": []}),
            json!({"subtasks": [{"id": "s1", "description": "say hello", "tool": "echo", "input": {"text": "hello"}}]}),
        ]));
        let human = Arc::new(ScriptedHuman::new(["just say hello"]));
        let (engine, _) = engine_with(backend.clone(), dir.path(), Some(human.clone() as Arc<dyn HumanInput>), |_| {});
        let id = engine.submit_task("say hello", Value::Null);
        let snap = engine.wait(&id).await.unwrap();
        assert_eq!(snap.state(), TaskState::Completed, "{:?}", snap.last_error);
        assert_eq!(human.prompts().len(), 1);
        assert!(backend.prompts()[2].contains("just say hello"));
    }

    #[tokio::test]
    async fn test_undecomposable_task_without_human_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let (engine, _) = engine_with(backend, dir.path(), None, |_| {});
        let id = engine.submit_task("do the thing", Value::Null);
        let snap = engine.wait(&id).await.unwrap();
        assert_eq!(snap.state(), TaskState::Escalated);
        let esc = snap.task.escalation.unwrap();
        assert!(esc.message.contains("Decomposition failed"));
    }

    #[tokio::test]
    async fn test_approval_gate_rejection_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::structured(vec![json!({
            "subtasks": [{"id": "s1", "description": "say hello", "tool": "echo",
                          "input": {"text": "hello"}, "requires_approval": true}]
        })]));
        let human = Arc::new(ScriptedHuman::new(["no", "noted"]));
        let (engine, _) = engine_with(backend, dir.path(), Some(human.clone() as Arc<dyn HumanInput>), |_| {});
        let id = engine.submit_task("say hello", Value::Null);
        let snap = engine.wait(&id).await.unwrap();
        assert_eq!(snap.state(), TaskState::Escalated);
        let esc = snap.task.escalation.unwrap();
        assert_eq!(esc.category, FailureCategory::Config);
        assert_eq!(esc.node.as_deref(), Some("s1"));
        assert_eq!(esc.human_reply.as_deref(), Some("noted"));
        assert_eq!(human.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_approval_gate_accepts_yes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::structured(vec![json!({
            "subtasks": [{"id": "s1", "description": "say hello", "tool": "echo",
                          "input": {"text": "hello"}, "requires_approval": true}]
        })]));
        let human = Arc::new(ScriptedHuman::new(["yes"]));
        let (engine, _) = engine_with(backend, dir.path(), Some(human as Arc<dyn HumanInput>), |_| {});
        let id = engine.submit_task("say hello", Value::Null);
        let snap = engine.wait(&id).await.unwrap();
        assert_eq!(snap.state(), TaskState::Completed, "{:?}", snap.last_error);
    }

    #[tokio::test]
    async fn test_config_failure_escalates_with_report() {
        let dir = tempfile::tempdir().unwrap();
        // 读取不存在的文件：missing → config，不重试
        let backend = Arc::new(ScriptedBackend::structured(vec![json!({
            "subtasks": [{"id": "s1", "description": "read file ghost.txt", "tool": "file_read",
                          "input": {"path": "ghost.txt"}}]
        })]));
        let (engine, _) = engine_with(backend, dir.path(), None, |_| {});
        let id = engine.submit_task("read file ghost.txt", Value::Null);
        let snap = engine.wait(&id).await.unwrap();
        assert_eq!(snap.state(), TaskState::Escalated);
        assert_eq!(snap.failures.len(), 1);
        assert_eq!(snap.failures[0].category, FailureCategory::Config);
        let esc = snap.task.escalation.unwrap();
        assert_eq!(esc.node.as_deref(), Some("s1"));
        assert_eq!(esc.last_checkpoint, None);
        assert!(esc.suggestions.iter().any(|s| s.starts_with("Configuration failures")));

        let status = engine.get_status(&id).unwrap();
        assert!(status.suggestions[0].starts_with("Resolve the config failure at s1"));
        assert_eq!(status.progress.total_nodes, 1);
        assert_eq!(status.progress.failed, 1);

        let patterns = engine.failure_patterns(Some("file_read"), Duration::from_secs(3600));
        assert_eq!(patterns.total, 1);
        assert_eq!(patterns.count(FailureCategory::Config), 1);
        assert!(engine.failure_patterns(Some("echo"), Duration::from_secs(3600)).by_tool.is_empty());
    }

    #[tokio::test]
    async fn test_list_tasks_reports_states() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(Arc::new(MockBackend::new()), dir.path(), None, |_| {});
        let a = engine.submit_task("say one", Value::Null);
        engine.wait(&a).await.unwrap();
        let listed = engine.list_tasks();
        assert_eq!(listed, vec![(a.clone(), TaskState::Completed)]);
        assert!(engine.cancel(&a).is_ok());
    }

    #[tokio::test]
    async fn test_forget_removes_only_finished_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(Arc::new(MockBackend::new()), dir.path(), None, |_| {});
        let a = engine.submit_task("say one", Value::Null);
        engine.wait(&a).await.unwrap();

        let snap = engine.forget(&a).unwrap();
        assert_eq!(snap.state(), TaskState::Completed);
        assert!(engine.get_status(&a).is_none());
        assert!(matches!(engine.forget(&a), Err(PlanError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_finished_tasks_beyond_cap_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine_with(Arc::new(MockBackend::new()), dir.path(), None, |cfg| {
            cfg.executor.retained_tasks = 2;
        });
        let mut ids = Vec::new();
        for text in ["say one", "say two", "say three"] {
            let id = engine.submit_task(text, Value::Null);
            engine.wait(&id).await.unwrap();
            ids.push(id);
            // 结束时间按毫秒计，拉开间隔
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // 第四次提交时三个已结束任务超出上限，最早结束的被丢弃
        let last = engine.submit_task("say four", Value::Null);
        assert!(engine.get_status(&ids[0]).is_none());
        assert!(engine.get_status(&ids[1]).is_some());
        assert!(engine.get_status(&ids[2]).is_some());
        assert!(engine.get_status(&last).is_some());
    }
}
