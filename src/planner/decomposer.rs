//! 任务分解器
//!
//! 向推理后端发起结构化输出请求（schema = DecompositionOutput），把响应解析成子任务列表：
//! - 不符合 schema、为空、数量越界、id 重复、依赖未知、嵌套过深 → 携带拒绝原因重新提示一次
//! - 第二次仍不合格 → PlanError::Decomposition
//!
//! 嵌套子任务被展平：子节点 key 为 `parent.child`；无兄弟依赖的子节点继承父节点的依赖；
//! 依赖父节点的节点改为依赖「没有被兄弟依赖」的子节点。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::PlannerSection;
use crate::core::{PlanError, TaskId};
use crate::llm::InferenceBackend;
use crate::planner::types::{
    Decomposition, DecompositionOutput, Dependency, Subtask, SubtaskDescriptor,
};

/// 未给出置信度时的默认值
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// 一次分解请求的输入
#[derive(Debug, Clone)]
pub struct DecompositionRequest {
    pub task_id: TaskId,
    pub description: String,
    /// 提交任务时附带的上下文
    pub context: Value,
    /// 从记忆中取回的相关片段
    pub memory: Vec<String>,
    /// 校验诊断 / 重规划原因 / 人工澄清
    pub feedback: Vec<String>,
    /// 已完成子任务的描述（重规划时不应再出现）
    pub completed: Vec<String>,
    /// 生成 key 的前缀（重规划时避免与旧 key 冲突）
    pub key_prefix: Option<String>,
}

impl DecompositionRequest {
    pub fn new(task_id: TaskId, description: impl Into<String>) -> Self {
        Self {
            task_id,
            description: description.into(),
            context: Value::Null,
            memory: Vec::new(),
            feedback: Vec::new(),
            completed: Vec::new(),
            key_prefix: None,
        }
    }
}

pub struct TaskDecomposer {
    backend: Arc<dyn InferenceBackend>,
    min_subtasks: usize,
    max_subtasks: usize,
    max_depth: usize,
    /// 工具目录（拼进 prompt）
    tool_catalog: Option<String>,
}

impl TaskDecomposer {
    pub fn new(backend: Arc<dyn InferenceBackend>, cfg: &PlannerSection) -> Self {
        Self {
            backend,
            min_subtasks: cfg.min_subtasks.max(1),
            max_subtasks: cfg.max_subtasks.max(cfg.min_subtasks.max(1)),
            max_depth: cfg.max_depth.max(1),
            tool_catalog: None,
        }
    }

    pub fn with_tool_catalog(mut self, catalog: String) -> Self {
        self.tool_catalog = Some(catalog);
        self
    }

    /// 分解任务；最多两次请求
    pub async fn decompose(&self, req: &DecompositionRequest) -> Result<Decomposition, PlanError> {
        let schema = decomposition_schema();
        let context = json!({
            "description": req.description,
            "context": req.context,
            "memory": req.memory,
            "feedback": req.feedback,
            "completed": req.completed,
        });

        let mut rejection: Option<String> = None;
        for attempt in 1..=2u32 {
            let prompt = self.build_prompt(req, rejection.as_deref());
            let response = self
                .backend
                .complete(&prompt, &context, Some(&schema))
                .await
                .map_err(|e| PlanError::Decomposition(format!("inference failed: {}", e)))?;

            match self.parse(response.into_json(), req) {
                Ok(decomposition) => {
                    tracing::info!(
                        task_id = %req.task_id,
                        attempt,
                        subtasks = decomposition.subtasks.len(),
                        "decomposition accepted"
                    );
                    return Ok(decomposition);
                }
                Err(reason) => {
                    tracing::warn!(task_id = %req.task_id, attempt, reason = %reason, "decomposition rejected");
                    rejection = Some(reason);
                }
            }
        }
        Err(PlanError::Decomposition(
            rejection.unwrap_or_else(|| "no usable response".to_string()),
        ))
    }

    fn build_prompt(&self, req: &DecompositionRequest, rejection: Option<&str>) -> String {
        let mut prompt = format!(
            "Break the following task into between {} and {} concrete subtasks.\n\
             Task: {}\n",
            self.min_subtasks, self.max_subtasks, req.description
        );
        if !req.memory.is_empty() {
            prompt.push_str("\nRelevant memory:\n");
            for m in &req.memory {
                prompt.push_str(&format!("- {}\n", m));
            }
        }
        if !req.completed.is_empty() {
            prompt.push_str("\nAlready completed (do not repeat):\n");
            for c in &req.completed {
                prompt.push_str(&format!("- {}\n", c));
            }
        }
        if !req.feedback.is_empty() {
            prompt.push_str("\nFeedback on the previous plan:\n");
            for f in &req.feedback {
                prompt.push_str(&format!("- {}\n", f));
            }
        }
        if let Some(catalog) = &self.tool_catalog {
            prompt.push_str("\nAvailable tools:\n");
            prompt.push_str(catalog);
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "\nRules: give every subtask a unique short id; list dependencies in depends_on by id only; \
             nest subtasks at most {} levels deep; confidence is a number between 0 and 1.\n",
            self.max_depth
        ));
        if let Some(reason) = rejection {
            prompt.push_str(&format!(
                "\nYour previous answer was rejected: {}.\n\
                 Respond with ONLY a JSON object matching the DecompositionOutput schema, \
                 with no prose and no markdown.\n",
                reason
            ));
        }
        prompt
    }

    /// 解析并展平；Err 为拒绝原因
    fn parse(&self, value: Option<Value>, req: &DecompositionRequest) -> Result<Decomposition, String> {
        let value = value.ok_or_else(|| "response is not a JSON document".to_string())?;
        let output: DecompositionOutput =
            serde_json::from_value(value).map_err(|e| format!("response does not match schema: {}", e))?;
        if output.subtasks.is_empty() {
            return Err("no subtasks returned".to_string());
        }

        let mut flat = Flattener::default();
        flat.walk(&output.subtasks, None, 1, &[], self.max_depth)?;

        let count = flat.leaves.len();
        if count < self.min_subtasks || count > self.max_subtasks {
            return Err(format!(
                "{} subtasks is outside the allowed range {}..={}",
                count, self.min_subtasks, self.max_subtasks
            ));
        }

        let subtasks = flat.into_subtasks(&req.task_id, req.key_prefix.as_deref())?;
        Ok(Decomposition {
            reasoning: output.reasoning,
            subtasks,
        })
    }
}

/// DecompositionOutput 的 JSON Schema
pub fn decomposition_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(DecompositionOutput)).unwrap_or(Value::Null)
}

#[derive(Debug, Clone)]
struct RawDep {
    id: String,
    weight: f64,
    /// 解析 id 时优先查找的兄弟作用域
    scope: Option<String>,
}

#[derive(Debug)]
struct Leaf {
    key: String,
    descriptor: SubtaskDescriptor,
    deps: Vec<RawDep>,
}

#[derive(Default)]
struct Flattener {
    leaves: Vec<Leaf>,
    /// 父节点 key → 其「未被兄弟依赖」的子节点 key
    groups: HashMap<String, Vec<String>>,
    known: HashSet<String>,
}

impl Flattener {
    fn walk(
        &mut self,
        descs: &[SubtaskDescriptor],
        scope: Option<&str>,
        depth: usize,
        inherited: &[RawDep],
        max_depth: usize,
    ) -> Result<(), String> {
        if depth > max_depth {
            return Err(format!("subtasks nested deeper than {} levels", max_depth));
        }
        let sibling_ids: Vec<&str> = descs.iter().map(|d| d.id.trim()).collect();

        for desc in descs {
            let id = desc.id.trim();
            if id.is_empty() {
                return Err("subtask with empty id".to_string());
            }
            if desc.description.trim().is_empty() {
                return Err(format!("subtask {} has an empty description", id));
            }
            let key = match scope {
                Some(p) => format!("{}.{}", p, id),
                None => id.to_string(),
            };
            if !self.known.insert(key.clone()) {
                return Err(format!("duplicate subtask id {}", key));
            }

            let has_sibling_dep = desc
                .depends_on
                .iter()
                .any(|h| sibling_ids.contains(&h.id().trim()));
            let mut deps: Vec<RawDep> = desc
                .depends_on
                .iter()
                .map(|h| RawDep {
                    id: h.id().trim().to_string(),
                    weight: sanitize_weight(h.weight()),
                    scope: scope.map(str::to_string),
                })
                .collect();
            if !has_sibling_dep {
                deps.extend(inherited.iter().cloned());
            }

            if desc.subtasks.is_empty() {
                let mut descriptor = desc.clone();
                descriptor.subtasks.clear();
                self.leaves.push(Leaf { key, descriptor, deps });
            } else {
                let child_ids: Vec<&str> = desc.subtasks.iter().map(|c| c.id.trim()).collect();
                let sinks: Vec<String> = child_ids
                    .iter()
                    .filter(|cid| {
                        !desc
                            .subtasks
                            .iter()
                            .any(|c| c.depends_on.iter().any(|h| h.id().trim() == **cid))
                    })
                    .map(|cid| format!("{}.{}", key, cid))
                    .collect();
                self.groups.insert(key.clone(), sinks);
                self.walk(&desc.subtasks, Some(&key), depth + 1, &deps, max_depth)?;
            }
        }
        Ok(())
    }

    /// 依赖 id → key：先查兄弟作用域，再查全局
    fn resolve_key(&self, dep: &RawDep) -> Option<String> {
        if let Some(scope) = &dep.scope {
            let scoped = format!("{}.{}", scope, dep.id);
            if self.known.contains(&scoped) {
                return Some(scoped);
            }
        }
        self.known.contains(&dep.id).then(|| dep.id.clone())
    }

    /// key（叶子或父节点）→ 叶子下标
    fn expand(&self, key: &str, index: &HashMap<&str, usize>, out: &mut Vec<usize>) {
        if let Some(&i) = index.get(key) {
            out.push(i);
        } else if let Some(sinks) = self.groups.get(key) {
            for s in sinks {
                self.expand(s, index, out);
            }
        }
    }

    fn into_subtasks(self, task_id: &TaskId, prefix: Option<&str>) -> Result<Vec<Subtask>, String> {
        let index: HashMap<&str, usize> = self
            .leaves
            .iter()
            .enumerate()
            .map(|(i, l)| (l.key.as_str(), i))
            .collect();

        let mut subtasks = Vec::with_capacity(self.leaves.len());
        for (i, leaf) in self.leaves.iter().enumerate() {
            let mut dependencies: Vec<Dependency> = Vec::new();
            for dep in &leaf.deps {
                let key = self
                    .resolve_key(dep)
                    .ok_or_else(|| format!("subtask {} depends on unknown id {}", leaf.key, dep.id))?;
                let mut targets = Vec::new();
                self.expand(&key, &index, &mut targets);
                for t in targets {
                    if !dependencies.iter().any(|d| d.index == t) {
                        dependencies.push(Dependency { index: t, weight: dep.weight });
                    }
                }
            }

            let d = &leaf.descriptor;
            let key = match prefix {
                Some(p) => format!("{}.{}", p, leaf.key),
                None => leaf.key.clone(),
            };
            subtasks.push(Subtask {
                index: i,
                key,
                task_id: task_id.clone(),
                description: d.description.trim().to_string(),
                dependencies,
                tool: d.tool.clone().filter(|t| !t.trim().is_empty()),
                capability: d.capability,
                input: d.input.clone(),
                expected_output: d.expected_output,
                chain: d.chain.clone(),
                chain_mode: d.chain_mode,
                confidence: sanitize_confidence(d.confidence),
                complexity: d.complexity.unwrap_or_default(),
                requires_approval: d.requires_approval,
                timeout_secs: d.timeout_secs,
            });
        }
        Ok(subtasks)
    }
}

fn sanitize_confidence(c: Option<f64>) -> f64 {
    match c {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    }
}

fn sanitize_weight(w: f64) -> f64 {
    if w.is_finite() {
        w.max(0.0)
    } else {
        1.0
    }
}
