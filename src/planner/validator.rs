//! 路线图校验器（防幻觉检查）
//!
//! 固定顺序的六项检查，每项给出 pass/fail、分数与诊断：
//! 1. logical_coherence（非关键）：同层子任务对同一对象执行相反动作，或同层近似重复
//! 2. constraint_satisfaction（关键）：节点数、工具链长度、工具调用次数上限
//! 3. tool_existence（关键）：工具提示已注册，能力有提供者，链上工具已注册
//! 4. circular_reasoning（关键）：按边集重新判环（不信任拓扑序），子任务不得复述祖先目标
//! 5. goal_alignment（非关键）：子任务覆盖任务描述中的关键词比例
//! 6. confidence_threshold（非关键）：所有子任务置信度不低于下限
//!
//! 批准：全部通过；或只有非关键项失败且综合分 > approval_threshold。
//! 综合分 = (各项检查分均值 + 子任务平均置信度) / 2，置信度过低的计划无法靠其余检查抵消。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{PlannerSection, ValidatorSection};
use crate::planner::roadmap::{find_cycle, Roadmap};
use crate::planner::text::{coverage, significant_words, similarity};
use crate::tools::ToolRegistry;

/// 相反动作对
const OPPOSING_VERBS: &[(&str, &str)] = &[
    ("create", "delete"),
    ("add", "remove"),
    ("start", "stop"),
    ("enable", "disable"),
    ("open", "close"),
    ("lock", "unlock"),
    ("install", "uninstall"),
    ("increase", "decrease"),
];

/// 目标覆盖率下限
const MIN_GOAL_COVERAGE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub critical: bool,
    pub score: f64,
    pub message: String,
}

impl CheckOutcome {
    fn new(name: &str, critical: bool, score: f64, problems: Vec<String>) -> Self {
        let passed = problems.is_empty();
        Self {
            name: name.to_string(),
            passed,
            critical,
            score: score.clamp(0.0, 1.0),
            message: if passed {
                "ok".to_string()
            } else {
                problems.join("; ")
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckOutcome>,
    /// 子任务平均置信度
    pub plan_confidence: f64,
    pub aggregate_score: f64,
    pub approved: bool,
}

impl ValidationReport {
    pub fn failed(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn has_critical_failure(&self) -> bool {
        self.failed().any(|c| c.critical)
    }

    pub fn check(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// 失败项诊断（回灌给分解器）
    pub fn diagnostics(&self) -> Vec<String> {
        self.failed()
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect()
    }
}

pub struct Validator {
    cfg: ValidatorSection,
    min_subtasks: usize,
    max_subtasks: usize,
    registry: Arc<ToolRegistry>,
    tool_preference: Vec<String>,
}

impl Validator {
    pub fn new(
        cfg: ValidatorSection,
        planner: &PlannerSection,
        registry: Arc<ToolRegistry>,
        tool_preference: Vec<String>,
    ) -> Self {
        Self {
            cfg,
            min_subtasks: planner.min_subtasks,
            max_subtasks: planner.max_subtasks,
            registry,
            tool_preference,
        }
    }

    pub fn validate(&self, roadmap: &Roadmap, description: &str) -> ValidationReport {
        let checks = vec![
            self.logical_coherence(roadmap),
            self.constraint_satisfaction(roadmap),
            self.tool_existence(roadmap),
            self.circular_reasoning(roadmap),
            self.goal_alignment(roadmap, description),
            self.confidence_threshold(roadmap),
        ];
        let check_score = checks.iter().map(|c| c.score).sum::<f64>() / checks.len() as f64;
        let plan_confidence = mean_confidence(roadmap);
        let aggregate_score = (check_score + plan_confidence) / 2.0;
        let all_passed = checks.iter().all(|c| c.passed);
        let critical_failed = checks.iter().any(|c| !c.passed && c.critical);
        let approved =
            all_passed || (!critical_failed && aggregate_score > self.cfg.approval_threshold);

        let report = ValidationReport {
            checks,
            plan_confidence,
            aggregate_score,
            approved,
        };
        tracing::info!(
            roadmap = %roadmap.id,
            revision = roadmap.revision,
            score = report.aggregate_score,
            approved = report.approved,
            failed = ?report.failed().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "roadmap validated"
        );
        report
    }

    fn logical_coherence(&self, roadmap: &Roadmap) -> CheckOutcome {
        let mut problems = Vec::new();
        let mut pairs = 0usize;
        for layer in &roadmap.layers {
            for (i, &a) in layer.iter().enumerate() {
                for &b in &layer[i + 1..] {
                    let (Some(na), Some(nb)) = (roadmap.node(a), roadmap.node(b)) else { continue };
                    pairs += 1;
                    if let Some(reason) = contradiction(&na.description, &nb.description) {
                        problems.push(format!("{} and {} {}", na.key, nb.key, reason));
                    } else if similarity(&na.description, &nb.description) >= self.cfg.coherence_similarity {
                        problems.push(format!("{} and {} duplicate each other", na.key, nb.key));
                    }
                }
            }
        }
        let score = if pairs == 0 {
            1.0
        } else {
            1.0 - problems.len() as f64 / pairs as f64
        };
        CheckOutcome::new("logical_coherence", false, score, problems)
    }

    fn constraint_satisfaction(&self, roadmap: &Roadmap) -> CheckOutcome {
        let mut problems = Vec::new();
        let n = roadmap.len();
        if n < self.min_subtasks || n > self.max_subtasks {
            problems.push(format!(
                "{} subtasks outside {}..={}",
                n, self.min_subtasks, self.max_subtasks
            ));
        }

        let mut invocations: BTreeMap<String, usize> = BTreeMap::new();
        for node in &roadmap.nodes {
            let steps = 1 + node.chain.len();
            if steps > self.cfg.max_chain_steps {
                problems.push(format!(
                    "{} chains {} tools (max {})",
                    node.key, steps, self.cfg.max_chain_steps
                ));
            }
            let routed = node.tool.clone().or_else(|| {
                self.registry
                    .candidates(node.effective_capability(), &self.tool_preference)
                    .first()
                    .map(|t| t.name().to_string())
            });
            for tool in routed.into_iter().chain(node.chain.iter().map(|s| s.tool.clone())) {
                *invocations.entry(tool).or_default() += 1;
            }
        }
        for (tool, count) in &invocations {
            if let Some(limit) = self.registry.get(tool).and_then(|t| t.max_invocations()) {
                if *count > limit {
                    problems.push(format!("{} used {} times (limit {})", tool, count, limit));
                }
            }
        }

        let score = if problems.is_empty() { 1.0 } else { 0.0 };
        CheckOutcome::new("constraint_satisfaction", true, score, problems)
    }

    fn tool_existence(&self, roadmap: &Roadmap) -> CheckOutcome {
        let mut problems = Vec::new();
        let mut ok_nodes = 0usize;
        for node in &roadmap.nodes {
            let before = problems.len();
            match &node.tool {
                Some(tool) if self.registry.get(tool).is_none() => {
                    problems.push(format!("{} references unknown tool {}", node.key, tool));
                }
                Some(_) => {}
                None => {
                    let cap = node.effective_capability();
                    if !self.registry.has_capability(cap) {
                        problems.push(format!("{} needs capability {} with no provider", node.key, cap.as_str()));
                    }
                }
            }
            for step in &node.chain {
                if self.registry.get(&step.tool).is_none() {
                    problems.push(format!("{} chains unknown tool {}", node.key, step.tool));
                }
            }
            if problems.len() == before {
                ok_nodes += 1;
            }
        }
        let score = if roadmap.is_empty() {
            1.0
        } else {
            ok_nodes as f64 / roadmap.len() as f64
        };
        CheckOutcome::new("tool_existence", true, score, problems)
    }

    fn circular_reasoning(&self, roadmap: &Roadmap) -> CheckOutcome {
        let n = roadmap.len();
        let mut problems = Vec::new();

        if let Some(&(a, b)) = roadmap.edges.iter().find(|(a, b)| *a >= n || *b >= n) {
            problems.push(format!("edge {} -> {} references a missing node", a, b));
            return CheckOutcome::new("circular_reasoning", true, 0.0, problems);
        }
        if let Some(cycle) = find_cycle(n, &roadmap.edges) {
            let keys: Vec<&str> = cycle.iter().map(|&i| roadmap.key_of(i)).collect();
            problems.push(format!("cyclic dependency {}", keys.join(" -> ")));
            return CheckOutcome::new("circular_reasoning", true, 0.0, problems);
        }

        let position: BTreeMap<usize, usize> =
            roadmap.topo_order.iter().enumerate().map(|(p, &i)| (i, p)).collect();
        let order_ok = position.len() == n
            && roadmap
                .edges
                .iter()
                .all(|(a, b)| matches!((position.get(a), position.get(b)), (Some(pa), Some(pb)) if pa < pb));
        if !order_ok {
            problems.push("topological order is inconsistent with the edges".to_string());
        }

        for node in &roadmap.nodes {
            for anc in roadmap.ancestors(node.index) {
                if let Some(ancestor) = roadmap.node(anc) {
                    if similarity(&node.description, &ancestor.description) >= self.cfg.coherence_similarity {
                        problems.push(format!("{} restates its prerequisite {}", node.key, ancestor.key));
                    }
                }
            }
        }
        let score = if problems.is_empty() { 1.0 } else { 0.0 };
        CheckOutcome::new("circular_reasoning", true, score, problems)
    }

    fn goal_alignment(&self, roadmap: &Roadmap, description: &str) -> CheckOutcome {
        let target = significant_words(description);
        let covered: BTreeSet<String> = roadmap
            .nodes
            .iter()
            .flat_map(|n| significant_words(&n.description))
            .collect();
        let score = coverage(&target, &covered);
        let problems = if score >= MIN_GOAL_COVERAGE {
            Vec::new()
        } else {
            let missing: Vec<&str> = target
                .iter()
                .filter(|w| !covered.contains(*w))
                .map(String::as_str)
                .collect();
            vec![format!(
                "subtasks cover {:.0}% of the task; missing: {}",
                score * 100.0,
                missing.join(", ")
            )]
        };
        CheckOutcome::new("goal_alignment", false, score, problems)
    }

    fn confidence_threshold(&self, roadmap: &Roadmap) -> CheckOutcome {
        let problems: Vec<String> = roadmap
            .nodes
            .iter()
            .filter(|n| n.confidence < self.cfg.confidence_floor)
            .map(|n| {
                format!(
                    "{} confidence {:.2} below {:.2}",
                    n.key, n.confidence, self.cfg.confidence_floor
                )
            })
            .collect();
        CheckOutcome::new("confidence_threshold", false, mean_confidence(roadmap), problems)
    }
}

fn mean_confidence(roadmap: &Roadmap) -> f64 {
    if roadmap.is_empty() {
        0.0
    } else {
        roadmap.nodes.iter().map(|n| n.confidence).sum::<f64>() / roadmap.len() as f64
    }
}

/// 两段描述是否对同一对象做相反动作
fn contradiction(a: &str, b: &str) -> Option<String> {
    let wa = significant_words(a);
    let wb = significant_words(b);
    let verbs: BTreeSet<&str> = OPPOSING_VERBS.iter().flat_map(|(x, y)| [*x, *y]).collect();
    let objects_a: BTreeSet<&String> = wa.iter().filter(|w| !verbs.contains(w.as_str())).collect();
    let shared: Vec<&str> = wb
        .iter()
        .filter(|w| objects_a.contains(w))
        .map(String::as_str)
        .collect();
    if shared.is_empty() {
        return None;
    }
    OPPOSING_VERBS.iter().find_map(|(x, y)| {
        let opposed = (wa.contains(*x) && wb.contains(*y)) || (wa.contains(*y) && wb.contains(*x));
        opposed.then(|| format!("both act on {} with {}/{}", shared.join(" "), x, y))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskId;
    use crate::planner::roadmap::RoadmapGenerator;
    use crate::planner::types::Subtask;
    use crate::tools::builtin_registry;
    use serde_json::json;

    fn validator() -> Validator {
        let dir = std::env::temp_dir();
        Validator::new(
            ValidatorSection::default(),
            &PlannerSection::default(),
            Arc::new(builtin_registry(dir)),
            Vec::new(),
        )
    }

    fn tid() -> TaskId {
        TaskId::from("task_v")
    }

    fn create_then_read() -> Roadmap {
        let nodes = vec![
            Subtask::new(0, "s1", tid(), "create file A")
                .with_tool("file_write", json!({"path": "A", "content": "x"})),
            Subtask::new(1, "s2", tid(), "read file A")
                .with_tool("file_read", json!({"path": "A"}))
                .with_dependency(0),
        ];
        RoadmapGenerator::default().generate(&tid(), nodes, 0).unwrap()
    }

    #[test]
    fn test_sound_roadmap_is_approved() {
        let report = validator().validate(&create_then_read(), "create file A, then read file A");
        assert!(report.approved, "{:?}", report.diagnostics());
        assert_eq!(report.checks.len(), 6);
        assert_eq!(report.checks[0].name, "logical_coherence");
        assert_eq!(report.checks[5].name, "confidence_threshold");
        assert!((report.aggregate_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_three_node_cycle_is_rejected() {
        let mut roadmap = create_then_read();
        roadmap.nodes.push(Subtask::new(2, "s3", tid(), "say done"));
        // A -> B -> C -> A
        roadmap.edges = vec![(0, 1), (1, 2), (2, 0)];
        roadmap.layers = vec![vec![0, 1, 2]];
        roadmap.topo_order = vec![0, 1, 2];
        let report = validator().validate(&roadmap, "create file A, then read file A");
        let check = report.check("circular_reasoning").unwrap();
        assert!(!check.passed);
        assert!(check.critical);
        assert!(check.message.contains("cyclic dependency"));
        assert!(!report.approved);
    }

    #[test]
    fn test_unknown_tool_is_critical() {
        let nodes = vec![Subtask::new(0, "s1", tid(), "teleport the file").with_tool("teleport", json!({}))];
        let roadmap = RoadmapGenerator::default().generate(&tid(), nodes, 0).unwrap();
        let report = validator().validate(&roadmap, "teleport the file");
        assert!(!report.check("tool_existence").unwrap().passed);
        assert!(report.has_critical_failure());
        assert!(!report.approved);
    }

    #[test]
    fn test_missing_capability_provider() {
        let nodes = vec![Subtask::new(0, "s1", tid(), "email the summary to the team")];
        let roadmap = RoadmapGenerator::default().generate(&tid(), nodes, 0).unwrap();
        let report = validator().validate(&roadmap, "email the summary");
        let check = report.check("tool_existence").unwrap();
        assert!(check.message.contains("email"));
    }

    #[test]
    fn test_low_confidence_alone_can_still_be_approved() {
        let mut roadmap = create_then_read();
        roadmap.nodes[1].confidence = 0.25;
        let report = validator().validate(&roadmap, "create file A, then read file A");
        let check = report.check("confidence_threshold").unwrap();
        assert!(!check.passed);
        assert!(!check.critical);
        // ((5 + 0.625) / 6 + 0.625) / 2 > 0.7
        assert!(report.approved);
    }

    #[test]
    fn test_all_low_confidence_is_rejected() {
        let mut roadmap = create_then_read();
        roadmap.nodes[0].confidence = 0.0;
        roadmap.nodes[1].confidence = 0.0;
        let report = validator().validate(&roadmap, "create file A, then read file A");
        assert!(!report.check("confidence_threshold").unwrap().passed);
        assert!(!report.has_critical_failure());
        assert_eq!(report.plan_confidence, 0.0);
        assert!(report.aggregate_score < 0.7);
        assert!(!report.approved);
    }

    #[test]
    fn test_non_critical_failures_below_threshold_are_rejected() {
        let mut roadmap = create_then_read();
        roadmap.nodes[0].confidence = 0.0;
        roadmap.nodes[1].confidence = 0.0;
        let report = validator().validate(&roadmap, "deploy kubernetes cluster monitoring");
        assert!(!report.has_critical_failure());
        assert!(!report.approved);
        assert_eq!(report.diagnostics().len(), 2);
    }

    #[test]
    fn test_contradicting_siblings() {
        assert!(contradiction("create the cache folder", "delete cache folder").is_some());
        assert!(contradiction("create report", "delete logs").is_none());
    }

    #[test]
    fn test_restating_ancestor_is_circular() {
        let nodes = vec![
            Subtask::new(0, "s1", tid(), "summarize quarterly results"),
            Subtask::new(1, "s2", tid(), "summarize the quarterly results").with_dependency(0),
        ];
        let roadmap = RoadmapGenerator::default().generate(&tid(), nodes, 0).unwrap();
        let report = validator().validate(&roadmap, "summarize quarterly results");
        assert!(report
            .check("circular_reasoning")
            .unwrap()
            .message
            .contains("restates"));
    }
}
