//! 路线图（DAG）与生成器
//!
//! 节点存放在 arena（`Vec<Subtask>`）中，依赖是下标列表；生成器负责：
//! 1. 检查依赖下标合法
//! 2. 深度优先找环（维护递归栈），发现环时尝试删除环上优先级最低的一条边，只尝试一次
//! 3. 分层：level = 0（无依赖）或 1 + max(level(依赖))，层内按创建顺序排序
//! 4. 拓扑序 = 各层依次拼接
//!
//! 相同输入总是得到相同的边集、分层与拓扑序。

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::PlannerSection;
use crate::core::{PlanError, TaskId};
use crate::planner::types::Subtask;

/// 不可变 DAG；重规划时生成新的 Roadmap 替换旧的
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Roadmap {
    pub id: String,
    pub task_id: TaskId,
    /// 0 为首次生成，每次重规划 +1
    pub revision: u32,
    pub nodes: Vec<Subtask>,
    /// (dependency, dependent)，按 dependent、dependency 下标排序
    pub edges: Vec<(usize, usize)>,
    pub topo_order: Vec<usize>,
    pub layers: Vec<Vec<usize>>,
    /// 断环时删除的边
    pub dropped_edges: Vec<(usize, usize)>,
    pub created_at: i64,
}

impl Roadmap {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&Subtask> {
        self.nodes.get(index)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.key == key)
    }

    pub fn key_of(&self, index: usize) -> &str {
        self.nodes.get(index).map(|n| n.key.as_str()).unwrap_or("?")
    }

    /// 所有（传递）前驱
    pub fn ancestors(&self, index: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self
            .nodes
            .get(index)
            .map(|n| n.dependency_indices().collect())
            .unwrap_or_default();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                if let Some(n) = self.nodes.get(i) {
                    stack.extend(n.dependency_indices());
                }
            }
        }
        seen
    }

    pub fn layer_of(&self, index: usize) -> Option<usize> {
        self.layers.iter().position(|layer| layer.contains(&index))
    }

    /// 按复杂度成本计的最长依赖链（同长取下标小者）
    pub fn critical_path(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut best = vec![0u32; n];
        let mut prev: Vec<Option<usize>> = vec![None; n];
        for &i in &self.topo_order {
            let Some(node) = self.nodes.get(i) else { continue };
            let mut base = 0;
            let mut from = None;
            // 依赖按下标升序，严格大于才替换，同长保留下标小者
            for dep in node.dependency_indices().filter(|&d| d < n) {
                if from.is_none() || best[dep] > base {
                    base = best[dep];
                    from = Some(dep);
                }
            }
            prev[i] = from;
            best[i] = base + node.complexity.cost();
        }
        let Some(mut end) = (0..n).max_by(|&a, &b| best[a].cmp(&best[b]).then(b.cmp(&a))) else {
            return Vec::new();
        };
        let mut path = vec![end];
        while let Some(p) = prev[end] {
            path.push(p);
            end = p;
        }
        path.reverse();
        path
    }

    /// 估算总成本：每层取最大节点成本后求和（层内并发）
    pub fn estimated_cost(&self) -> u32 {
        self.layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter_map(|&i| self.nodes.get(i))
                    .map(|n| n.complexity.cost())
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }
}

/// 在 (dependency, dependent) 边集上找环；返回环上的节点（按执行方向，首尾相同）
pub fn find_cycle(node_count: usize, edges: &[(usize, usize)]) -> Option<Vec<usize>> {
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for &(dep, dependent) in edges {
        if dep < node_count && dependent < node_count {
            deps[dependent].push(dep);
        }
    }
    for d in deps.iter_mut() {
        d.sort_unstable();
        d.dedup();
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    fn visit(n: usize, deps: &[Vec<usize>], marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[n] = Mark::Gray;
        stack.push(n);
        for &d in &deps[n] {
            match marks[d] {
                Mark::Gray => {
                    let start = stack.iter().position(|&s| s == d).unwrap_or(0);
                    // 栈上每个节点依赖下一个；反转后变为 dependency -> dependent
                    let mut cycle: Vec<usize> = stack[start..].to_vec();
                    cycle.push(d);
                    cycle.reverse();
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(c) = visit(d, deps, marks, stack) {
                        return Some(c);
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[n] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; node_count];
    let mut stack = Vec::new();
    for n in 0..node_count {
        if marks[n] == Mark::White {
            if let Some(c) = visit(n, &deps, &mut marks, &mut stack) {
                return Some(c);
            }
        }
    }
    None
}

/// 路线图生成器
#[derive(Debug, Clone)]
pub struct RoadmapGenerator {
    auto_break_cycles: bool,
}

impl Default for RoadmapGenerator {
    fn default() -> Self {
        Self {
            auto_break_cycles: true,
        }
    }
}

impl RoadmapGenerator {
    pub fn new(auto_break_cycles: bool) -> Self {
        Self { auto_break_cycles }
    }

    pub fn from_config(cfg: &PlannerSection) -> Self {
        Self::new(cfg.auto_break_cycles)
    }

    /// 由子任务构建路线图
    pub fn generate(
        &self,
        task_id: &TaskId,
        mut nodes: Vec<Subtask>,
        revision: u32,
    ) -> Result<Roadmap, PlanError> {
        let n = nodes.len();
        for (pos, node) in nodes.iter_mut().enumerate() {
            if node.index != pos {
                return Err(PlanError::Logic(format!(
                    "node {} has index {} but sits at {}",
                    node.key, node.index, pos
                )));
            }
            if let Some(bad) = node.dependencies.iter().find(|d| d.index >= n) {
                return Err(PlanError::Logic(format!(
                    "node {} depends on unknown index {}",
                    node.key, bad.index
                )));
            }
            node.dependencies.sort_by_key(|d| d.index);
            node.dependencies.dedup_by_key(|d| d.index);
        }

        let mut dropped_edges = Vec::new();
        if let Some(cycle) = find_cycle(n, &edge_list(&nodes)) {
            let keys = cycle_keys(&nodes, &cycle);
            if !self.auto_break_cycles {
                return Err(PlanError::CyclicDependency(keys));
            }
            let (dep, dependent) = weakest_edge(&nodes, &cycle);
            tracing::warn!(
                cycle = %keys.join(" -> "),
                dropped = %format!("{} -> {}", nodes[dep].key, nodes[dependent].key),
                "breaking dependency cycle"
            );
            nodes[dependent].dependencies.retain(|d| d.index != dep);
            dropped_edges.push((dep, dependent));

            if let Some(second) = find_cycle(n, &edge_list(&nodes)) {
                return Err(PlanError::CyclicDependency(cycle_keys(&nodes, &second)));
            }
        }

        let edges = edge_list(&nodes);
        let levels = compute_levels(&nodes);
        let depth = levels.iter().copied().max().map_or(0, |m| m + 1);
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); depth];
        for (i, &level) in levels.iter().enumerate() {
            layers[level].push(i); // i 递增，层内天然按创建顺序
        }
        let topo_order: Vec<usize> = layers.iter().flatten().copied().collect();

        let roadmap = Roadmap {
            id: format!("roadmap_{}", uuid::Uuid::new_v4()),
            task_id: task_id.clone(),
            revision,
            nodes,
            edges,
            topo_order,
            layers,
            dropped_edges,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let critical: Vec<&str> = roadmap
            .critical_path()
            .into_iter()
            .map(|i| roadmap.key_of(i))
            .collect();
        tracing::info!(
            task_id = %task_id,
            revision,
            nodes = n,
            edges = roadmap.edges.len(),
            layers = roadmap.layers.len(),
            critical_path = %critical.join(" -> "),
            estimated_cost = roadmap.estimated_cost(),
            "roadmap generated"
        );
        Ok(roadmap)
    }
}

fn edge_list(nodes: &[Subtask]) -> Vec<(usize, usize)> {
    nodes
        .iter()
        .flat_map(|node| node.dependency_indices().map(move |dep| (dep, node.index)))
        .collect()
}

fn cycle_keys(nodes: &[Subtask], cycle: &[usize]) -> Vec<String> {
    cycle.iter().map(|&i| nodes[i].key.clone()).collect()
}

/// 环上权重最低的边；同权重时取 dependency 创建最晚者，再取 dependent 创建最晚者
fn weakest_edge(nodes: &[Subtask], cycle: &[usize]) -> (usize, usize) {
    let weight = |dep: usize, dependent: usize| {
        nodes[dependent]
            .dependencies
            .iter()
            .find(|d| d.index == dep)
            .map_or(1.0, |d| d.weight)
    };
    cycle
        .windows(2)
        .map(|w| (w[0], w[1]))
        .min_by(|a, b| {
            weight(a.0, a.1)
                .total_cmp(&weight(b.0, b.1))
                .then_with(|| b.0.cmp(&a.0))
                .then_with(|| b.1.cmp(&a.1))
        })
        .unwrap_or((cycle[0], cycle[cycle.len() - 1]))
}

/// 无环前提下按创建顺序反复松弛求层级
fn compute_levels(nodes: &[Subtask]) -> Vec<usize> {
    let n = nodes.len();
    let mut levels: Vec<Option<usize>> = vec![None; n];
    let mut remaining = n;
    while remaining > 0 {
        let mut progressed = false;
        for node in nodes {
            if levels[node.index].is_some() {
                continue;
            }
            let dep_levels: Option<Vec<usize>> =
                node.dependency_indices().map(|d| levels[d]).collect();
            if let Some(dep_levels) = dep_levels {
                levels[node.index] = Some(dep_levels.iter().max().map_or(0, |m| m + 1));
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    levels.into_iter().map(|l| l.unwrap_or(0)).collect()
}
