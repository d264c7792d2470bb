//! 记忆存储
//!
//! 分解前按任务描述检索历史片段（recall），执行中写入各节点结果，终态写入任务结局。
//! 除任务 ID 外不约束内容格式；当前只有进程内实现，不跨重启持久化。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use serde_json::Value;

use crate::core::TaskId;
use crate::planner::text::significant_words;

pub trait MemoryStore: Send + Sync {
    /// 与 query 最相关的至多 k 条历史片段
    fn recall(&self, query: &str, k: usize) -> Vec<String>;

    /// 节点成功后写入结构化结果
    fn record_result(&self, task_id: &TaskId, node: &str, result: &Value);

    /// 任务进入终态后写入结局
    fn record_outcome(&self, task_id: &TaskId, outcome: Value);

    fn outcome(&self, task_id: &TaskId) -> Option<Value>;

    fn results(&self, task_id: &TaskId) -> BTreeMap<String, Value>;
}

#[derive(Debug, Default)]
struct Inner {
    /// (片段, 词集合)，按写入顺序
    snippets: Vec<(String, BTreeSet<String>)>,
    results: HashMap<TaskId, BTreeMap<String, Value>>,
    outcomes: HashMap<TaskId, Value>,
}

/// 进程内实现：按词重叠检索
#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    max_snippets: usize,
}

impl InMemoryStore {
    pub fn new(max_snippets: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_snippets: max_snippets.max(1),
        }
    }

    /// 直接写入一条可检索的片段
    pub fn remember(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.snippets.push((text.to_string(), significant_words(text)));
        let n = inner.snippets.len();
        if n > self.max_snippets {
            inner.snippets.drain(0..n - self.max_snippets);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryStore for InMemoryStore {
    fn recall(&self, query: &str, k: usize) -> Vec<String> {
        let query_words = significant_words(query);
        if query_words.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(usize, usize, &String)> = inner
            .snippets
            .iter()
            .enumerate()
            .map(|(i, (text, words))| (query_words.intersection(words).count(), i, text))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        // 分数高的在前，同分时新的在前
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.into_iter().take(k).map(|(_, _, t)| t.clone()).collect()
    }

    fn record_result(&self, task_id: &TaskId, node: &str, result: &Value) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .results
            .entry(task_id.clone())
            .or_default()
            .insert(node.to_string(), result.clone());
    }

    fn record_outcome(&self, task_id: &TaskId, outcome: Value) {
        let summary = match (
            outcome.get("description").and_then(Value::as_str),
            outcome.get("state").and_then(Value::as_str),
        ) {
            (Some(d), Some(s)) => Some(format!("{} => {}", d, s)),
            _ => None,
        };
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.outcomes.insert(task_id.clone(), outcome);
        }
        if let Some(summary) = summary {
            self.remember(&summary);
        }
    }

    fn outcome(&self, task_id: &TaskId) -> Option<Value> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.outcomes.get(task_id).cloned()
    }

    fn results(&self, task_id: &TaskId) -> BTreeMap<String, Value> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.results.get(task_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recall_ranks_by_overlap() {
        let store = InMemoryStore::default();
        store.remember("deploy the web service to staging");
        store.remember("read the quarterly report");
        store.remember("deploy database migration");
        let hits = store.recall("deploy web service", 2);
        assert_eq!(hits[0], "deploy the web service to staging");
        assert_eq!(hits.len(), 2);
        assert!(store.recall("unrelated words", 3).is_empty());
    }

    #[test]
    fn test_outcome_is_recallable() {
        let store = InMemoryStore::default();
        let id = TaskId::from("task_1");
        store.record_outcome(&id, json!({"description": "create file A", "state": "COMPLETED"}));
        assert_eq!(store.outcome(&id).unwrap()["state"], "COMPLETED");
        assert_eq!(store.recall("create file", 1), vec!["create file A => COMPLETED"]);
    }

    #[test]
    fn test_results_keyed_by_node() {
        let store = InMemoryStore::default();
        let id = TaskId::from("task_2");
        store.record_result(&id, "s1", &json!({"bytes_written": 3}));
        assert_eq!(store.results(&id)["s1"]["bytes_written"], 3);
        assert!(store.results(&TaskId::from("other")).is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let store = InMemoryStore::new(2);
        store.remember("alpha one");
        store.remember("alpha two");
        store.remember("alpha three");
        let hits = store.recall("alpha", 5);
        assert_eq!(hits, vec!["alpha three", "alpha two"]);
    }
}
