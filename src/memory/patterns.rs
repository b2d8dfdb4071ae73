//! 模式学习：按（目标模式, 工具）累计成功 / 失败次数
//!
//! 计数只增不减，进程内常驻；规划器的 Model / Rule 层读取成功率来调整工具顺序与备选顺序。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::core::task::Task;
use crate::tools::ToolKind;

/// 未见过的（模式, 工具）使用的中性先验
pub const NEUTRAL_PRIOR: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PatternKey {
    pub pattern: String,
    pub tool: ToolKind,
}

#[derive(Debug, Default)]
struct PatternCounts {
    success: AtomicU64,
    failure: AtomicU64,
}

/// SuccessPattern / FailurePattern 记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternRecord {
    pub pattern: String,
    pub tool: ToolKind,
    pub count: u64,
}

/// 进程级计数表；Clone 句柄后共享
#[derive(Debug, Default)]
pub struct PatternStore {
    counts: RwLock<HashMap<PatternKey, Arc<PatternCounts>>>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, pattern: &str, tool: ToolKind) -> Arc<PatternCounts> {
        let key = PatternKey {
            pattern: pattern.to_string(),
            tool,
        };
        if let Some(c) = self
            .counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Arc::clone(c);
        }
        let mut w = self.counts.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(w.entry(key).or_default())
    }

    pub fn observe(&self, pattern: &str, tool: ToolKind, success: bool) {
        let counts = self.entry(pattern, tool);
        if success {
            counts.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counts.failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// (success, failure)
    pub fn counts(&self, pattern: &str, tool: ToolKind) -> (u64, u64) {
        let key = PatternKey {
            pattern: pattern.to_string(),
            tool,
        };
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|c| {
                (
                    c.success.load(Ordering::Relaxed),
                    c.failure.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }

    /// ∈ [0, 1]；未见过时为 0.5
    pub fn success_rate(&self, pattern: &str, tool: ToolKind) -> f64 {
        match self.counts(pattern, tool) {
            (0, 0) => NEUTRAL_PRIOR,
            (s, f) => s as f64 / (s + f) as f64,
        }
    }

    /// 按成功率降序做稳定排序（相同成功率保持原顺序）
    pub fn rank(&self, pattern: &str, tools: &[ToolKind]) -> Vec<ToolKind> {
        let mut scored: Vec<(ToolKind, f64)> = tools
            .iter()
            .map(|t| (*t, self.success_rate(pattern, *t)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(t, _)| t).collect()
    }

    pub fn success_patterns(&self) -> Vec<PatternRecord> {
        self.records(|c| c.success.load(Ordering::Relaxed))
    }

    pub fn failure_patterns(&self) -> Vec<PatternRecord> {
        self.records(|c| c.failure.load(Ordering::Relaxed))
    }

    fn records(&self, pick: impl Fn(&PatternCounts) -> u64) -> Vec<PatternRecord> {
        let mut out: Vec<PatternRecord> = self
            .counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(k, c)| {
                let count = pick(c);
                (count > 0).then(|| PatternRecord {
                    pattern: k.pattern.clone(),
                    tool: k.tool,
                    count,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.pattern, a.tool).cmp(&(&b.pattern, b.tool)));
        out
    }
}

/// 任务结束后写入观察：每次分发一次，记在该次分发所用的工具上（含被恢复挽救的失败）
#[derive(Debug, Clone)]
pub struct PatternLearner {
    store: Arc<PatternStore>,
}

impl PatternLearner {
    pub fn new(store: Arc<PatternStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn observe(&self, pattern: &str, tool: ToolKind, success: bool) {
        self.store.observe(pattern, tool, success);
    }

    pub fn observe_task(&self, task: &Task) {
        let pattern = &task.plan().pattern;
        let mut observations = 0usize;
        for record in task.results().iter().flat_map(|r| r.dispatches.iter()) {
            self.observe(pattern, record.tool, record.ok);
            observations += 1;
        }
        tracing::debug!(
            task_id = %task.id(),
            pattern = %pattern,
            observations,
            "pattern statistics updated"
        );
    }
}
