//! 任务生命周期：Task 实体、状态机与 TaskManager
//!
//! 状态只前进：Pending → Running → Success | Failed。
//! `start` 交出唯一的 TaskHandle（不可 Clone），只有持有者能记录结果；`complete` 消耗句柄。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::{FailureKind, TaskError};
use crate::core::ledger::{ResourceKind, ResourceUsage};
use crate::planner::{Goal, Plan, Step};
use crate::tools::ToolKind;

/// 任务标识，文本形式为 `task_<uuid>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("task_").unwrap_or(s);
        Uuid::parse_str(raw).map(TaskId)
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    Ok { value: Value },
    Err { kind: FailureKind, detail: String },
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StepOutcome::Ok { .. } => None,
            StepOutcome::Err { kind, .. } => Some(*kind),
        }
    }

    pub fn err(kind: FailureKind, detail: impl Into<String>) -> Self {
        StepOutcome::Err {
            kind,
            detail: detail.into(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// 一次分发（含被拒绝的预留与超时）的结果，模式学习按此计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub tool: ToolKind,
    pub ok: bool,
}

/// 单个步骤的最终结果；attempt_count 累计所有重试，dispatches 按顺序记录每次分发
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub tool: ToolKind,
    pub outcome: StepOutcome,
    pub attempt_count: u32,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub dispatches: Vec<DispatchRecord>,
}

/// 未恢复的失败：保留起源的 FailureKind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub detail: String,
    pub step_index: Option<usize>,
}

/// 监控轮询发布的实时指标
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub steps_completed: usize,
    pub errors_encountered: usize,
    pub current_step: Option<usize>,
    pub resource_usage: BTreeMap<ResourceKind, ResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    id: TaskId,
    goal: Goal,
    plan: Plan,
    status: TaskStatus,
    results: Vec<StepResult>,
    failure: Option<TaskFailure>,
    created_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(goal: Goal, plan: Plan) -> Self {
        Self {
            id: TaskId::new(),
            goal,
            plan,
            status: TaskStatus::Pending,
            results: Vec::new(),
            failure: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    fn transition_error(&self, action: &'static str) -> TaskError {
        TaskError::InvalidTransition {
            task_id: self.id.to_string(),
            from: self.status.to_string(),
            action,
        }
    }

    pub(crate) fn start(&mut self) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending {
            return Err(self.transition_error("start"));
        }
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn record(&mut self, result: StepResult) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("record"));
        }
        if self.results.len() >= self.plan.len() {
            return Err(TaskError::ResultsFull(self.id.to_string()));
        }
        self.results.push(result);
        Ok(())
    }

    pub(crate) fn revise_step(&mut self, index: usize, step: Step) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("revise"));
        }
        match self.plan.steps.get_mut(index) {
            Some(slot) => {
                *slot = step;
                Ok(())
            }
            None => Err(self.transition_error("revise")),
        }
    }

    pub(crate) fn complete(
        &mut self,
        success: bool,
        failure: Option<TaskFailure>,
    ) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.transition_error("complete"));
        }
        self.status = if success {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        self.failure = if success {
            None
        } else {
            Some(failure.unwrap_or_else(|| TaskFailure {
                kind: FailureKind::Unclassified,
                detail: "task failed without a recorded cause".to_string(),
                step_index: None,
            }))
        };
        self.end_time = Some(Utc::now());
        Ok(())
    }
}

/// 快照：任务本身加最近一次发布的指标
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: Task,
    pub metrics: TaskMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

fn lock(task: &Mutex<Task>) -> MutexGuard<'_, Task> {
    task.lock().unwrap_or_else(|e| e.into_inner())
}

struct TaskEntry {
    task: Arc<Mutex<Task>>,
    cancel: CancellationToken,
    status_tx: Arc<watch::Sender<TaskStatus>>,
    metrics_tx: Arc<watch::Sender<TaskMetrics>>,
}

#[derive(Default)]
struct TaskTable {
    entries: HashMap<TaskId, TaskEntry>,
    order: VecDeque<TaskId>,
}

/// 任务表：创建、启动、查询、取消；超过 max_tasks 时淘汰最早结束的任务
pub struct TaskManager {
    table: RwLock<TaskTable>,
    max_tasks: usize,
}

impl TaskManager {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            table: RwLock::new(TaskTable::default()),
            max_tasks: max_tasks.max(1),
        }
    }

    pub async fn create(&self, goal: Goal, plan: Plan) -> TaskId {
        let task = Task::new(goal, plan);
        let id = task.id();
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        let (metrics_tx, _) = watch::channel(TaskMetrics::default());
        let mut table = self.table.write().await;
        self.evict_finished(&mut table);
        table.entries.insert(
            id,
            TaskEntry {
                task: Arc::new(Mutex::new(task)),
                cancel: CancellationToken::new(),
                status_tx: Arc::new(status_tx),
                metrics_tx: Arc::new(metrics_tx),
            },
        );
        table.order.push_back(id);
        tracing::info!(task_id = %id, "task created");
        id
    }

    fn evict_finished(&self, table: &mut TaskTable) {
        while table.entries.len() >= self.max_tasks {
            let victim = table.order.iter().position(|id| {
                table
                    .entries
                    .get(id)
                    .map(|e| lock(&e.task).status().is_terminal())
                    .unwrap_or(true)
            });
            match victim {
                Some(pos) => {
                    if let Some(id) = table.order.remove(pos) {
                        table.entries.remove(&id);
                        tracing::debug!(task_id = %id, "evicted finished task");
                    }
                }
                None => {
                    tracing::warn!(
                        max_tasks = self.max_tasks,
                        "task table full of unfinished tasks"
                    );
                    break;
                }
            }
        }
    }

    /// Pending → Running；同一任务只有一次 start 能成功
    pub async fn start(&self, id: TaskId) -> Result<TaskHandle, TaskError> {
        let table = self.table.read().await;
        let entry = table
            .entries
            .get(&id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        lock(&entry.task).start()?;
        entry.status_tx.send_replace(TaskStatus::Running);
        tracing::info!(task_id = %id, "task started");
        Ok(TaskHandle {
            id,
            task: Arc::clone(&entry.task),
            cancel: entry.cancel.clone(),
            status_tx: Arc::clone(&entry.status_tx),
            metrics_tx: Arc::clone(&entry.metrics_tx),
            completed: false,
        })
    }

    pub async fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        let table = self.table.read().await;
        table.entries.get(&id).map(|e| TaskSnapshot {
            task: lock(&e.task).clone(),
            metrics: e.metrics_tx.borrow().clone(),
        })
    }

    pub async fn subscribe(&self, id: TaskId) -> Option<watch::Receiver<TaskStatus>> {
        let table = self.table.read().await;
        table.entries.get(&id).map(|e| e.status_tx.subscribe())
    }

    /// 等待任务进入终态并返回最终快照
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot, TaskError> {
        let mut rx = self
            .subscribe(id)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        rx.wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| TaskError::NotFound(id.to_string()))?;
        self.snapshot(id)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// 请求取消；在下一个步骤边界生效。已结束的任务返回 false
    pub async fn cancel(&self, id: TaskId) -> Result<bool, TaskError> {
        let table = self.table.read().await;
        let entry = table
            .entries
            .get(&id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        if lock(&entry.task).status().is_terminal() {
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(task_id = %id, "task cancellation requested");
        Ok(true)
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id))
            .map(|e| {
                let t = lock(&e.task);
                TaskSummary {
                    task_id: t.id(),
                    goal: t.goal().text().to_string(),
                    status: t.status(),
                    created_at: t.created_at(),
                }
            })
            .collect()
    }

    /// 移除已结束的任务（结果交付之后）
    pub async fn remove(&self, id: TaskId) -> Result<Task, TaskError> {
        let mut table = self.table.write().await;
        let entry = table
            .entries
            .get(&id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        {
            let task = lock(&entry.task);
            if !task.status().is_terminal() {
                return Err(task.transition_error("remove"));
            }
        }
        table.order.retain(|x| *x != id);
        let entry = table
            .entries
            .remove(&id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        let task = lock(&entry.task).clone();
        Ok(task)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }
}

/// 执行权：唯一持有者记录步骤结果并结束任务
pub struct TaskHandle {
    id: TaskId,
    task: Arc<Mutex<Task>>,
    cancel: CancellationToken,
    status_tx: Arc<watch::Sender<TaskStatus>>,
    metrics_tx: Arc<watch::Sender<TaskMetrics>>,
    completed: bool,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn goal(&self) -> Goal {
        lock(&self.task).goal().clone()
    }

    pub fn plan(&self) -> Plan {
        lock(&self.task).plan().clone()
    }

    pub fn step(&self, index: usize) -> Option<Step> {
        lock(&self.task).plan().steps.get(index).cloned()
    }

    pub fn step_count(&self) -> usize {
        lock(&self.task).plan().len()
    }

    pub fn results(&self) -> Vec<StepResult> {
        lock(&self.task).results().to_vec()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn record_step_result(&self, result: StepResult) -> Result<(), TaskError> {
        lock(&self.task).record(result)
    }

    pub fn revise_step(&self, index: usize, step: Step) -> Result<(), TaskError> {
        lock(&self.task).revise_step(index, step)
    }

    pub fn publish_metrics(&self, metrics: TaskMetrics) {
        self.metrics_tx.send_replace(metrics);
    }

    /// Running → Success | Failed，返回最终任务
    pub fn complete(
        mut self,
        success: bool,
        failure: Option<TaskFailure>,
    ) -> Result<Task, TaskError> {
        self.completed = true;
        self.finish(success, failure)
    }

    fn finish(&self, success: bool, failure: Option<TaskFailure>) -> Result<Task, TaskError> {
        let task = {
            let mut task = lock(&self.task);
            task.complete(success, failure)?;
            task.clone()
        };
        self.status_tx.send_replace(task.status());
        tracing::info!(task_id = %self.id, status = %task.status(), "task completed");
        Ok(task)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // 执行体未走到 complete（例如 panic）：任务仍须到达终态
        tracing::error!(task_id = %self.id, "task handle dropped before completion");
        let failure = TaskFailure {
            kind: FailureKind::Unclassified,
            detail: "execution ended without completing the task".to_string(),
            step_index: None,
        };
        let _ = self.finish(false, Some(failure));
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Parameters, Tier};

    fn plan(n: usize) -> Plan {
        let steps = (0..n)
            .map(|i| Step::new(ToolKind::Generate, format!("step {i}"), Parameters::new()))
            .collect();
        Plan::new(steps, Tier::Rule, "test")
    }

    fn ok_result(i: usize) -> StepResult {
        StepResult {
            step_index: i,
            tool: ToolKind::Generate,
            outcome: StepOutcome::Ok { value: Value::Null },
            attempt_count: 1,
            duration: Duration::from_millis(1),
            dispatches: vec![DispatchRecord {
                tool: ToolKind::Generate,
                ok: true,
            }],
        }
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let mgr = TaskManager::new(10);
        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let handle = mgr.start(id).await.unwrap();
        let err = mgr.start(id).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { action: "start", .. }));
        handle.complete(true, None).unwrap();
    }

    #[tokio::test]
    async fn test_record_bounded_by_plan_len() {
        let mgr = TaskManager::new(10);
        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let handle = mgr.start(id).await.unwrap();
        handle.record_step_result(ok_result(0)).unwrap();
        assert!(matches!(
            handle.record_step_result(ok_result(1)),
            Err(TaskError::ResultsFull(_))
        ));
        let task = handle.complete(true, None).unwrap();
        assert_eq!(task.status(), TaskStatus::Success);
        assert!(task.end_time().is_some());
        assert_eq!(task.results().len(), 1);
    }

    #[tokio::test]
    async fn test_end_time_only_when_terminal() {
        let mgr = TaskManager::new(10);
        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let snap = mgr.snapshot(id).await.unwrap();
        assert_eq!(snap.task.status(), TaskStatus::Pending);
        assert!(snap.task.start_time().is_none());
        assert!(snap.task.end_time().is_none());

        let handle = mgr.start(id).await.unwrap();
        let snap = mgr.snapshot(id).await.unwrap();
        assert!(snap.task.start_time().is_some());
        assert!(snap.task.end_time().is_none());
        drop(handle);

        // 未 complete 就丢弃句柄 → Failed/Unclassified
        let snap = mgr.snapshot(id).await.unwrap();
        assert_eq!(snap.task.status(), TaskStatus::Failed);
        assert_eq!(snap.task.failure().unwrap().kind, FailureKind::Unclassified);
        assert!(snap.task.end_time().is_some());
    }

    #[tokio::test]
    async fn test_wait_observes_terminal() {
        let mgr = Arc::new(TaskManager::new(10));
        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let handle = mgr.start(id).await.unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.wait(id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle
            .complete(
                false,
                Some(TaskFailure {
                    kind: FailureKind::ToolFailure,
                    detail: "boom".into(),
                    step_index: Some(0),
                }),
            )
            .unwrap();
        let snap = waiter.await.unwrap().unwrap();
        assert_eq!(snap.task.status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_and_eviction() {
        let mgr = TaskManager::new(2);
        let a = mgr.create(Goal::new("a"), plan(1)).await;
        assert!(mgr.remove(a).await.is_err());
        mgr.start(a).await.unwrap().complete(true, None).unwrap();

        let b = mgr.create(Goal::new("b"), plan(1)).await;
        // 表已满：创建 c 时淘汰已结束的 a
        let c = mgr.create(Goal::new("c"), plan(1)).await;
        assert!(mgr.snapshot(a).await.is_none());
        let ids: Vec<_> = mgr.list().await.into_iter().map(|s| s.task_id).collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[tokio::test]
    async fn test_cancel_sets_token() {
        let mgr = TaskManager::new(10);
        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let handle = mgr.start(id).await.unwrap();
        assert!(mgr.cancel(id).await.unwrap());
        assert!(handle.is_cancelled());
        handle.complete(false, None).unwrap();
        assert!(!mgr.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_without_cause_is_unclassified() {
        let mgr = TaskManager::new(10);
        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let task = mgr.start(id).await.unwrap().complete(false, None).unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        let failure = task.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Unclassified);
        assert_eq!(failure.step_index, None);

        let id = mgr.create(Goal::new("g"), plan(1)).await;
        let task = mgr.start(id).await.unwrap().complete(true, None).unwrap();
        assert!(task.failure().is_none());
    }

    #[test]
    fn test_task_id_parse_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_step_result_serializes_duration_ms() {
        let v = serde_json::to_value(StepResult {
            step_index: 0,
            tool: ToolKind::ReadFile,
            outcome: StepOutcome::err(FailureKind::ToolFailure, "File not found"),
            attempt_count: 1,
            duration: Duration::from_millis(42),
            dispatches: Vec::new(),
        })
        .unwrap();
        assert_eq!(v["duration_ms"], 42);
        assert_eq!(v["outcome"]["status"], "err");
        assert_eq!(v["outcome"]["kind"], "tool_failure");
    }
}
