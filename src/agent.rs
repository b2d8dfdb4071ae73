//! Agent 运行时：目标 → 计划 → 任务 → 监督执行 → 报告
//!
//! CLI 与 JSON-RPC 服务共用；由 AgentBuilder 组装，Clone 后共享同一套组件。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::core::error::AgentError;
use crate::core::ledger::ResourceLedger;
use crate::core::monitor::ExecutionMonitor;
use crate::core::task::{
    StepResult, Task, TaskFailure, TaskId, TaskManager, TaskSnapshot, TaskStatus, TaskSummary,
};
use crate::llm::LlmClient;
use crate::memory::PatternStore;
use crate::planner::{Goal, Plan, PlanSynthesizer, PlanValidator, Tier};
use crate::tools::CapabilityRegistry;

/// 任务结束后交给调用方的报告
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub tier_used: Tier,
    pub pattern: String,
    pub results: Vec<StepResult>,
    pub failure: Option<TaskFailure>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskReport {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id(),
            goal: task.goal().text().to_string(),
            status: task.status(),
            tier_used: task.plan().tier_used,
            pattern: task.plan().pattern.clone(),
            results: task.results().to_vec(),
            failure: task.failure().cloned(),
            start_time: task.start_time(),
            end_time: task.end_time(),
        }
    }
}

pub(crate) struct AgentParts {
    pub config: AppConfig,
    pub workspace: PathBuf,
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<CapabilityRegistry>,
    pub ledger: ResourceLedger,
    pub patterns: Arc<PatternStore>,
    pub validator: Arc<PlanValidator>,
    pub synthesizer: PlanSynthesizer,
    pub monitor: ExecutionMonitor,
    pub tasks: TaskManager,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentParts>,
}

impl Agent {
    pub(crate) fn from_parts(parts: AgentParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    /// 生成并校验计划；Keyword 层计划校验失败属于配置错误，直接返回
    pub async fn plan(&self, goal: &Goal) -> Result<Plan, AgentError> {
        let plan = self.inner.synthesizer.synthesize(goal).await;
        self.inner.validator.validate(plan).map_err(|e| {
            tracing::error!(goal = %goal.text(), error = %e, "synthesized plan is invalid");
            AgentError::from(e)
        })
    }

    /// 同步执行：规划 → 创建 → 启动 → 监督，返回最终报告
    pub async fn run_goal(&self, goal: Goal) -> Result<TaskReport, AgentError> {
        let plan = self.plan(&goal).await?;
        let id = self.inner.tasks.create(goal, plan).await;
        let handle = self.inner.tasks.start(id).await?;
        let task = self.inner.monitor.run(handle).await?;
        Ok(TaskReport::from(&task))
    }

    /// 后台执行，立即返回任务 id；状态经 snapshot / wait 查询
    pub async fn submit(&self, goal: Goal) -> Result<TaskId, AgentError> {
        let plan = self.plan(&goal).await?;
        let id = self.inner.tasks.create(goal, plan).await;
        let agent = self.clone();
        tokio::spawn(async move {
            let handle = match agent.inner.tasks.start(id).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "failed to start task");
                    return;
                }
            };
            if let Err(e) = agent.inner.monitor.run(handle).await {
                tracing::error!(task_id = %id, error = %e, "task execution failed");
            }
        });
        Ok(id)
    }

    pub async fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.tasks.snapshot(id).await
    }

    /// 等待后台任务结束
    pub async fn wait(&self, id: TaskId) -> Result<TaskReport, AgentError> {
        let snapshot = self.inner.tasks.wait(id).await?;
        Ok(TaskReport::from(&snapshot.task))
    }

    pub async fn cancel(&self, id: TaskId) -> Result<bool, AgentError> {
        Ok(self.inner.tasks.cancel(id).await?)
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        self.inner.tasks.list().await
    }

    pub async fn remove(&self, id: TaskId) -> Result<TaskReport, AgentError> {
        let task = self.inner.tasks.remove(id).await?;
        Ok(TaskReport::from(&task))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn workspace(&self) -> &Path {
        &self.inner.workspace
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }

    pub fn patterns(&self) -> &Arc<PatternStore> {
        &self.inner.patterns
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.inner.llm
    }

    pub fn synthesizer(&self) -> &PlanSynthesizer {
        &self.inner.synthesizer
    }
}
