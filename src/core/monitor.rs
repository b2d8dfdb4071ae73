//! ExecutionMonitor：按序执行计划步骤并监督
//!
//! 每个步骤：取消检查 → 解析 `{{step.N}}` → 分发（期间按 poll_interval 发布指标，超出预算判 Timeout）
//! → 失败交给 RecoveryPolicy → 记录一个 StepResult。重试前检查取消。结束后 complete 并更新模式统计。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::MissedTickBehavior;

use crate::core::error::{FailureKind, TaskError};
use crate::core::recovery::{RecoveryAction, RecoveryContext, RecoveryPolicy};
use crate::core::task::{DispatchRecord, StepOutcome, StepResult, Task, TaskFailure, TaskHandle, TaskMetrics};
use crate::memory::PatternLearner;
use crate::planner::validator::placeholder_regex;
use crate::planner::{Goal, Step};
use crate::tools::{InvocationContext, ToolDispatcher, ToolKind};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub step_timeout: Duration,
    pub timeout_extension_factor: f64,
    pub max_errors: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            step_timeout: Duration::from_millis(30_000),
            timeout_extension_factor: 2.0,
            max_errors: 5,
        }
    }
}

/// 把参数中的 `{{step.N}}` 替换为第 N 步的输出；字符串原样插入，其余值按 JSON 文本插入
fn resolve_value(value: &Value, outputs: &[Value]) -> Value {
    match value {
        Value::String(s) => {
            let Some(re) = placeholder_regex() else {
                return value.clone();
            };
            let replaced = re.replace_all(s, |caps: &regex::Captures<'_>| {
                let output = caps
                    .get(1)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .and_then(|i| outputs.get(i));
                match output {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                }
            });
            Value::String(replaced.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, outputs)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_step(step: &Step, outputs: &[Value]) -> Step {
    let mut resolved = step.clone();
    resolved.parameters = step
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, outputs)))
        .collect();
    resolved
}

pub struct ExecutionMonitor {
    dispatcher: Arc<ToolDispatcher>,
    recovery: Arc<RecoveryPolicy>,
    learner: PatternLearner,
    settings: MonitorSettings,
}

impl ExecutionMonitor {
    pub fn new(
        dispatcher: Arc<ToolDispatcher>,
        recovery: Arc<RecoveryPolicy>,
        learner: PatternLearner,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            dispatcher,
            recovery,
            learner,
            settings,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    fn publish(&self, handle: &TaskHandle, metrics: &TaskMetrics) {
        let mut snapshot = metrics.clone();
        snapshot.resource_usage = self.dispatcher.ledger().usage();
        handle.publish_metrics(snapshot);
    }

    /// 执行到结束或中止；消耗 handle
    pub async fn run(&self, handle: TaskHandle) -> Result<Task, TaskError> {
        let task_id = handle.id();
        let goal = handle.goal();
        let plan = handle.plan();
        let mut metrics = TaskMetrics::default();
        let mut outputs: Vec<Value> = Vec::with_capacity(plan.len());
        let mut failure: Option<TaskFailure> = None;

        for index in 0..plan.len() {
            if handle.is_cancelled() {
                tracing::info!(task_id = %task_id, step = index, "task cancelled between steps");
                failure = Some(TaskFailure {
                    kind: FailureKind::Cancelled,
                    detail: "Task cancelled".to_string(),
                    step_index: Some(index),
                });
                break;
            }
            metrics.current_step = Some(index);
            self.publish(&handle, &metrics);

            let result = self
                .run_step(&handle, index, &goal, &plan.fallback, &outputs, &mut metrics)
                .await;
            let step_failure = match &result.outcome {
                StepOutcome::Ok { value } => {
                    outputs.push(value.clone());
                    None
                }
                StepOutcome::Err { kind, detail } => Some(TaskFailure {
                    kind: *kind,
                    detail: detail.clone(),
                    step_index: Some(index),
                }),
            };
            if let Err(e) = handle.record_step_result(result) {
                tracing::error!(task_id = %task_id, step = index, error = %e, "step result rejected");
                failure = Some(TaskFailure {
                    kind: FailureKind::Unclassified,
                    detail: e.to_string(),
                    step_index: Some(index),
                });
                break;
            }
            if step_failure.is_some() {
                failure = step_failure;
                break;
            }
            metrics.steps_completed += 1;
        }

        metrics.current_step = None;
        self.publish(&handle, &metrics);
        let task = handle.complete(failure.is_none(), failure)?;
        self.learner.observe_task(&task);
        Ok(task)
    }

    async fn run_step(
        &self,
        handle: &TaskHandle,
        index: usize,
        goal: &Goal,
        fallback: &[ToolKind],
        outputs: &[Value],
        metrics: &mut TaskMetrics,
    ) -> StepResult {
        let Some(mut step) = handle.step(index) else {
            tracing::error!(task_id = %handle.id(), step = index, "step index out of range");
            return StepResult {
                step_index: index,
                tool: ToolKind::Generate,
                outcome: StepOutcome::err(FailureKind::Unclassified, "Step not found"),
                attempt_count: 0,
                duration: Duration::ZERO,
                dispatches: Vec::new(),
            };
        };
        let mut recovery = RecoveryContext::new(step.tool, fallback.to_vec());
        let mut invocation = InvocationContext::new(handle.id(), index);
        let mut budget = self.settings.step_timeout;
        let mut attempts = 0u32;
        let mut elapsed = Duration::ZERO;
        let mut trace = Vec::new();

        loop {
            attempts += 1;
            let resolved = resolve_step(&step, outputs);
            let mut result = self
                .supervise(handle, &resolved, &invocation, budget, metrics)
                .await;
            elapsed += result.duration;
            trace.append(&mut result.dispatches);
            result.attempt_count = attempts;
            result.duration = elapsed;
            result.dispatches = trace.clone();

            let Some(kind) = result.outcome.failure_kind() else {
                return result;
            };
            metrics.errors_encountered += 1;
            if metrics.errors_encountered > self.settings.max_errors {
                tracing::warn!(
                    task_id = %handle.id(),
                    errors = metrics.errors_encountered,
                    max_errors = self.settings.max_errors,
                    "error budget exceeded, aborting"
                );
                return result;
            }

            if handle.is_cancelled() {
                tracing::info!(task_id = %handle.id(), step = index, "task cancelled during recovery");
                result.outcome = StepOutcome::err(FailureKind::Cancelled, "Task cancelled");
                return result;
            }

            let action = self.decide(kind, index, goal, &mut step, &mut recovery);
            match action {
                RecoveryAction::Abort => return result,
                RecoveryAction::RetrySameStep { backoff } => {
                    if !backoff.is_zero() {
                        let token = handle.cancellation_token();
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = token.cancelled() => {
                                tracing::info!(task_id = %handle.id(), step = index, "task cancelled during backoff");
                                result.outcome = StepOutcome::err(FailureKind::Cancelled, "Task cancelled");
                                return result;
                            }
                        }
                    }
                }
                RecoveryAction::SubstituteTool(_) => {}
                RecoveryAction::ExtendTimeoutAndRetry => {
                    budget = budget.mul_f64(self.settings.timeout_extension_factor.max(1.0));
                }
                RecoveryAction::EscalatePermission => invocation.escalated = true,
            }
            if let Err(e) = handle.revise_step(index, step.clone()) {
                tracing::error!(task_id = %handle.id(), step = index, error = %e, "failed to revise step");
                return result;
            }
        }
    }

    /// 取得恢复动作并生成修订后的步骤；换工具失败时继续尝试下一个备选
    fn decide(
        &self,
        kind: FailureKind,
        index: usize,
        goal: &Goal,
        step: &mut Step,
        ctx: &mut RecoveryContext,
    ) -> RecoveryAction {
        loop {
            let action = self.recovery.recover(kind, step, ctx);
            if action == RecoveryAction::Abort {
                return action;
            }
            match self.recovery.revise(index, step, &action, goal) {
                Ok(revised) => {
                    *step = revised;
                    return action;
                }
                Err(e) => {
                    tracing::warn!(step = index, action = ?action, error = %e, "step revision failed");
                    if !matches!(action, RecoveryAction::SubstituteTool(_)) {
                        return RecoveryAction::Abort;
                    }
                }
            }
        }
    }

    /// 单次分发，期间轮询发布指标；超出 budget 时丢弃分发 future（资源预留随之释放）
    async fn supervise(
        &self,
        handle: &TaskHandle,
        step: &Step,
        invocation: &InvocationContext,
        budget: Duration,
        metrics: &TaskMetrics,
    ) -> StepResult {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + budget;
        let dispatch = self.dispatcher.dispatch(step, invocation);
        tokio::pin!(dispatch);
        let mut poll = tokio::time::interval(self.settings.poll_interval.max(Duration::from_millis(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                result = &mut dispatch => return result,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        task_id = %handle.id(),
                        step = invocation.step_index,
                        tool = %step.tool,
                        budget_ms = budget.as_millis() as u64,
                        "step exceeded time budget"
                    );
                    return StepResult {
                        step_index: invocation.step_index,
                        tool: step.tool,
                        outcome: StepOutcome::err(
                            FailureKind::Timeout,
                            format!("Step exceeded time budget of {}ms", budget.as_millis()),
                        ),
                        attempt_count: 1,
                        duration: started.elapsed(),
                        dispatches: vec![DispatchRecord {
                            tool: step.tool,
                            ok: false,
                        }],
                    };
                }
                _ = poll.tick() => {
                    self.publish(handle, metrics);
                    tracing::debug!(
                        task_id = %handle.id(),
                        step = invocation.step_index,
                        steps_completed = metrics.steps_completed,
                        errors = metrics.errors_encountered,
                        "monitor poll"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::error::ToolError;
    use crate::core::ledger::ResourceLedger;
    use crate::core::recovery::RecoverySettings;
    use crate::core::task::{TaskManager, TaskStatus};
    use crate::memory::{PatternStore, NEUTRAL_PRIOR};
    use crate::planner::{Parameters, Plan, PlanValidator, Tier};
    use crate::tools::{CapabilityRegistry, Tool};

    /// 返回参数中的 prompt / query
    struct Echo(ToolKind);

    #[async_trait]
    impl Tool for Echo {
        fn kind(&self) -> ToolKind {
            self.0
        }
        fn description(&self) -> &str {
            "echo"
        }
        async fn invoke(&self, params: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
            let v = params
                .get("prompt")
                .or_else(|| params.get("query"))
                .or_else(|| params.get("pattern"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(v)
        }
    }

    struct Failing {
        kind: ToolKind,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Failing {
        fn kind(&self) -> ToolKind {
            self.kind
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn invoke(&self, _: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::Failed("boom".to_string()))
        }
    }

    /// 未提权时拒绝执行
    struct Guarded;

    #[async_trait]
    impl Tool for Guarded {
        fn kind(&self) -> ToolKind {
            ToolKind::ExecuteCommand
        }
        fn description(&self) -> &str {
            "needs escalation"
        }
        async fn invoke(&self, _: &Parameters, ctx: &InvocationContext) -> Result<Value, ToolError> {
            if ctx.escalated {
                Ok(json!("ran"))
            } else {
                Err(ToolError::PermissionDenied("Command not allowed: deploy".into()))
            }
        }
    }

    struct Rejecting {
        kind: ToolKind,
        error: fn() -> ToolError,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Rejecting {
        fn kind(&self) -> ToolKind {
            self.kind
        }
        fn description(&self) -> &str {
            "always rejects"
        }
        async fn invoke(&self, _: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn kind(&self) -> ToolKind {
            ToolKind::ExecuteCommand
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn invoke(&self, _: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct Harness {
        manager: TaskManager,
        monitor: ExecutionMonitor,
        store: Arc<PatternStore>,
    }

    fn harness(registry: CapabilityRegistry, settings: MonitorSettings) -> Harness {
        harness_with(registry, settings, RecoverySettings::default())
    }

    fn harness_with(
        registry: CapabilityRegistry,
        settings: MonitorSettings,
        recovery: RecoverySettings,
    ) -> Harness {
        let registry = Arc::new(registry);
        let validator = Arc::new(PlanValidator::new(registry.clone()));
        let store = Arc::new(PatternStore::new());
        let dispatcher = Arc::new(ToolDispatcher::new(registry.clone(), ResourceLedger::unbounded()));
        let recovery = Arc::new(RecoveryPolicy::new(recovery, registry, validator));
        Harness {
            manager: TaskManager::new(16),
            monitor: ExecutionMonitor::new(dispatcher, recovery, PatternLearner::new(store.clone()), settings),
            store,
        }
    }

    fn step(tool: ToolKind, params: Value) -> Step {
        Step::new(tool, "test", params.as_object().cloned().unwrap_or_default())
    }

    async fn run(h: &Harness, plan: Plan) -> Task {
        let id = h.manager.create(Goal::new("find *.rs"), plan).await;
        let handle = h.manager.start(id).await.unwrap();
        h.monitor.run(handle).await.unwrap()
    }

    #[tokio::test]
    async fn test_placeholders_resolved_in_order() {
        let mut reg = CapabilityRegistry::new();
        reg.register(Echo(ToolKind::SearchCode));
        reg.register(Echo(ToolKind::Generate));
        let h = harness(reg, MonitorSettings::default());
        let plan = Plan::new(
            vec![
                step(ToolKind::SearchCode, json!({"query": "alpha"})),
                step(ToolKind::Generate, json!({"prompt": "use {{step.0}}"})),
            ],
            Tier::Rule,
            "code_search",
        );
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Success);
        assert_eq!(task.results().len(), 2);
        assert_eq!(task.results()[1].outcome, StepOutcome::Ok { value: json!("use alpha") });
        assert_eq!(h.store.counts("code_search", ToolKind::Generate), (1, 0));
    }

    #[tokio::test]
    async fn test_substitution_credits_fallback_tool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = CapabilityRegistry::new();
        reg.register(Failing {
            kind: ToolKind::SearchCode,
            calls: calls.clone(),
        });
        reg.register(Echo(ToolKind::FileSearch));
        let h = harness(reg, MonitorSettings::default());
        let plan = Plan::new(
            vec![step(ToolKind::SearchCode, json!({"query": "x"}))],
            Tier::Rule,
            "code_search",
        )
        .with_fallback(vec![ToolKind::FileSearch]);
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Success);
        let result = &task.results()[0];
        assert_eq!(result.tool, ToolKind::FileSearch);
        assert_eq!(result.attempt_count, 2);
        assert_eq!(result.outcome, StepOutcome::Ok { value: json!("*.rs") });
        assert_eq!(task.plan().steps[0].tool, ToolKind::FileSearch);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.dispatches,
            vec![
                DispatchRecord { tool: ToolKind::SearchCode, ok: false },
                DispatchRecord { tool: ToolKind::FileSearch, ok: true },
            ]
        );
        // 被挽救的失败同样计入
        assert_eq!(h.store.counts("code_search", ToolKind::FileSearch), (1, 0));
        assert_eq!(h.store.counts("code_search", ToolKind::SearchCode), (0, 1));
        assert!(h.store.success_rate("code_search", ToolKind::SearchCode) < NEUTRAL_PRIOR);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let mut reg = CapabilityRegistry::new();
        reg.register(Failing {
            kind: ToolKind::SearchCode,
            calls: Arc::new(AtomicUsize::new(0)),
        });
        reg.register(Echo(ToolKind::Generate));
        let h = harness(reg, MonitorSettings::default());
        let plan = Plan::new(
            vec![
                step(ToolKind::SearchCode, json!({"query": "x"})),
                step(ToolKind::Generate, json!({"prompt": "y"})),
            ],
            Tier::Rule,
            "code_search",
        );
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.results().len(), 1);
        let failure = task.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::ToolFailure);
        assert_eq!(failure.detail, "boom");
        assert_eq!(failure.step_index, Some(0));
        assert_eq!(h.store.counts("code_search", ToolKind::SearchCode), (0, 1));
    }

    #[tokio::test]
    async fn test_timeout_extended_once_then_aborts() {
        let mut reg = CapabilityRegistry::new();
        reg.register(Slow);
        let settings = MonitorSettings {
            poll_interval: Duration::from_millis(5),
            step_timeout: Duration::from_millis(20),
            ..MonitorSettings::default()
        };
        let h = harness(reg, settings);
        let plan = Plan::new(
            vec![step(ToolKind::ExecuteCommand, json!({"command": "sleep"}))],
            Tier::Rule,
            "command_execution",
        );
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        let result = &task.results()[0];
        assert_eq!(result.attempt_count, 2);
        assert_eq!(result.outcome.failure_kind(), Some(FailureKind::Timeout));
        assert!(result.duration >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_error_budget_stops_recovery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = CapabilityRegistry::new();
        reg.register(Failing {
            kind: ToolKind::SearchCode,
            calls: calls.clone(),
        });
        reg.register(Echo(ToolKind::FileSearch));
        let h = harness(
            reg,
            MonitorSettings {
                max_errors: 0,
                ..MonitorSettings::default()
            },
        );
        let plan = Plan::new(
            vec![step(ToolKind::SearchCode, json!({"query": "x"}))],
            Tier::Rule,
            "code_search",
        )
        .with_fallback(vec![ToolKind::FileSearch]);
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.results()[0].tool, ToolKind::SearchCode);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let mut reg = CapabilityRegistry::new();
        reg.register(Echo(ToolKind::Generate));
        let h = harness(reg, MonitorSettings::default());
        let plan = Plan::new(vec![step(ToolKind::Generate, json!({"prompt": "y"}))], Tier::Keyword, "general");
        let id = h.manager.create(Goal::new("explain"), plan).await;
        let handle = h.manager.start(id).await.unwrap();
        assert!(h.manager.cancel(id).await.unwrap());
        let task = h.monitor.run(handle).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.results().is_empty());
        assert_eq!(task.failure().unwrap().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn test_escalation_retries_with_elevated_context() {
        let mut reg = CapabilityRegistry::new();
        reg.register(Guarded);
        let h = harness_with(
            reg,
            MonitorSettings::default(),
            RecoverySettings {
                allow_escalation: true,
                ..RecoverySettings::default()
            },
        );
        let plan = Plan::new(
            vec![step(ToolKind::ExecuteCommand, json!({"command": "deploy", "timeout_secs": 5}))],
            Tier::Rule,
            "command_execution",
        );
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Success);
        let result = &task.results()[0];
        assert_eq!(result.attempt_count, 2);
        assert_eq!(result.outcome, StepOutcome::Ok { value: json!("ran") });
        assert_eq!(h.store.counts("command_execution", ToolKind::ExecuteCommand), (1, 1));
    }

    #[tokio::test]
    async fn test_permission_denied_aborts_without_escalation() {
        let mut reg = CapabilityRegistry::new();
        reg.register(Guarded);
        let h = harness(reg, MonitorSettings::default());
        let plan = Plan::new(
            vec![step(ToolKind::ExecuteCommand, json!({"command": "deploy", "timeout_secs": 5}))],
            Tier::Rule,
            "command_execution",
        );
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.results()[0].attempt_count, 1);
        assert_eq!(task.failure().unwrap().kind, FailureKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_invalid_input_retried_once_then_aborts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = CapabilityRegistry::new();
        reg.register(Rejecting {
            kind: ToolKind::ReadFile,
            error: || ToolError::InvalidInput("start_line is after end_line".into()),
            calls: calls.clone(),
        });
        let h = harness(reg, MonitorSettings::default());
        let plan = Plan::new(
            vec![step(ToolKind::ReadFile, json!({"path": "a.txt"}))],
            Tier::Rule,
            "file_operations",
        );
        let task = run(&h, plan).await;
        assert_eq!(task.status(), TaskStatus::Failed);
        let result = &task.results()[0];
        assert_eq!(result.attempt_count, 2);
        assert_eq!(result.outcome.failure_kind(), Some(FailureKind::InvalidInput));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.counts("file_operations", ToolKind::ReadFile), (0, 2));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = CapabilityRegistry::new();
        reg.register(Rejecting {
            kind: ToolKind::ReadFile,
            error: || ToolError::ResourceUnavailable("busy".into()),
            calls: calls.clone(),
        });
        let h = Arc::new(harness_with(
            reg,
            MonitorSettings::default(),
            RecoverySettings {
                resource_retries: 5,
                backoff_base: Duration::from_secs(10),
                backoff_max: Duration::from_secs(10),
                ..RecoverySettings::default()
            },
        ));
        let plan = Plan::new(
            vec![step(ToolKind::ReadFile, json!({"path": "a.txt"}))],
            Tier::Rule,
            "file_operations",
        );
        let id = h.manager.create(Goal::new("read file a.txt"), plan).await;
        let handle = h.manager.start(id).await.unwrap();
        let runner = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.monitor.run(handle).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.manager.cancel(id).await.unwrap());

        let task = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("backoff was not interrupted")
            .unwrap()
            .unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.failure().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.counts("file_operations", ToolKind::ReadFile), (0, 1));
    }

    #[test]
    fn test_resolve_non_string_output() {
        let outputs = vec![json!({"files": ["a.rs"]}), json!("text")];
        let v = resolve_value(&json!(["{{step.0}}", "{{step.1}}!", "{{step.9}}"]), &outputs);
        assert_eq!(v, json!([r#"{"files":["a.rs"]}"#, "text!", "{{step.9}}"]));
    }
}
