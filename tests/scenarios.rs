//! 端到端场景：规划 → 执行 → 恢复 → 模式学习

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

use ant::core::{FailureKind, ResourceKind, StepOutcome, ToolError};
use ant::llm::MockLlmClient;
use ant::planner::{Parameters, RuleSet, Tier};
use ant::tools::{InvocationContext, Tool, ToolCapability, ToolKind};
use ant::{Agent, AgentBuilder, AppConfig, Goal, TaskStatus};

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.llm.provider = "mock".to_string();
    cfg.planning.enable_model_tier = false;
    cfg.tools.enable_execute_command = false;
    cfg.recovery.backoff_base_ms = 1;
    cfg.recovery.backoff_max_ms = 5;
    cfg.monitor.poll_interval_ms = 10;
    cfg
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("test.txt"), "this is a file in workspace").unwrap();
    dir
}

fn build(cfg: AppConfig, dir: &tempfile::TempDir) -> Agent {
    AgentBuilder::new(cfg)
        .with_workspace(dir.path())
        .with_llm(Arc::new(MockLlmClient::echo()))
        .build()
        .unwrap()
}

/// 进入时通知 entered，然后阻塞直到 gate 打开
struct GatedRead {
    entered: Arc<Notify>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl Tool for GatedRead {
    fn kind(&self) -> ToolKind {
        ToolKind::ReadFile
    }

    fn description(&self) -> &str {
        "gated read"
    }

    async fn invoke(&self, params: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
        self.entered.notify_one();
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(params.get("path").cloned().unwrap_or(Value::Null))
    }
}

/// 始终资源不足
struct AlwaysBusy {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for AlwaysBusy {
    fn kind(&self) -> ToolKind {
        ToolKind::ReadFile
    }

    fn description(&self) -> &str {
        "always busy"
    }

    async fn invoke(&self, _: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::ResourceUnavailable("backend busy".into()))
    }
}

fn exclusive_read_capability() -> ToolCapability {
    ToolCapability::standard(ToolKind::ReadFile)
        .with_resources(BTreeMap::from([(ResourceKind::WorkspaceWrite, 1)]))
}

#[tokio::test]
async fn test_read_file_via_rule_pattern() {
    let dir = workspace();
    let agent = build(test_config(), &dir);

    let report = agent.run_goal(Goal::new("read file test.txt")).await.unwrap();

    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(report.tier_used, Tier::Rule);
    assert_eq!(report.pattern, "file_operations");
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].tool, ToolKind::ReadFile);
    assert_eq!(
        report.results[0].outcome,
        StepOutcome::Ok {
            value: json!("this is a file in workspace")
        }
    );
    assert_eq!(agent.patterns().counts("file_operations", ToolKind::ReadFile), (1, 0));
}

#[tokio::test]
async fn test_missing_file_fails_without_fallback() {
    let dir = workspace();
    let agent = build(test_config(), &dir);

    let report = agent.run_goal(Goal::new("read file nonexistent.txt")).await.unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    let last = report.results.last().unwrap();
    assert_eq!(last.outcome, StepOutcome::err(FailureKind::ToolFailure, "File not found"));
    assert_eq!(last.attempt_count, 1);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::ToolFailure);
    assert_eq!(failure.step_index, Some(0));
    assert_eq!(agent.patterns().counts("file_operations", ToolKind::ReadFile), (0, 1));
}

#[tokio::test]
async fn test_unparseable_model_output_falls_to_clarify() {
    let dir = workspace();
    let mut cfg = test_config();
    cfg.planning.enable_model_tier = true;
    let llm = Arc::new(MockLlmClient::scripted([
        "I think you should profile it first.",
        "Sorry, still prose.",
    ]));
    let agent = AgentBuilder::new(cfg)
        .with_workspace(dir.path())
        .with_llm(llm.clone())
        .build()
        .unwrap();

    let report = agent.run_goal(Goal::new("optimize performance")).await.unwrap();

    assert_eq!(report.tier_used, Tier::Keyword);
    assert_eq!(report.pattern, "keyword:clarify");
    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(report.results[0].tool, ToolKind::Generate);
    // 两次规划尝试 + 一次澄清生成
    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[2].contains("optimize performance"));
}

#[tokio::test]
async fn test_write_then_read_back() {
    let dir = workspace();
    let agent = build(test_config(), &dir);

    let report = agent
        .run_goal(Goal::new("write file notes/todo.txt buy milk"))
        .await
        .unwrap();
    assert_eq!(report.status, TaskStatus::Success);
    assert_eq!(report.pattern, "file_writing");
    let written = std::fs::read_to_string(dir.path().join("notes/todo.txt")).unwrap();
    assert_eq!(written, "buy milk");

    let report = agent.run_goal(Goal::new("read file notes/todo.txt")).await.unwrap();
    assert_eq!(
        report.results[0].outcome,
        StepOutcome::Ok {
            value: json!("buy milk")
        }
    );
}

#[tokio::test]
async fn test_path_escape_is_permission_denied() {
    let dir = workspace();
    let agent = build(test_config(), &dir);

    let report = agent.run_goal(Goal::new("read file ../secret.txt")).await.unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.failure.unwrap().kind, FailureKind::PermissionDenied);
}

#[tokio::test]
async fn test_contended_resource_then_success_after_release() {
    let dir = workspace();
    let mut cfg = test_config();
    cfg.recovery.resource_retries = 0;
    let entered = Arc::new(Notify::new());
    let (open_tx, open_rx) = watch::channel(false);
    let agent = AgentBuilder::new(cfg)
        .with_workspace(dir.path())
        .with_llm(Arc::new(MockLlmClient::echo()))
        .with_capability(
            exclusive_read_capability(),
            Arc::new(GatedRead {
                entered: entered.clone(),
                gate: open_rx,
            }),
        )
        .build()
        .unwrap();

    let first = agent.submit(Goal::new("read file a.txt")).await.unwrap();
    entered.notified().await;

    let second = agent.run_goal(Goal::new("read file b.txt")).await.unwrap();
    assert_eq!(second.status, TaskStatus::Failed);
    assert_eq!(second.failure.unwrap().kind, FailureKind::ResourceUnavailable);
    assert_eq!(
        second.results[0].outcome.failure_kind(),
        Some(FailureKind::ResourceUnavailable)
    );

    open_tx.send(true).unwrap();
    let first = agent.wait(first).await.unwrap();
    assert_eq!(first.status, TaskStatus::Success);

    let third = agent.run_goal(Goal::new("read file c.txt")).await.unwrap();
    assert_eq!(third.status, TaskStatus::Success);
    assert_eq!(third.results[0].outcome, StepOutcome::Ok { value: json!("c.txt") });

    let stats = agent.ledger().stats();
    assert_eq!(stats.granted, stats.released);
    assert!(agent.ledger().usage().values().all(|u| u.in_use == 0));
}

#[tokio::test]
async fn test_resource_retries_are_bounded() {
    let dir = workspace();
    let mut cfg = test_config();
    cfg.recovery.resource_retries = 2;
    let calls = Arc::new(AtomicUsize::new(0));
    let agent = AgentBuilder::new(cfg)
        .with_workspace(dir.path())
        .with_llm(Arc::new(MockLlmClient::echo()))
        .with_tool(AlwaysBusy { calls: calls.clone() })
        .build()
        .unwrap();

    let report = agent.run_goal(Goal::new("read file test.txt")).await.unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.results[0].attempt_count, 3);
    assert_eq!(report.failure.unwrap().kind, FailureKind::ResourceUnavailable);
    // 每次重试都计一次失败
    assert_eq!(agent.patterns().counts("file_operations", ToolKind::ReadFile), (0, 3));
}

#[tokio::test]
async fn test_cancel_between_steps() {
    let dir = workspace();
    let mut cfg = test_config();
    cfg.planning.learned_ordering = false;
    let rules = RuleSet::from_toml_str(
        r#"
[task_patterns.double_read]
patterns = ["twice"]
tools = ["read_file", "read_file"]
fallback = []
"#,
        "inline",
    )
    .unwrap();
    let entered = Arc::new(Notify::new());
    let (open_tx, open_rx) = watch::channel(false);
    let agent = AgentBuilder::new(cfg)
        .with_workspace(dir.path())
        .with_llm(Arc::new(MockLlmClient::echo()))
        .with_rules(rules)
        .with_capability(
            ToolCapability::standard(ToolKind::ReadFile),
            Arc::new(GatedRead {
                entered: entered.clone(),
                gate: open_rx,
            }),
        )
        .build()
        .unwrap();

    let id = agent.submit(Goal::new("twice test.txt")).await.unwrap();
    entered.notified().await;
    assert_eq!(agent.snapshot(id).await.unwrap().task.status(), TaskStatus::Running);
    assert!(agent.cancel(id).await.unwrap());
    open_tx.send(true).unwrap();

    let report = agent.wait(id).await.unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].outcome.is_ok());
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.step_index, Some(1));
}

#[tokio::test]
async fn test_submitted_tasks_are_listed() {
    let dir = workspace();
    let agent = build(test_config(), &dir);

    let id = agent.submit(Goal::new("read file test.txt")).await.unwrap();
    let report = agent.wait(id).await.unwrap();
    assert_eq!(report.task_id, id);

    let listed = agent.list().await;
    assert!(listed.iter().any(|s| s.task_id == id && s.status == TaskStatus::Success));

    agent.remove(id).await.unwrap();
    assert!(agent.snapshot(id).await.is_none());
}
