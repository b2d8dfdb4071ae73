//! 工具分发器
//!
//! dispatch(step, ctx)：解析工具 → 向资源账本申请 → 调用（捕获 panic）→ 归还资源 → StepResult。
//! 每次分发输出一条结构化审计日志（JSON）；分发 future 被中途丢弃时也会输出（outcome = "dropped"）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;

use crate::core::error::FailureKind;
use crate::core::ledger::ResourceLedger;
use crate::core::task::{DispatchRecord, StepOutcome, StepResult};
use crate::planner::Step;
use crate::tools::capability::ToolKind;
use crate::tools::registry::{CapabilityRegistry, InvocationContext};

pub struct ToolDispatcher {
    registry: Arc<CapabilityRegistry>,
    ledger: ResourceLedger,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, ledger: ResourceLedger) -> Self {
        Self { registry, ledger }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// 单次分发；attempt_count 恒为 1，由监控器跨重试累计
    pub async fn dispatch(&self, step: &Step, ctx: &InvocationContext) -> StepResult {
        let start = Instant::now();
        let mut audit = Audit::new(step, ctx);
        let outcome = self.run(step, ctx).await;
        audit.finish(&outcome);
        let record = DispatchRecord {
            tool: step.tool,
            ok: outcome.is_ok(),
        };
        StepResult {
            step_index: ctx.step_index,
            tool: step.tool,
            outcome,
            attempt_count: 1,
            duration: start.elapsed(),
            dispatches: vec![record],
        }
    }

    async fn run(&self, step: &Step, ctx: &InvocationContext) -> StepOutcome {
        let (Some(tool), Some(capability)) =
            (self.registry.get(step.tool), self.registry.capability(step.tool))
        else {
            tracing::error!(
                task_id = %ctx.task_id,
                tool = %step.tool,
                "dispatch of unregistered tool"
            );
            return StepOutcome::err(
                FailureKind::Unclassified,
                format!("Tool not registered: {}", step.tool),
            );
        };

        let reservation = match self.ledger.try_reserve(ctx.task_id, &capability.resources) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(task_id = %ctx.task_id, tool = %step.tool, error = %e, "reservation refused");
                return StepOutcome::err(FailureKind::ResourceUnavailable, e.to_string());
            }
        };

        let result = AssertUnwindSafe(tool.invoke(&step.parameters, ctx))
            .catch_unwind()
            .await;
        reservation.release();

        match result {
            Ok(Ok(value)) => StepOutcome::Ok { value },
            Ok(Err(e)) => StepOutcome::err(e.kind(), e.detail()),
            Err(_) => {
                tracing::error!(task_id = %ctx.task_id, tool = %step.tool, "tool panicked");
                StepOutcome::err(FailureKind::ToolFailure, "Tool panicked")
            }
        }
    }
}

/// 审计记录；finish 之前被丢弃视为 dropped
struct Audit {
    task_id: String,
    tool: ToolKind,
    args_preview: String,
    start: Instant,
    done: bool,
}

impl Audit {
    fn new(step: &Step, ctx: &InvocationContext) -> Self {
        Self {
            task_id: ctx.task_id.to_string(),
            tool: step.tool,
            args_preview: args_preview(&step.parameters),
            start: Instant::now(),
            done: false,
        }
    }

    fn finish(&mut self, outcome: &StepOutcome) {
        let label = match outcome {
            StepOutcome::Ok { .. } => "ok".to_string(),
            StepOutcome::Err { kind, .. } => kind.to_string(),
        };
        self.emit(outcome.is_ok(), &label);
        self.done = true;
    }

    fn emit(&self, ok: bool, outcome: &str) {
        let audit = serde_json::json!({
            "event": "tool_audit",
            "task_id": self.task_id,
            "tool": self.tool.as_str(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": self.start.elapsed().as_millis() as u64,
            "args_preview": self.args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }
}

impl Drop for Audit {
    fn drop(&mut self) {
        if !self.done {
            self.emit(false, "dropped");
        }
    }
}

fn args_preview(args: &serde_json::Map<String, serde_json::Value>) -> String {
    let s = serde_json::Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
