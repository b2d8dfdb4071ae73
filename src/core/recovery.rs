//! 失败恢复策略
//!
//! 按 FailureKind 给出 RecoveryAction；每种补救都有上限，超限一律降级为 Abort。
//! `revise` 根据动作生成替换后的步骤（换工具时保留兼容参数并重新补齐默认值）。

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{FailureKind, PlanError};
use crate::planner::extract::bind_parameters;
use crate::planner::{Goal, Parameters, PlanValidator, Step};
use crate::tools::{CapabilityRegistry, ToolKind};

/// 恢复动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待 backoff 后重试同一步骤
    RetrySameStep { backoff: Duration },
    /// 换用备选工具
    SubstituteTool(ToolKind),
    /// 放宽时间预算后重试
    ExtendTimeoutAndRetry,
    /// 以提升后的权限重试
    EscalatePermission,
    Abort,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub resource_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_substitutions: u32,
    pub allow_escalation: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            resource_retries: 2,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(2000),
            max_substitutions: 2,
            allow_escalation: false,
        }
    }
}

/// 单个步骤的恢复计数；每个步骤开始时新建
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    tool: ToolKind,
    fallback: Vec<ToolKind>,
    tried: Vec<ToolKind>,
    resource_retries: u32,
    substitutions: u32,
    input_retries: u32,
    timeout_extensions: u32,
    escalations: u32,
}

impl RecoveryContext {
    pub fn new(tool: ToolKind, fallback: Vec<ToolKind>) -> Self {
        Self {
            tool,
            fallback,
            tried: vec![tool],
            resource_retries: 0,
            substitutions: 0,
            input_retries: 0,
            timeout_extensions: 0,
            escalations: 0,
        }
    }

    /// 当前使用的工具（替换后变化）
    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn substitutions(&self) -> u32 {
        self.substitutions
    }

    pub fn tried(&self) -> &[ToolKind] {
        &self.tried
    }
}

pub struct RecoveryPolicy {
    settings: RecoverySettings,
    registry: Arc<CapabilityRegistry>,
    validator: Arc<PlanValidator>,
}

impl RecoveryPolicy {
    pub fn new(
        settings: RecoverySettings,
        registry: Arc<CapabilityRegistry>,
        validator: Arc<PlanValidator>,
    ) -> Self {
        Self {
            settings,
            registry,
            validator,
        }
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    /// 第 n 次重试（1 起始）的退避：min(base * 2^(n-1), max)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings
            .backoff_base
            .saturating_mul(factor)
            .min(self.settings.backoff_max)
    }

    fn next_substitute(&self, ctx: &mut RecoveryContext) -> Option<ToolKind> {
        if ctx.substitutions >= self.settings.max_substitutions {
            return None;
        }
        let next = ctx
            .fallback
            .iter()
            .copied()
            .find(|t| !ctx.tried.contains(t) && self.registry.contains(*t))?;
        ctx.substitutions += 1;
        ctx.tried.push(next);
        ctx.tool = next;
        Some(next)
    }

    pub fn recover(&self, kind: FailureKind, step: &Step, ctx: &mut RecoveryContext) -> RecoveryAction {
        let action = match kind {
            FailureKind::ResourceUnavailable => {
                if ctx.resource_retries < self.settings.resource_retries {
                    ctx.resource_retries += 1;
                    RecoveryAction::RetrySameStep {
                        backoff: self.backoff(ctx.resource_retries),
                    }
                } else {
                    self.next_substitute(ctx)
                        .map(RecoveryAction::SubstituteTool)
                        .unwrap_or(RecoveryAction::Abort)
                }
            }
            FailureKind::ToolFailure => self
                .next_substitute(ctx)
                .map(RecoveryAction::SubstituteTool)
                .unwrap_or(RecoveryAction::Abort),
            FailureKind::InvalidInput => {
                if ctx.input_retries == 0 {
                    ctx.input_retries += 1;
                    RecoveryAction::RetrySameStep {
                        backoff: Duration::ZERO,
                    }
                } else {
                    RecoveryAction::Abort
                }
            }
            FailureKind::Timeout => {
                if ctx.timeout_extensions == 0 {
                    ctx.timeout_extensions += 1;
                    RecoveryAction::ExtendTimeoutAndRetry
                } else {
                    RecoveryAction::Abort
                }
            }
            FailureKind::PermissionDenied => {
                if self.settings.allow_escalation && ctx.escalations == 0 {
                    ctx.escalations += 1;
                    RecoveryAction::EscalatePermission
                } else {
                    RecoveryAction::Abort
                }
            }
            FailureKind::Cancelled | FailureKind::Unclassified => RecoveryAction::Abort,
        };
        tracing::warn!(tool = %step.tool, failure = %kind, action = ?action, "recovery decision");
        action
    }

    /// 生成替换步骤；index 为步骤下标（用于校验依赖与推导参数）
    pub fn revise(
        &self,
        index: usize,
        step: &Step,
        action: &RecoveryAction,
        goal: &Goal,
    ) -> Result<Step, PlanError> {
        match action {
            RecoveryAction::SubstituteTool(tool) => {
                let capability = self.registry.capability(*tool).ok_or_else(|| PlanError::UnknownTool {
                    index,
                    tool: tool.to_string(),
                })?;
                let mut parameters: Parameters = step
                    .parameters
                    .iter()
                    .filter(|(k, v)| {
                        capability
                            .schema
                            .param(k)
                            .map(|spec| spec.ty.matches(v))
                            .unwrap_or(false)
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if let Some(bound) = bind_parameters(*tool, goal, index) {
                    for (k, v) in bound {
                        parameters.entry(k).or_insert(v);
                    }
                }
                let revised = Step::new(*tool, format!("{} (via {tool})", step.action), parameters)
                    .with_depends_on(step.depends_on.clone());
                self.validator.repair_step(index, revised)
            }
            RecoveryAction::RetrySameStep { .. } => self.validator.repair_step(index, step.clone()),
            RecoveryAction::ExtendTimeoutAndRetry
            | RecoveryAction::EscalatePermission
            | RecoveryAction::Abort => Ok(step.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::core::error::ToolError;
    use crate::tools::registry::{InvocationContext, Tool};

    struct Stub(ToolKind);

    #[async_trait]
    impl Tool for Stub {
        fn kind(&self) -> ToolKind {
            self.0
        }
        fn description(&self) -> &str {
            "stub"
        }
        async fn invoke(&self, _: &Parameters, _: &InvocationContext) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    fn policy(settings: RecoverySettings) -> RecoveryPolicy {
        let mut reg = CapabilityRegistry::new();
        for k in [ToolKind::ReadFile, ToolKind::SearchCode, ToolKind::FileSearch, ToolKind::Generate] {
            reg.register(Stub(k));
        }
        let reg = Arc::new(reg);
        RecoveryPolicy::new(settings, reg.clone(), Arc::new(PlanValidator::new(reg)))
    }

    fn search_step() -> Step {
        let params = json!({"query": "login", "file_pattern": "**/*"});
        Step::new(
            ToolKind::SearchCode,
            "search",
            params.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn test_resource_backoff_then_substitute() {
        let p = policy(RecoverySettings::default());
        let step = search_step();
        let mut ctx = RecoveryContext::new(ToolKind::SearchCode, vec![ToolKind::FileSearch]);
        assert_eq!(
            p.recover(FailureKind::ResourceUnavailable, &step, &mut ctx),
            RecoveryAction::RetrySameStep {
                backoff: Duration::from_millis(100)
            }
        );
        assert_eq!(
            p.recover(FailureKind::ResourceUnavailable, &step, &mut ctx),
            RecoveryAction::RetrySameStep {
                backoff: Duration::from_millis(200)
            }
        );
        assert_eq!(
            p.recover(FailureKind::ResourceUnavailable, &step, &mut ctx),
            RecoveryAction::SubstituteTool(ToolKind::FileSearch)
        );
        assert_eq!(ctx.tool(), ToolKind::FileSearch);
    }

    #[test]
    fn test_backoff_capped() {
        let p = policy(RecoverySettings::default());
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(5), Duration::from_millis(1600));
        assert_eq!(p.backoff(6), Duration::from_millis(2000));
        assert_eq!(p.backoff(40), Duration::from_millis(2000));
    }

    #[test]
    fn test_tool_failure_without_fallback_aborts() {
        let p = policy(RecoverySettings::default());
        let mut ctx = RecoveryContext::new(ToolKind::ReadFile, vec![]);
        assert_eq!(
            p.recover(FailureKind::ToolFailure, &search_step(), &mut ctx),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_substitution_bound() {
        let p = policy(RecoverySettings {
            max_substitutions: 1,
            ..RecoverySettings::default()
        });
        let step = search_step();
        let mut ctx = RecoveryContext::new(
            ToolKind::SearchCode,
            vec![ToolKind::SearchCode, ToolKind::FileSearch, ToolKind::Generate],
        );
        // 已尝试过的工具被跳过
        assert_eq!(
            p.recover(FailureKind::ToolFailure, &step, &mut ctx),
            RecoveryAction::SubstituteTool(ToolKind::FileSearch)
        );
        assert_eq!(p.recover(FailureKind::ToolFailure, &step, &mut ctx), RecoveryAction::Abort);
        assert_eq!(ctx.substitutions(), 1);
    }

    #[test]
    fn test_unregistered_fallback_skipped() {
        let p = policy(RecoverySettings::default());
        let mut ctx = RecoveryContext::new(ToolKind::ReadFile, vec![ToolKind::AnalyzeCode, ToolKind::Generate]);
        assert_eq!(
            p.recover(FailureKind::ToolFailure, &search_step(), &mut ctx),
            RecoveryAction::SubstituteTool(ToolKind::Generate)
        );
    }

    #[test]
    fn test_single_shot_strategies() {
        let p = policy(RecoverySettings::default());
        let step = search_step();
        let mut ctx = RecoveryContext::new(ToolKind::SearchCode, vec![]);
        assert!(matches!(
            p.recover(FailureKind::InvalidInput, &step, &mut ctx),
            RecoveryAction::RetrySameStep { .. }
        ));
        assert_eq!(p.recover(FailureKind::InvalidInput, &step, &mut ctx), RecoveryAction::Abort);
        assert_eq!(
            p.recover(FailureKind::Timeout, &step, &mut ctx),
            RecoveryAction::ExtendTimeoutAndRetry
        );
        assert_eq!(p.recover(FailureKind::Timeout, &step, &mut ctx), RecoveryAction::Abort);
        assert_eq!(p.recover(FailureKind::Cancelled, &step, &mut ctx), RecoveryAction::Abort);
        assert_eq!(p.recover(FailureKind::Unclassified, &step, &mut ctx), RecoveryAction::Abort);
    }

    #[test]
    fn test_escalation_requires_setting() {
        let step = search_step();
        let denied = policy(RecoverySettings::default());
        let mut ctx = RecoveryContext::new(ToolKind::SearchCode, vec![]);
        assert_eq!(
            denied.recover(FailureKind::PermissionDenied, &step, &mut ctx),
            RecoveryAction::Abort
        );

        let allowed = policy(RecoverySettings {
            allow_escalation: true,
            ..RecoverySettings::default()
        });
        let mut ctx = RecoveryContext::new(ToolKind::SearchCode, vec![]);
        assert_eq!(
            allowed.recover(FailureKind::PermissionDenied, &step, &mut ctx),
            RecoveryAction::EscalatePermission
        );
        assert_eq!(
            allowed.recover(FailureKind::PermissionDenied, &step, &mut ctx),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_revise_substitution_keeps_compatible_parameters() {
        let p = policy(RecoverySettings::default());
        let goal = Goal::new("find *.toml");
        let revised = p
            .revise(0, &search_step(), &RecoveryAction::SubstituteTool(ToolKind::FileSearch), &goal)
            .unwrap();
        assert_eq!(revised.tool, ToolKind::FileSearch);
        assert_eq!(revised.parameters["pattern"], "*.toml");
        assert!(!revised.parameters.contains_key("query"));

        let revised = p
            .revise(0, &search_step(), &RecoveryAction::SubstituteTool(ToolKind::Generate), &goal)
            .unwrap();
        assert_eq!(revised.parameters["prompt"], "find *.toml");
    }

    #[test]
    fn test_revise_unbindable_substitution_fails() {
        let p = policy(RecoverySettings::default());
        let err = p
            .revise(
                0,
                &search_step(),
                &RecoveryAction::SubstituteTool(ToolKind::ReadFile),
                &Goal::new("search for login"),
            )
            .unwrap_err();
        assert!(matches!(err, PlanError::MissingParameter { .. }));
    }
}
