//! 计划校验与修复
//!
//! 检查：非空、工具已注册、必填参数（缺失时用 schema 默认值补齐）、参数类型、依赖只指向之前的步骤。
//! 依赖来自 depends_on 与参数中的 `{{step.N}}` 占位符。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::core::error::PlanError;
use crate::planner::types::{Plan, Step};
use crate::tools::CapabilityRegistry;

/// `{{step.N}}` 占位符
pub(crate) fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*step\.(\d+)\s*\}\}").ok())
        .as_ref()
}

/// 参数值（递归）中引用到的步骤下标
pub(crate) fn referenced_steps(value: &Value, out: &mut Vec<usize>) {
    match value {
        Value::String(s) => {
            if let Some(re) = placeholder_regex() {
                for cap in re.captures_iter(s) {
                    if let Some(n) = cap.get(1).and_then(|m| m.as_str().parse().ok()) {
                        out.push(n);
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| referenced_steps(v, out)),
        Value::Object(map) => map.values().for_each(|v| referenced_steps(v, out)),
        _ => {}
    }
}

pub struct PlanValidator {
    registry: Arc<CapabilityRegistry>,
}

impl PlanValidator {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn validate(&self, mut plan: Plan) -> Result<Plan, PlanError> {
        if plan.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        let steps = std::mem::take(&mut plan.steps);
        plan.steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| self.repair_step(i, step))
            .collect::<Result<Vec<_>, _>>()?;
        plan.fallback.retain(|t| self.registry.contains(*t));
        Ok(plan)
    }

    /// 校验单个步骤并补齐默认参数；恢复时对替换后的步骤也走这里
    pub fn repair_step(&self, index: usize, mut step: Step) -> Result<Step, PlanError> {
        let capability = self
            .registry
            .capability(step.tool)
            .ok_or_else(|| PlanError::UnknownTool {
                index,
                tool: step.tool.to_string(),
            })?;

        for spec in &capability.schema.params {
            let present = step
                .parameters
                .get(spec.name)
                .map(|v| !v.is_null())
                .unwrap_or(false);
            if !present {
                match (&spec.default, spec.required) {
                    (Some(default), _) => {
                        step.parameters.insert(spec.name.to_string(), default.clone());
                    }
                    (None, true) => {
                        return Err(PlanError::MissingParameter {
                            index,
                            tool: step.tool,
                            parameter: spec.name.to_string(),
                        })
                    }
                    (None, false) => {
                        step.parameters.remove(spec.name);
                    }
                }
                continue;
            }
            if let Some(value) = step.parameters.get(spec.name) {
                if !spec.ty.matches(value) {
                    return Err(PlanError::InvalidParameter {
                        index,
                        tool: step.tool,
                        parameter: spec.name.to_string(),
                        expected: spec.ty.as_str().to_string(),
                    });
                }
            }
        }

        let mut deps = step.depends_on.clone();
        for value in step.parameters.values() {
            referenced_steps(value, &mut deps);
        }
        if let Some(bad) = deps.into_iter().find(|d| *d >= index) {
            return Err(PlanError::CyclicDependency {
                index,
                depends_on: bad,
            });
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::planner::{Parameters, Tier};
    use crate::tools::registry::{InvocationContext, Tool};
    use crate::tools::ToolKind;
    use crate::core::error::ToolError;
    use async_trait::async_trait;

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

    fn validator() -> PlanValidator {
        let mut reg = CapabilityRegistry::new();
        for kind in [ToolKind::ReadFile, ToolKind::SearchCode, ToolKind::Generate, ToolKind::ExecuteCommand] {
            reg.register(Stub(kind));
        }
        PlanValidator::new(Arc::new(reg))
    }

    fn step(tool: ToolKind, params: Value) -> Step {
        let parameters = match params {
            Value::Object(m) => m,
            _ => Parameters::new(),
        };
        Step::new(tool, "test", parameters)
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan::new(steps, Tier::Model, "general")
    }

    #[test]
    fn test_empty_plan() {
        assert_eq!(validator().validate(plan(vec![])).unwrap_err(), PlanError::EmptyPlan);
    }

    #[test]
    fn test_unknown_tool() {
        let err = validator()
            .validate(plan(vec![step(ToolKind::WriteFile, json!({"path": "a", "content": "b"}))]))
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownTool { index: 0, .. }));
    }

    #[test]
    fn test_fills_defaults() {
        let p = validator()
            .validate(plan(vec![
                step(ToolKind::SearchCode, json!({"query": "login"})),
                step(ToolKind::ExecuteCommand, json!({"command": "ls"})),
            ]))
            .unwrap();
        assert_eq!(p.steps[0].parameters["file_pattern"], "**/*");
        assert_eq!(p.steps[1].parameters["timeout_secs"], 30);
    }

    #[test]
    fn test_missing_and_invalid_parameters() {
        let err = validator()
            .validate(plan(vec![step(ToolKind::ReadFile, json!({}))]))
            .unwrap_err();
        assert!(matches!(err, PlanError::MissingParameter { ref parameter, .. } if parameter == "path"));

        let err = validator()
            .validate(plan(vec![step(ToolKind::ReadFile, json!({"path": 7}))]))
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidParameter { ref expected, .. } if expected == "string"));

        let err = validator()
            .validate(plan(vec![step(
                ToolKind::ReadFile,
                json!({"path": "a", "start_line": "one"}),
            )]))
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidParameter { .. }));
    }

    #[test]
    fn test_cyclic_dependencies() {
        let err = validator()
            .validate(plan(vec![step(ToolKind::Generate, json!({"prompt": "use {{step.0}}"}))]))
            .unwrap_err();
        assert_eq!(err, PlanError::CyclicDependency { index: 0, depends_on: 0 });

        let err = validator()
            .validate(plan(vec![
                step(ToolKind::Generate, json!({"prompt": "a"})).with_depends_on(vec![1]),
                step(ToolKind::Generate, json!({"prompt": "b"})),
            ]))
            .unwrap_err();
        assert_eq!(err, PlanError::CyclicDependency { index: 0, depends_on: 1 });

        let ok = validator().validate(plan(vec![
            step(ToolKind::ReadFile, json!({"path": "a"})),
            step(ToolKind::Generate, json!({"prompt": "summarize {{ step.0 }}"})),
        ]));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_fallback_restricted_to_registered() {
        let p = plan(vec![step(ToolKind::Generate, json!({"prompt": "x"}))])
            .with_fallback(vec![ToolKind::FileSearch, ToolKind::SearchCode]);
        let p = validator().validate(p).unwrap();
        assert_eq!(p.fallback, vec![ToolKind::SearchCode]);
    }
}
