//! Keyword 层：固定关键词表，永不失败
//!
//! 取目标中最早出现、且对应工具已注册的关键词；参数推导不出或无关键词时发出单个 clarify 步骤（generate）。

use std::sync::Arc;

use crate::planner::extract::bind_parameters;
use crate::planner::types::{Goal, Parameters, Plan, Step, Tier};
use crate::tools::{CapabilityRegistry, ToolKind};

pub const CLARIFY_PATTERN: &str = "keyword:clarify";
pub const CLARIFY_ACTION: &str = "clarify";

const KEYWORDS: &[(&str, ToolKind)] = &[
    ("read", ToolKind::ReadFile),
    ("write", ToolKind::WriteFile),
    ("search", ToolKind::SearchCode),
    ("find", ToolKind::SearchCode),
    ("grep", ToolKind::SearchCode),
    ("analyze", ToolKind::AnalyzeCode),
    ("analyse", ToolKind::AnalyzeCode),
    ("check", ToolKind::AnalyzeCode),
    ("lint", ToolKind::AnalyzeCode),
    ("run", ToolKind::ExecuteCommand),
    ("execute", ToolKind::ExecuteCommand),
    ("exec", ToolKind::ExecuteCommand),
    ("ask", ToolKind::Generate),
    ("explain", ToolKind::Generate),
    ("how", ToolKind::Generate),
    ("why", ToolKind::Generate),
    ("what", ToolKind::Generate),
];

pub fn keyword_pattern(tool: ToolKind) -> String {
    format!("keyword:{tool}")
}

pub struct KeywordTier {
    registry: Arc<CapabilityRegistry>,
}

impl KeywordTier {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// 目标中最早出现的已注册关键词对应的工具
    pub fn matched_tool(&self, goal: &Goal) -> Option<ToolKind> {
        goal.tokens().iter().find_map(|token| {
            KEYWORDS
                .iter()
                .find(|(kw, tool)| *kw == token.as_str() && self.registry.contains(*tool))
                .map(|(_, tool)| *tool)
        })
    }

    pub fn plan(&self, goal: &Goal) -> Plan {
        if let Some(tool) = self.matched_tool(goal) {
            if let Some(parameters) = bind_parameters(tool, goal, 0) {
                let step = Step::new(tool, format!("{tool} (keyword match)"), parameters);
                return Plan::new(vec![step], Tier::Keyword, keyword_pattern(tool));
            }
            tracing::debug!(tool = %tool, "keyword matched but parameters could not be derived");
        }
        Plan::new(vec![clarify_step(goal)], Tier::Keyword, CLARIFY_PATTERN)
    }
}

fn clarify_step(goal: &Goal) -> Step {
    let mut parameters = Parameters::new();
    parameters.insert(
        "prompt".to_string(),
        serde_json::Value::String(format!(
            "The request \"{}\" is ambiguous or lacks details needed to act on it. \
             Ask the user one short clarifying question about what they want done.",
            goal.text()
        )),
    );
    Step::new(ToolKind::Generate, CLARIFY_ACTION, parameters)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

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

    fn tier(kinds: &[ToolKind]) -> KeywordTier {
        let mut reg = CapabilityRegistry::new();
        for k in kinds {
            reg.register(Stub(*k));
        }
        KeywordTier::new(Arc::new(reg))
    }

    #[test]
    fn test_earliest_keyword_wins() {
        let t = tier(&ToolKind::ALL);
        let plan = t.plan(&Goal::new("explain why we read config.toml"));
        assert_eq!(plan.tier_used, Tier::Keyword);
        assert_eq!(plan.steps[0].tool, ToolKind::Generate);
        assert_eq!(plan.pattern, "keyword:generate");
    }

    #[test]
    fn test_unregistered_keyword_skipped() {
        let t = tier(&[ToolKind::ReadFile, ToolKind::Generate]);
        let plan = t.plan(&Goal::new("run then read notes.md"));
        assert_eq!(plan.steps[0].tool, ToolKind::ReadFile);
        assert_eq!(plan.steps[0].parameters["path"], "notes.md");
    }

    #[test]
    fn test_clarify_when_nothing_matches() {
        let t = tier(&ToolKind::ALL);
        let plan = t.plan(&Goal::new("optimize performance"));
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, ToolKind::Generate);
        assert_eq!(plan.steps[0].action, CLARIFY_ACTION);
        assert_eq!(plan.pattern, CLARIFY_PATTERN);
        assert!(plan.steps[0].parameters["prompt"]
            .as_str()
            .unwrap()
            .contains("optimize performance"));
    }

    #[test]
    fn test_clarify_when_parameters_missing() {
        let t = tier(&ToolKind::ALL);
        let plan = t.plan(&Goal::new("read"));
        assert_eq!(plan.steps[0].action, CLARIFY_ACTION);
    }
}
