//! PlanSynthesizer：Model → Rule → Keyword 三层策略
//!
//! 每层返回 `Option<Plan>`；Model / Rule 层的计划先过校验器，不通过则落到下一层。
//! Keyword 层兜底，保证 synthesize 总能得到非空计划。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::PatternStore;
use crate::planner::extract::bind_parameters;
use crate::planner::keyword::{keyword_pattern, KeywordTier};
use crate::planner::parse::{parse_model_output, step_schema_json};
use crate::planner::rules::RuleSet;
use crate::planner::types::{Goal, Plan, Step, Tier};
use crate::planner::validator::PlanValidator;
use crate::tools::CapabilityRegistry;

/// 无规则、无关键词命中时的目标模式
pub const GENERAL_PATTERN: &str = "general";

/// 一层规划策略
#[async_trait]
pub trait PlanTier: Send + Sync {
    fn tier(&self) -> Tier;

    /// pattern 为该目标的模式键，用于查询历史成功率
    async fn propose(&self, goal: &Goal, pattern: &str) -> Option<Plan>;
}

/// Model 层：让 LLM 产出步骤列表
pub struct ModelTier {
    llm: Arc<dyn LlmClient>,
    registry: Arc<CapabilityRegistry>,
    patterns: Arc<PatternStore>,
    rules: Arc<RuleSet>,
    max_parse_attempts: u32,
}

impl ModelTier {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        registry: Arc<CapabilityRegistry>,
        patterns: Arc<PatternStore>,
        rules: Arc<RuleSet>,
        max_parse_attempts: u32,
    ) -> Self {
        Self {
            llm,
            registry,
            patterns,
            rules,
            max_parse_attempts: max_parse_attempts.max(1),
        }
    }

    fn build_prompt(&self, goal: &Goal, pattern: &str) -> String {
        let tools = serde_json::to_string_pretty(&self.registry.to_schema_json()).unwrap_or_default();
        let mut prompt = String::from(
            "You are a planning assistant. Break the user's goal into an ordered list of tool steps.\n\n",
        );
        prompt.push_str("Available tools:\n");
        prompt.push_str(&tools);
        prompt.push_str("\n\nGoal: ");
        prompt.push_str(goal.text());
        if !goal.context().is_empty() {
            prompt.push_str("\n\nContext:");
            for item in goal.context() {
                prompt.push_str(&format!("\n- {}: {}", item.key, item.value));
            }
        }
        prompt.push_str("\n\nHistorical success rate per tool for this kind of goal:");
        for kind in self.registry.kinds() {
            prompt.push_str(&format!(
                "\n- {kind}: {:.2}",
                self.patterns.success_rate(pattern, kind)
            ));
        }
        prompt.push_str(
            "\n\nUse {{step.N}} inside a parameter to refer to the output of an earlier step (N starts at 0).\n\
             Reply with a JSON array of steps matching this schema and nothing else:\n",
        );
        prompt.push_str(&step_schema_json());
        prompt
    }
}

#[async_trait]
impl PlanTier for ModelTier {
    fn tier(&self) -> Tier {
        Tier::Model
    }

    async fn propose(&self, goal: &Goal, pattern: &str) -> Option<Plan> {
        let base = self.build_prompt(goal, pattern);
        let mut prompt = base.clone();
        let mut parsed = None;
        for attempt in 1..=self.max_parse_attempts {
            let output = match self.llm.generate(&prompt, goal.context()).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(error = %e, "model tier generation failed");
                    return None;
                }
            };
            match parse_model_output(&output) {
                Ok(steps) => {
                    parsed = Some(steps);
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "model plan could not be parsed");
                    prompt = format!(
                        "{base}\n\nYour previous answer could not be parsed: {e}. Reply with the JSON array only."
                    );
                }
            }
        }
        let steps = parsed?;

        // 模型漏填的参数，尽量从目标文本补齐
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, mut step)| {
                if let Some(bound) = bind_parameters(step.tool, goal, i) {
                    for (k, v) in bound {
                        step.parameters.entry(k).or_insert(v);
                    }
                }
                step
            })
            .collect();
        let fallback = self.patterns.rank(pattern, &self.rules.fallback_for(pattern));
        Some(Plan::new(steps, Tier::Model, pattern).with_fallback(fallback))
    }
}

/// Rule 层：按规则表匹配，工具序列按历史成功率稳定重排
pub struct RuleTier {
    rules: Arc<RuleSet>,
    patterns: Arc<PatternStore>,
    learned_ordering: bool,
}

impl RuleTier {
    pub fn new(rules: Arc<RuleSet>, patterns: Arc<PatternStore>, learned_ordering: bool) -> Self {
        Self {
            rules,
            patterns,
            learned_ordering,
        }
    }
}

#[async_trait]
impl PlanTier for RuleTier {
    fn tier(&self) -> Tier {
        Tier::Rule
    }

    async fn propose(&self, goal: &Goal, _pattern: &str) -> Option<Plan> {
        let m = self.rules.best_match(&goal.tokens())?;
        let (tools, fallback) = if self.learned_ordering {
            (
                self.patterns.rank(&m.name, &m.tools),
                self.patterns.rank(&m.name, &m.fallback),
            )
        } else {
            (m.tools.clone(), m.fallback.clone())
        };

        let mut steps = Vec::with_capacity(tools.len());
        for (i, tool) in tools.into_iter().enumerate() {
            let Some(parameters) = bind_parameters(tool, goal, i) else {
                tracing::debug!(pattern = %m.name, tool = %tool, "rule matched but parameters could not be derived");
                return None;
            };
            steps.push(Step::new(tool, format!("{tool} ({})", m.name), parameters));
        }
        Some(Plan::new(steps, Tier::Rule, m.name).with_fallback(fallback))
    }
}

pub struct PlanSynthesizer {
    tiers: Vec<Box<dyn PlanTier>>,
    keyword: KeywordTier,
    validator: Arc<PlanValidator>,
    rules: Arc<RuleSet>,
}

impl PlanSynthesizer {
    pub fn new(keyword: KeywordTier, validator: Arc<PlanValidator>, rules: Arc<RuleSet>) -> Self {
        Self {
            tiers: Vec::new(),
            keyword,
            validator,
            rules,
        }
    }

    /// 按添加顺序尝试
    pub fn with_tier(mut self, tier: Box<dyn PlanTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.tiers.iter().map(|t| t.tier()).collect()
    }

    /// 目标的模式键：规则名，否则 keyword:<tool>，否则 general
    pub fn goal_pattern(&self, goal: &Goal) -> String {
        if let Some(m) = self.rules.best_match(&goal.tokens()) {
            return m.name;
        }
        match self.keyword.matched_tool(goal) {
            Some(tool) => keyword_pattern(tool),
            None => GENERAL_PATTERN.to_string(),
        }
    }

    /// 永不失败；返回的 Keyword 计划未经校验，由调用方校验
    pub async fn synthesize(&self, goal: &Goal) -> Plan {
        let pattern = self.goal_pattern(goal);
        for tier in &self.tiers {
            let Some(plan) = tier.propose(goal, &pattern).await else {
                tracing::warn!(tier = %tier.tier(), "planning tier produced no plan, falling through");
                continue;
            };
            match self.validator.validate(plan) {
                Ok(plan) => {
                    tracing::info!(tier = %plan.tier_used, pattern = %plan.pattern, steps = plan.len(), "plan synthesized");
                    return plan;
                }
                Err(e) => {
                    tracing::warn!(tier = %tier.tier(), error = %e, "plan failed validation, falling through");
                }
            }
        }
        let plan = self.keyword.plan(goal);
        tracing::info!(tier = %plan.tier_used, pattern = %plan.pattern, "plan synthesized");
        plan
    }
}
