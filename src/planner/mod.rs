//! 规划层：目标 → 计划
//!
//! 三层策略（Model → Rule → Keyword）产出计划，校验器负责修复与拒绝。

pub mod extract;
pub mod keyword;
pub mod parse;
pub mod rules;
pub mod synthesizer;
pub mod types;
pub mod validator;

pub use extract::bind_parameters;
pub use keyword::KeywordTier;
pub use parse::{parse_model_output, ParseError};
pub use rules::{RuleMatch, RuleSet, RulesFile, TaskPattern};
pub use synthesizer::{ModelTier, PlanSynthesizer, PlanTier, RuleTier, GENERAL_PATTERN};
pub use types::{tokenize, ContextItem, Goal, Parameters, Plan, Step, Tier};
pub use validator::PlanValidator;
