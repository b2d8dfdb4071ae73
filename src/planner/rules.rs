//! 规划规则：task_patterns（触发词 → 工具序列 + 备选）与 compound_tasks（子模式的有序并集）
//!
//! 规则文件支持 TOML 与 JSON，声明顺序即同分时的优先顺序；加载时校验，畸形条目直接报错。
//! 未配置规则文件时使用内置的 config/rules.toml。

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::error::RulesError;
use crate::planner::types::tokenize;
use crate::tools::ToolKind;

const BUILTIN_RULES: &str = include_str!("../../config/rules.toml");

/// 规则文件中的一个模式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPattern {
    pub patterns: Vec<String>,
    pub tools: Vec<String>,
    #[serde(default)]
    pub fallback: Vec<String>,
}

/// 规则文件顶层
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub task_patterns: IndexMap<String, TaskPattern>,
    #[serde(default)]
    pub compound_tasks: IndexMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    triggers: Vec<Vec<String>>,
    tools: Vec<ToolKind>,
    fallback: Vec<ToolKind>,
}

#[derive(Debug, Clone)]
struct Compound {
    name: String,
    name_phrase: Vec<String>,
    parts: Vec<usize>,
}

/// 一次匹配的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub name: String,
    pub score: usize,
    pub tools: Vec<ToolKind>,
    pub fallback: Vec<ToolKind>,
}

/// 编译后的规则表；初始化后只读
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    compounds: Vec<Compound>,
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && tokens.windows(phrase.len()).any(|w| w == phrase)
}

fn push_unique(out: &mut Vec<ToolKind>, tools: &[ToolKind]) {
    for t in tools {
        if !out.contains(t) {
            out.push(*t);
        }
    }
}

fn parse_tools(rule: &str, field: &str, names: &[String]) -> Result<Vec<ToolKind>, RulesError> {
    names
        .iter()
        .map(|n| {
            n.parse::<ToolKind>().map_err(|e| RulesError::Invalid {
                name: rule.to_string(),
                reason: format!("{field}: {e}"),
            })
        })
        .collect()
}

impl RuleSet {
    pub fn builtin() -> Result<Self, RulesError> {
        Self::from_toml_str(BUILTIN_RULES, "<builtin>")
    }

    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            compounds: Vec::new(),
        }
    }

    /// 按扩展名选择格式：.toml 为 TOML，其余按 JSON
    pub fn from_path(path: &Path) -> Result<Self, RulesError> {
        let origin = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: origin.clone(),
            source,
        })?;
        let is_toml = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            Self::from_toml_str(&text, &origin)
        } else {
            Self::from_json_str(&text, &origin)
        }
    }

    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, RulesError> {
        let file: RulesFile = toml::from_str(text).map_err(|e| RulesError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        Self::compile(file)
    }

    pub fn from_json_str(text: &str, origin: &str) -> Result<Self, RulesError> {
        let file: RulesFile = serde_json::from_str(text).map_err(|e| RulesError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        Self::compile(file)
    }

    pub fn compile(file: RulesFile) -> Result<Self, RulesError> {
        let mut rules = Vec::with_capacity(file.task_patterns.len());
        for (name, pattern) in &file.task_patterns {
            let invalid = |reason: &str| RulesError::Invalid {
                name: name.clone(),
                reason: reason.to_string(),
            };
            if pattern.patterns.is_empty() {
                return Err(invalid("patterns must not be empty"));
            }
            if pattern.tools.is_empty() {
                return Err(invalid("tools must not be empty"));
            }
            let triggers: Vec<Vec<String>> = pattern.patterns.iter().map(|p| tokenize(p)).collect();
            if triggers.iter().any(|t| t.is_empty()) {
                return Err(invalid("blank trigger phrase"));
            }
            rules.push(Rule {
                name: name.clone(),
                triggers,
                tools: parse_tools(name, "tools", &pattern.tools)?,
                fallback: parse_tools(name, "fallback", &pattern.fallback)?,
            });
        }

        let mut compounds = Vec::with_capacity(file.compound_tasks.len());
        for (name, parts) in &file.compound_tasks {
            if parts.is_empty() {
                return Err(RulesError::Invalid {
                    name: name.clone(),
                    reason: "compound task lists no sub-patterns".to_string(),
                });
            }
            let parts = parts
                .iter()
                .map(|p| {
                    rules
                        .iter()
                        .position(|r| &r.name == p)
                        .ok_or_else(|| RulesError::Invalid {
                            name: name.clone(),
                            reason: format!("unknown sub-pattern {p}"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            compounds.push(Compound {
                name: name.clone(),
                name_phrase: tokenize(&name.replace('_', " ")),
                parts,
            });
        }
        Ok(Self { rules, compounds })
    }

    fn rule_score(rule: &Rule, tokens: &[String]) -> usize {
        rule.triggers
            .iter()
            .filter(|t| contains_phrase(tokens, t))
            .map(|t| t.len())
            .sum()
    }

    /// 得分最高者胜出；同分按声明顺序，基础模式先于复合模式
    pub fn best_match(&self, tokens: &[String]) -> Option<RuleMatch> {
        let scores: Vec<usize> = self.rules.iter().map(|r| Self::rule_score(r, tokens)).collect();
        let mut best: Option<RuleMatch> = None;
        let mut consider = |candidate: RuleMatch| {
            if candidate.score > best.as_ref().map(|b| b.score).unwrap_or(0) {
                best = Some(candidate);
            }
        };

        for (rule, score) in self.rules.iter().zip(&scores) {
            if *score > 0 {
                consider(RuleMatch {
                    name: rule.name.clone(),
                    score: *score,
                    tools: rule.tools.clone(),
                    fallback: rule.fallback.clone(),
                });
            }
        }

        for compound in &self.compounds {
            let name_score = if contains_phrase(tokens, &compound.name_phrase) {
                compound.name_phrase.len()
            } else {
                0
            };
            let matched_parts = compound.parts.iter().filter(|i| scores[**i] > 0).count();
            if name_score == 0 && matched_parts < 2 {
                continue;
            }
            let mut tools = Vec::new();
            let mut fallback = Vec::new();
            let mut score = name_score;
            for i in &compound.parts {
                let rule = &self.rules[*i];
                push_unique(&mut tools, &rule.tools);
                push_unique(&mut fallback, &rule.fallback);
                score += scores[*i];
            }
            consider(RuleMatch {
                name: compound.name.clone(),
                score,
                tools,
                fallback,
            });
        }
        best
    }

    /// 模式的备选工具（复合模式为子模式备选的并集）；未知模式为空
    pub fn fallback_for(&self, pattern: &str) -> Vec<ToolKind> {
        if let Some(rule) = self.rules.iter().find(|r| r.name == pattern) {
            return rule.fallback.clone();
        }
        let mut out = Vec::new();
        if let Some(compound) = self.compounds.iter().find(|c| c.name == pattern) {
            for i in &compound.parts {
                push_unique(&mut out, &self.rules[*i].fallback);
            }
        }
        out
    }

    pub fn pattern_names(&self) -> Vec<&str> {
        self.rules
            .iter()
            .map(|r| r.name.as_str())
            .chain(self.compounds.iter().map(|c| c.name.as_str()))
            .collect()
    }
}
