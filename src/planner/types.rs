//! 规划数据模型：Goal / Step / Plan / Tier

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolKind;

/// 步骤参数：字符串到 JSON 值的映射
pub type Parameters = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub key: String,
    pub value: String,
}

impl ContextItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 用户目标；接受后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    text: String,
    #[serde(default)]
    context: Vec<ContextItem>,
}

impl Goal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<ContextItem>) -> Self {
        self.context = context;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn context(&self) -> &[ContextItem] {
        &self.context
    }

    /// 归一化后的词（小写、去首尾标点、去复数 s），用于规则与关键词匹配
    pub fn tokens(&self) -> Vec<String> {
        tokenize(&self.text)
    }
}

/// 规则触发词与目标文本共用的分词
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(normalize_token)
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn normalize_token(word: &str) -> String {
    let trimmed = word
        .trim_matches(|c: char| !(c.is_alphanumeric() || c == '_'))
        .to_lowercase();
    if trimmed.len() > 3 && trimmed.ends_with('s') && !trimmed.ends_with("ss") {
        trimmed[..trimmed.len() - 1].to_string()
    } else {
        trimmed
    }
}

/// 一次工具调用；校验后不可变，恢复时整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    pub tool: ToolKind,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl Step {
    pub fn new(tool: ToolKind, action: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            action: action.into(),
            tool,
            parameters,
            depends_on: Vec::new(),
        }
    }

    pub fn with_depends_on(mut self, depends_on: Vec<usize>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// 生成计划的层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Model,
    Rule,
    Keyword,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Model => "model",
            Tier::Rule => "rule",
            Tier::Keyword => "keyword",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub tier_used: Tier,
    pub generated_at: DateTime<Utc>,
    /// 目标模式键（规则名 / keyword:<tool> / general），模式学习按此归档
    pub pattern: String,
    /// 工具失败时可替换的候选（已按历史成功率排序）
    #[serde(default)]
    pub fallback: Vec<ToolKind>,
}

impl Plan {
    pub fn new(steps: Vec<Step>, tier_used: Tier, pattern: impl Into<String>) -> Self {
        Self {
            steps,
            tier_used,
            generated_at: Utc::now(),
            pattern: pattern.into(),
            fallback: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: Vec<ToolKind>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn tools(&self) -> Vec<ToolKind> {
        self.steps.iter().map(|s| s.tool).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_normalizes() {
        assert_eq!(
            tokenize("Find and fix security vulnerabilities!"),
            vec!["find", "and", "fix", "security", "vulnerabilitie"]
        );
        assert_eq!(tokenize("read file test.txt"), vec!["read", "file", "test.txt"]);
        assert_eq!(normalize_token("files"), "file");
        assert_eq!(normalize_token("class"), "class");
        assert_eq!(normalize_token("is"), "is");
    }

    #[test]
    fn test_goal_serde_keeps_context_order() {
        let goal = Goal::new("ask why").with_context(vec![
            ContextItem::new("b", "2"),
            ContextItem::new("a", "1"),
        ]);
        let v = serde_json::to_value(&goal).unwrap();
        assert_eq!(v["context"][0]["key"], "b");
        let back: Goal = serde_json::from_value(v).unwrap();
        assert_eq!(back, goal);
    }
}
