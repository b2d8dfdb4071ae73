//! 从目标文本推导工具参数
//!
//! Rule / Keyword 层生成步骤时使用，Model 层用它补齐缺失参数，工具替换时用它补齐新工具的参数。
//! 推导不出必填参数时返回 None（调用方据此回退或发出澄清步骤）。

use serde_json::Value;

use crate::planner::types::{normalize_token, Goal, Parameters};
use crate::tools::ToolKind;

const SEARCH_VERBS: &[&str] = &["search", "find", "grep", "look"];
const RUN_VERBS: &[&str] = &["run", "execute", "exec"];
const FILLER: &[&str] = &["for", "the", "and", "all", "code", "codebase", "in", "me", "a", "command"];

fn clean(word: &str) -> &str {
    let w = word.trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | ',' | ';' | '!' | '?' | '(' | ')'));
    if w.len() > 1 {
        w.strip_suffix(['.', ':']).unwrap_or(w)
    } else {
        w
    }
}

fn is_path_like(word: &str) -> bool {
    if word == "." || word.contains('/') {
        return true;
    }
    match word.rsplit_once('.') {
        Some((stem, ext)) => {
            !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) && !stem.is_empty()
        }
        None => false,
    }
}

fn words(goal: &Goal) -> Vec<&str> {
    goal.text().split_whitespace().collect()
}

fn position_of(words: &[&str], candidates: &[&str]) -> Option<usize> {
    words
        .iter()
        .position(|w| candidates.contains(&normalize_token(w).as_str()))
}

/// "file" 之后的词，否则第一个像路径的词；返回其位置
fn locate_path(words: &[&str]) -> Option<usize> {
    if let Some(i) = position_of(words, &["file"]) {
        if let Some(next) = words.get(i + 1) {
            if !clean(next).is_empty() {
                return Some(i + 1);
            }
        }
    }
    words.iter().position(|w| is_path_like(clean(w)))
}

fn text_after(words: &[&str], index: usize) -> String {
    let rest: Vec<&str> = words.iter().skip(index + 1).copied().collect();
    let mut start = 0;
    while start < rest.len() && FILLER.contains(&normalize_token(rest[start]).as_str()) {
        start += 1;
    }
    strip_quotes(&rest[start..].join(" ")).to_string()
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\'', '`'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn string_param(name: &str, value: impl Into<String>) -> Parameters {
    let mut p = Parameters::new();
    p.insert(name.to_string(), Value::String(value.into()));
    p
}

/// generate 的提示词：目标、上下文与之前步骤结果的占位引用
fn generation_prompt(goal: &Goal, index: usize) -> String {
    let mut prompt = goal.text().to_string();
    if !goal.context().is_empty() {
        prompt.push_str("\n\nContext:");
        for item in goal.context() {
            prompt.push_str(&format!("\n- {}: {}", item.key, item.value));
        }
    }
    if index > 0 {
        prompt.push_str("\n\nResults of previous steps:");
        for i in 0..index {
            prompt.push_str(&format!("\nStep {i}: {{{{step.{i}}}}}"));
        }
    }
    prompt
}

/// 为第 index 个步骤上的 tool 推导参数；可选参数留给校验器按默认值填充
pub fn bind_parameters(tool: ToolKind, goal: &Goal, index: usize) -> Option<Parameters> {
    let words = words(goal);
    match tool {
        ToolKind::ReadFile => {
            let i = locate_path(&words)?;
            Some(string_param("path", clean(words[i])))
        }
        ToolKind::WriteFile => {
            let i = locate_path(&words)?;
            let mut content = strip_quotes(&words[i + 1..].join(" ")).to_string();
            for prefix in ["with content ", "containing ", "content "] {
                if let Some(rest) = content.strip_prefix(prefix) {
                    content = strip_quotes(rest).to_string();
                    break;
                }
            }
            if content.is_empty() {
                return None;
            }
            let mut p = string_param("path", clean(words[i]));
            p.insert("content".to_string(), Value::String(content));
            Some(p)
        }
        ToolKind::SearchCode => {
            let i = position_of(&words, SEARCH_VERBS)?;
            let query = text_after(&words, i);
            (!query.is_empty()).then(|| string_param("query", query))
        }
        ToolKind::FileSearch => {
            let glob = words
                .iter()
                .map(|w| clean(w))
                .find(|w| w.contains('*') || is_path_like(w));
            match glob {
                Some(g) => Some(string_param("pattern", g)),
                None => {
                    let i = words
                        .iter()
                        .rposition(|w| ["file", "named", "called"].contains(&normalize_token(w).as_str()))?;
                    let name = words.get(i + 1).map(|w| clean(w))?;
                    (!name.is_empty()).then(|| string_param("pattern", name))
                }
            }
        }
        ToolKind::AnalyzeCode => {
            let path = words.iter().map(|w| clean(w)).find(|w| is_path_like(w));
            Some(match path {
                Some(p) => string_param("path", p),
                None => Parameters::new(),
            })
        }
        ToolKind::ExecuteCommand => {
            let i = position_of(&words, RUN_VERBS)?;
            let command = text_after(&words, i);
            (!command.is_empty()).then(|| string_param("command", command))
        }
        ToolKind::Generate => Some(string_param("prompt", generation_prompt(goal, index))),
    }
}
