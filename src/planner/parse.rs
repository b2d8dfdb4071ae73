//! 模型输出解析：把 LLM 回复解析为 Step 列表
//!
//! 接受三种形式：JSON 数组 / ```json 代码块 / `{"steps": [...]}`；都不是时按编号列表解析：
//!
//! ```text
//! 1. Read the config
//!    tool: read_file
//!    parameters: {"path": "config.toml"}
//! 2. Summarize it
//!    tool: generate
//!    parameters: prompt=summarize {{step.0}}
//! ```

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::planner::types::{Parameters, Step};
use crate::tools::ToolKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no steps found in model output")]
    NoSteps,

    #[error("step {index}: unknown tool {tool}")]
    UnknownTool { index: usize, tool: String },

    #[error("step {index}: missing tool line")]
    MissingTool { index: usize },

    #[error("invalid JSON plan: {0}")]
    Json(String),

    #[error("step {index}: invalid parameters: {reason}")]
    Parameters { index: usize, reason: String },
}

/// 单个步骤的 JSON 格式（仅用于 Schema 生成与反序列化）
#[derive(Debug, Deserialize, JsonSchema)]
struct StepFormat {
    /// 这一步做什么（一句话）
    #[serde(default)]
    action: Option<String>,
    /// 工具名：read_file / write_file / search_code / file_search / analyze_code / execute_command / generate
    tool: String,
    /// 工具参数；可用 {{step.N}} 引用第 N 步（0 起始）的结果
    #[serde(default)]
    parameters: HashMap<String, Value>,
    /// 依赖的之前步骤下标
    #[serde(default)]
    depends_on: Vec<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StepsDocument {
    List(Vec<StepFormat>),
    Wrapped { steps: Vec<StepFormat> },
}

/// 返回步骤格式的 JSON Schema 字符串，可拼入提示词
pub fn step_schema_json() -> String {
    let schema = schema_for!(Vec<StepFormat>);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 尝试提取 JSON 块（```json ... ``` 或首个 [ / { 到最后一个 ] / }）
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let open = text.find(['[', '{'])?;
    let close_char = if text[open..].starts_with('[') { ']' } else { '}' };
    let close = text.rfind(close_char)?;
    (close > open).then(|| &text[open..=close])
}

fn into_step(index: usize, f: StepFormat) -> Result<Step, ParseError> {
    let tool: ToolKind = f.tool.parse().map_err(|_| ParseError::UnknownTool {
        index,
        tool: f.tool.clone(),
    })?;
    let action = f.action.unwrap_or_else(|| tool.to_string());
    let parameters: Parameters = f.parameters.into_iter().collect();
    Ok(Step::new(tool, action, parameters).with_depends_on(f.depends_on))
}

fn parse_json(json: &str) -> Result<Vec<Step>, ParseError> {
    let doc: StepsDocument = serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))?;
    let formats = match doc {
        StepsDocument::List(v) => v,
        StepsDocument::Wrapped { steps } => steps,
    };
    formats
        .into_iter()
        .enumerate()
        .map(|(i, f)| into_step(i, f))
        .collect()
}

struct ListRegexes {
    item: Regex,
    tool: Regex,
    params: Regex,
}

fn list_regexes() -> Option<&'static ListRegexes> {
    static RE: OnceLock<Option<ListRegexes>> = OnceLock::new();
    RE.get_or_init(|| {
        Some(ListRegexes {
            item: Regex::new(r"^\s*(?:step\s*)?(\d+)[.):]\s*(.*)$").ok()?,
            tool: Regex::new(r"(?i)^\s*[-*]?\s*tool\s*[:=]\s*`?([A-Za-z0-9_\-]+)`?").ok()?,
            params: Regex::new(r"(?i)^\s*[-*]?\s*(?:parameters|params|args)\s*[:=]\s*(.*)$").ok()?,
        })
    })
    .as_ref()
}

/// `k=v, k2=v2`；值能按 JSON 解析（数字、布尔）时保留类型
fn parse_kv(raw: &str) -> Parameters {
    let mut out = Parameters::new();
    for pair in raw.split(',') {
        let Some((k, v)) = pair.split_once('=') else {
            continue;
        };
        let key = k.trim().trim_matches(|c| c == '"' || c == '\'');
        let val = v.trim();
        if key.is_empty() {
            continue;
        }
        let value = match serde_json::from_str::<Value>(val) {
            Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
            _ => Value::String(val.trim_matches(|c| c == '"' || c == '\'').to_string()),
        };
        out.insert(key.to_string(), value);
    }
    out
}

fn parse_numbered_list(text: &str) -> Result<Vec<Step>, ParseError> {
    let re = list_regexes().ok_or(ParseError::NoSteps)?;
    // (action, tool, parameters)
    let mut items: Vec<(String, Option<String>, Option<String>)> = Vec::new();
    for line in text.lines() {
        if let Some(c) = re.item.captures(line) {
            let rest = c.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            items.push((rest.to_string(), None, None));
            // 同一行内联的 tool: / parameters:
            if let Some(last) = items.last_mut() {
                if let Some(t) = re.tool.captures(rest) {
                    last.1 = t.get(1).map(|m| m.as_str().to_string());
                }
            }
            continue;
        }
        let Some(last) = items.last_mut() else {
            continue;
        };
        if let Some(t) = re.tool.captures(line) {
            last.1 = t.get(1).map(|m| m.as_str().to_string());
        } else if let Some(p) = re.params.captures(line) {
            last.2 = p.get(1).map(|m| m.as_str().trim().to_string());
        }
    }
    if items.is_empty() {
        return Err(ParseError::NoSteps);
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, (action, tool, params))| {
            let tool_name = tool.ok_or(ParseError::MissingTool { index })?;
            let tool: ToolKind = tool_name
                .parse()
                .map_err(|_| ParseError::UnknownTool { index, tool: tool_name.clone() })?;
            let parameters = match params.as_deref().map(str::trim) {
                None | Some("") | Some("{}") | Some("none") => Parameters::new(),
                Some(raw) if raw.starts_with('{') => match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => {
                        return Err(ParseError::Parameters {
                            index,
                            reason: "expected a JSON object".to_string(),
                        })
                    }
                    Err(e) => {
                        return Err(ParseError::Parameters {
                            index,
                            reason: e.to_string(),
                        })
                    }
                },
                Some(raw) => parse_kv(raw),
            };
            let action = if action.is_empty() { tool.to_string() } else { action };
            Ok(Step::new(tool, action, parameters))
        })
        .collect()
}

/// 解析模型回复；空计划视为解析失败
pub fn parse_model_output(output: &str) -> Result<Vec<Step>, ParseError> {
    let trimmed = output.trim();
    let steps = match extract_json(trimmed) {
        Some(json) => match parse_json(json) {
            Ok(steps) => steps,
            // JSON 不成立时再按编号列表尝试一次，仍失败则报告 JSON 错误
            Err(json_err) => parse_numbered_list(trimmed).map_err(|_| json_err)?,
        },
        None => parse_numbered_list(trimmed)?,
    };
    if steps.is_empty() {
        return Err(ParseError::NoSteps);
    }
    Ok(steps)
}
