//! 工具能力声明：ToolKind、参数 schema 与资源需求
//!
//! 计划校验阶段用 ParameterSchema 检查必填参数、填默认值、做类型检查；
//! 分发阶段用 resources 向资源账本申请。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::ledger::ResourceKind;

/// 已知工具种类；别名（semantic_search / get_errors / model1 等）在 FromStr 中归一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    SearchCode,
    FileSearch,
    AnalyzeCode,
    ExecuteCommand,
    Generate,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::SearchCode,
        ToolKind::FileSearch,
        ToolKind::AnalyzeCode,
        ToolKind::ExecuteCommand,
        ToolKind::Generate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::WriteFile => "write_file",
            ToolKind::SearchCode => "search_code",
            ToolKind::FileSearch => "file_search",
            ToolKind::AnalyzeCode => "analyze_code",
            ToolKind::ExecuteCommand => "execute_command",
            ToolKind::Generate => "generate",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToolName(pub String);

impl fmt::Display for UnknownToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tool: {}", self.0)
    }
}

impl std::error::Error for UnknownToolName {}

impl FromStr for ToolKind {
    type Err = UnknownToolName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "read_file" | "read" | "cat" => Ok(ToolKind::ReadFile),
            "write_file" | "write" => Ok(ToolKind::WriteFile),
            "search_code" | "semantic_search" | "code_search" | "grep" => Ok(ToolKind::SearchCode),
            "file_search" | "find_files" | "glob" => Ok(ToolKind::FileSearch),
            "analyze_code" | "get_errors" | "check_errors" | "code_review" => {
                Ok(ToolKind::AnalyzeCode)
            }
            "execute_command" | "run_command" | "shell" => Ok(ToolKind::ExecuteCommand),
            "generate" | "model1" | "llm" | "ask" => Ok(ToolKind::Generate),
            _ => Err(UnknownToolName(s.to_string())),
        }
    }
}

/// 参数类型（校验时使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_u64() || value.is_i64(),
            ParamType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: &'static str,
}

impl ParamSpec {
    fn required(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: true,
            default: None,
            description,
        }
    }

    fn optional(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: None,
            description,
        }
    }

    fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// 一个工具的参数契约
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterSchema {
    pub params: Vec<ParamSpec>,
}

impl ParameterSchema {
    pub fn standard(kind: ToolKind) -> Self {
        use ParamType::*;
        let params = match kind {
            ToolKind::ReadFile => vec![
                ParamSpec::required("path", String, "File path relative to the workspace"),
                ParamSpec::optional("start_line", Integer, "First line to return (0-based)"),
                ParamSpec::optional("end_line", Integer, "Last line to return (inclusive)"),
            ],
            ToolKind::WriteFile => vec![
                ParamSpec::required("path", String, "File path relative to the workspace"),
                ParamSpec::required("content", String, "Content to write"),
            ],
            ToolKind::SearchCode => vec![
                ParamSpec::required("query", String, "Text to search for (case-insensitive)"),
                ParamSpec::required("file_pattern", String, "Glob restricting searched files")
                    .with_default(json!("**/*")),
            ],
            ToolKind::FileSearch => vec![ParamSpec::required(
                "pattern",
                String,
                "Glob or name fragment of files to find",
            )],
            ToolKind::AnalyzeCode => vec![ParamSpec::required(
                "path",
                String,
                "File or directory to analyze",
            )
            .with_default(json!("."))],
            ToolKind::ExecuteCommand => vec![
                ParamSpec::required("command", String, "Shell command line"),
                ParamSpec::required("timeout_secs", Integer, "Command timeout in seconds")
                    .with_default(json!(30)),
            ],
            ToolKind::Generate => vec![ParamSpec::required(
                "prompt",
                String,
                "Prompt for the language model",
            )],
        };
        Self { params }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// JSON Schema 形式，供模型提示词与 initialize 能力声明使用
    pub fn to_json(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.params {
            let mut prop = json!({ "type": p.ty.as_str(), "description": p.description });
            if let Some(default) = &p.default {
                prop["default"] = default.clone();
            }
            properties.insert(p.name.to_string(), prop);
            if p.required && p.default.is_none() {
                required.push(Value::String(p.name.to_string()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// 注册时声明、此后只读的工具能力
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCapability {
    pub id: ToolKind,
    pub schema: ParameterSchema,
    pub resources: BTreeMap<ResourceKind, u64>,
}

impl ToolCapability {
    pub fn standard(kind: ToolKind) -> Self {
        let mut resources = BTreeMap::new();
        match kind {
            ToolKind::ReadFile | ToolKind::FileSearch => {
                resources.insert(ResourceKind::ToolSlot, 1);
            }
            ToolKind::WriteFile => {
                resources.insert(ResourceKind::ToolSlot, 1);
                resources.insert(ResourceKind::WorkspaceWrite, 1);
            }
            ToolKind::SearchCode | ToolKind::AnalyzeCode => {
                resources.insert(ResourceKind::ToolSlot, 1);
                resources.insert(ResourceKind::MemoryMb, 64);
            }
            ToolKind::ExecuteCommand => {
                resources.insert(ResourceKind::ToolSlot, 1);
                resources.insert(ResourceKind::Subprocess, 1);
            }
            ToolKind::Generate => {
                resources.insert(ResourceKind::ModelSession, 1);
            }
        }
        Self {
            id: kind,
            schema: ParameterSchema::standard(kind),
            resources,
        }
    }

    pub fn with_resources(mut self, resources: BTreeMap<ResourceKind, u64>) -> Self {
        self.resources = resources;
        self
    }
}
