//! 错误类型与失败分类
//!
//! FailureKind 是执行期的固定失败分类（由 RecoveryPolicy 决定补救动作）；
//! 其余 thiserror 枚举按关注点划分：工具、模型、规划、规则文件、任务生命周期。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::ToolKind;

/// 步骤失败的固定分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 资源账本无法满足声明的资源需求
    ResourceUnavailable,
    /// 工具执行失败（文件不存在、命令返回错误等）
    ToolFailure,
    /// 参数不合法
    InvalidInput,
    /// 超出步骤时间预算
    Timeout,
    /// 沙箱或白名单拒绝
    PermissionDenied,
    /// 内部不变量被破坏，或无法归类的错误
    Unclassified,
    /// 任务在步骤之间被取消
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ResourceUnavailable => "resource_unavailable",
            FailureKind::ToolFailure => "tool_failure",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Timeout => "timeout",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::Unclassified => "unclassified",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具调用错误；`kind()` 给出到 FailureKind 的完整映射
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Tool timeout: {0}")]
    Timeout(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
}

impl ToolError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ToolError::Failed(_) => FailureKind::ToolFailure,
            ToolError::InvalidInput(_) => FailureKind::InvalidInput,
            ToolError::PermissionDenied(_) => FailureKind::PermissionDenied,
            ToolError::Timeout(_) => FailureKind::Timeout,
            ToolError::ResourceUnavailable(_) => FailureKind::ResourceUnavailable,
        }
    }

    /// 不带前缀的详情，写入 StepOutcome::Err.detail
    pub fn detail(&self) -> String {
        match self {
            ToolError::Failed(s)
            | ToolError::InvalidInput(s)
            | ToolError::PermissionDenied(s)
            | ToolError::Timeout(s)
            | ToolError::ResourceUnavailable(s) => s.clone(),
        }
    }
}

/// 生成能力（LLM 后端）失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Model error: {reason}")]
pub struct ModelError {
    pub reason: String,
}

impl ModelError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// 计划校验失败；index 为出错步骤下标
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan has no steps")]
    EmptyPlan,

    #[error("Step {index}: unknown tool {tool}")]
    UnknownTool { index: usize, tool: String },

    #[error("Step {index}: tool {tool} is missing required parameter {parameter}")]
    MissingParameter {
        index: usize,
        tool: ToolKind,
        parameter: String,
    },

    #[error("Step {index}: parameter {parameter} of {tool} expects {expected}")]
    InvalidParameter {
        index: usize,
        tool: ToolKind,
        parameter: String,
        expected: String,
    },

    #[error("Step {index} depends on step {depends_on}, which does not precede it")]
    CyclicDependency { index: usize, depends_on: usize },
}

/// 规划规则文件加载错误（加载时快速失败）
#[derive(Error, Debug)]
pub enum RulesError {
    #[error("Failed to read rules file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rules file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid rule {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// 任务生命周期错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task {task_id}: cannot {action} while {from}")]
    InvalidTransition {
        task_id: String,
        from: String,
        action: &'static str,
    },

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {0}: every step already has a result")]
    ResultsFull(String),
}

/// 运行时入口（Agent / 二进制）汇总的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error("Config error: {0}")]
    Config(String),
}
