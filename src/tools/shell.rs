//! execute_command：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）。未提权时拒绝 shell 元字符，
//! 按词拆分后直接执行程序，不经过 shell；步骤被提权（escalated）后越过白名单并通过 sh -c / cmd /C 执行。
//! FORBIDDEN_SUBSTR 始终禁止。工作目录为沙箱根，带超时。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::core::error::ToolError;
use crate::planner::Parameters;
use crate::tools::capability::ToolKind;
use crate::tools::filesystem::{opt_u64_param, str_param};
use crate::tools::registry::{InvocationContext, Tool};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 未提权时不允许的 shell 元字符（命令串联、管道、重定向、命令替换）
const SHELL_METACHARS: &[&str] = &[";", "&", "|", "`", "$(", "${", ">", "<", "\n", "\r"];

/// 按空白拆词，支持成对的单/双引号；引号不闭合时返回 None
fn split_words(raw: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    for c in raw.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return None;
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}

pub struct ExecuteCommandTool {
    allowed_commands: HashSet<String>,
    default_timeout_secs: u64,
    workdir: PathBuf,
}

impl ExecuteCommandTool {
    pub fn new(workdir: impl AsRef<Path>, allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            default_timeout_secs: timeout_secs,
            workdir: workdir.as_ref().to_path_buf(),
        }
    }

    /// 解析命令：只取第一个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn check(&self, raw: &str, escalated: bool) -> Result<(), ToolError> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(ToolError::PermissionDenied(format!(
                    "Forbidden pattern: {forbidden}"
                )));
            }
        }
        let name = Self::command_name(&raw_lower);
        if name.is_empty() {
            return Err(ToolError::InvalidInput("Empty command".to_string()));
        }
        if escalated {
            return Ok(());
        }
        if let Some(meta) = SHELL_METACHARS.iter().find(|m| raw.contains(**m)) {
            return Err(ToolError::PermissionDenied(format!(
                "Shell operator not allowed: {}",
                meta.escape_debug()
            )));
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(ToolError::PermissionDenied(format!("Command not allowed: {name}")))
    }

    /// 提权步骤交给 shell；否则直接执行程序
    fn build_command(raw: &str, escalated: bool) -> Result<Command, ToolError> {
        if escalated {
            let mut c = if cfg!(target_os = "windows") {
                let mut c = Command::new("cmd");
                c.args(["/C", raw]);
                c
            } else {
                let mut c = Command::new("sh");
                c.args(["-c", raw]);
                c
            };
            c.kill_on_drop(true);
            return Ok(c);
        }
        let words = split_words(raw)
            .ok_or_else(|| ToolError::InvalidInput("Unterminated quote in command".to_string()))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| ToolError::InvalidInput("Empty command".to_string()))?;
        let mut c = Command::new(program);
        c.args(args).kill_on_drop(true);
        Ok(c)
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ExecuteCommand
    }

    fn description(&self) -> &str {
        "Run an allow-listed shell command in the workspace. Args: {\"command\": \"ls -la\", \"timeout_secs\": 30}"
    }

    async fn invoke(&self, params: &Parameters, ctx: &InvocationContext) -> Result<Value, ToolError> {
        let command = str_param(params, "command")?.trim();
        self.check(command, ctx.escalated)?;
        let timeout_secs = opt_u64_param(params, "timeout_secs")?.unwrap_or(self.default_timeout_secs);

        tracing::info!(command = %command, escalated = ctx.escalated, "execute_command tool execute");

        let mut cmd = Self::build_command(command, ctx.escalated)?;
        cmd.current_dir(&self.workdir);

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
            .map_err(|_| ToolError::Timeout(format!("Command timed out after {timeout_secs}s")))?
            .map_err(|e| ToolError::Failed(format!("Execution failed: {e}")))?;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "returncode": output.status.code().unwrap_or(-1),
        }))
    }
}
