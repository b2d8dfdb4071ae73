//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸，含符号链接）；
//! ReadFileTool / WriteFileTool 基于 SafeFs 提供 read_file / write_file 能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::error::ToolError;
use crate::planner::Parameters;
use crate::tools::capability::ToolKind;
use crate::tools::registry::{InvocationContext, Tool};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法归一化后检查在沙箱内；目标已存在时再按 canonicalize 检查一次（符号链接）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let raw = path.trim();
        let escape = || ToolError::PermissionDenied(format!("Access denied: {raw}"));
        let candidate = Path::new(raw);
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root_dir)
                .map_err(|_| escape())?
                .to_path_buf()
        } else {
            candidate.to_path_buf()
        };

        let mut full = self.root_dir.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => {
                    full.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(escape()); // 如 ../../etc/passwd
                    }
                    full.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }

        match full.canonicalize() {
            Ok(canonical) if canonical.starts_with(&self.root_dir) => Ok(canonical),
            Ok(_) => Err(escape()),
            Err(_) => Ok(full),
        }
    }

    /// 相对 root 的显示路径
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

pub(crate) fn str_param<'a>(params: &'a Parameters, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing string parameter {name}")))
}

pub(crate) fn opt_u64_param(params: &Parameters, name: &str) -> Result<Option<u64>, ToolError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidInput(format!("{name} must be a non-negative integer"))),
    }
}

/// read_file：读取文件内容，可选行区间（0 起始，闭区间）
pub struct ReadFileTool {
    fs: SafeFs,
    max_bytes: u64,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>, max_file_size_mb: u64) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            max_bytes: max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn kind(&self) -> ToolKind {
        ToolKind::ReadFile
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\", \"start_line\"?: 0, \"end_line\"?: 10}"
    }

    async fn invoke(&self, params: &Parameters, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let path = str_param(params, "path")?;
        tracing::info!(path = %path, "read_file tool execute");
        let resolved = self.fs.resolve(path)?;
        let meta = match tokio::fs::metadata(&resolved).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(ToolError::Failed("File not found".to_string())),
        };
        if meta.len() > self.max_bytes {
            return Err(ToolError::InvalidInput(format!(
                "File too large: {} bytes (limit {})",
                meta.len(),
                self.max_bytes
            )));
        }
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::Failed(format!("Read failed: {e}")))?;

        let start = opt_u64_param(params, "start_line")?;
        let end = opt_u64_param(params, "end_line")?;
        if start.is_none() && end.is_none() {
            return Ok(Value::String(content));
        }
        let lines: Vec<&str> = content.lines().collect();
        let last = lines.len().saturating_sub(1) as u64;
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(last);
        if start > end {
            return Err(ToolError::InvalidInput(format!(
                "start_line {start} is after end_line {end}"
            )));
        }
        // end 超出文件末行时截到末行
        let count = end.min(last).saturating_sub(start).saturating_add(1);
        let selected = lines
            .iter()
            .skip(usize::try_from(start).unwrap_or(usize::MAX))
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Value::String(selected))
    }
}

/// write_file：写入文件，自动创建父目录
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn kind(&self) -> ToolKind {
        ToolKind::WriteFile
    }

    fn description(&self) -> &str {
        "Write content to a file. Args: {\"path\": \"file path relative to workspace\", \"content\": \"text\"}"
    }

    async fn invoke(&self, params: &Parameters, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let path = str_param(params, "path")?;
        let content = str_param(params, "content")?;
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        let resolved = self.fs.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(format!("Create dir failed: {e}")))?;
        }
        tokio::fs::write(&resolved, content.as_bytes())
            .await
            .map_err(|e| ToolError::Failed(format!("Write failed: {e}")))?;
        Ok(json!({
            "success": true,
            "path": self.fs.display(&resolved),
            "bytes": content.len(),
        }))
    }
}
