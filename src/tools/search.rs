//! 代码搜索工具：search_code（按内容，不区分大小写计数）与 file_search（按文件名 / glob）
//!
//! 遍历用 walkdir，跳过隐藏目录与 target/node_modules；过滤用 glob::Pattern。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::core::error::ToolError;
use crate::planner::Parameters;
use crate::tools::capability::ToolKind;
use crate::tools::filesystem::{str_param, SafeFs};
use crate::tools::registry::{InvocationContext, Tool};

const SKIP_DIRS: &[&str] = &["target", "node_modules", "__pycache__"];
const MAX_RESULTS: usize = 200;

/// 列出 base 下的普通文件（不进入隐藏目录与构建产物目录）
pub(crate) fn walk_files(base: &Path) -> Vec<PathBuf> {
    WalkDir::new(base)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !(name.starts_with('.') || (e.file_type().is_dir() && SKIP_DIRS.contains(&&*name)))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn compile_glob(pattern: &str) -> Result<Pattern, ToolError> {
    Pattern::new(pattern).map_err(|e| ToolError::InvalidInput(format!("Invalid glob {pattern}: {e}")))
}

fn glob_matches(pattern: &Pattern, relative: &str) -> bool {
    let opts = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    if pattern.as_str() == "**/*" || pattern.as_str() == "*" {
        return true;
    }
    let file_name = relative.rsplit('/').next().unwrap_or(relative);
    pattern.matches_with(relative, opts) || pattern.matches_with(file_name, opts)
}

/// search_code：在匹配 file_pattern 的文件中统计 query 出现次数
pub struct SearchCodeTool {
    fs: SafeFs,
    max_file_size: u64,
}

impl SearchCodeTool {
    pub fn new(root_dir: impl AsRef<Path>, max_file_size_mb: u64) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            max_file_size: max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }
}

#[async_trait]
impl Tool for SearchCodeTool {
    fn kind(&self) -> ToolKind {
        ToolKind::SearchCode
    }

    fn description(&self) -> &str {
        "Search file contents (case-insensitive). Args: {\"query\": \"text\", \"file_pattern\": \"**/*.rs\"}"
    }

    async fn invoke(&self, params: &Parameters, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let query = str_param(params, "query")?.trim().to_lowercase();
        if query.is_empty() {
            return Err(ToolError::InvalidInput("query must not be empty".to_string()));
        }
        let file_pattern = params
            .get("file_pattern")
            .and_then(|v| v.as_str())
            .unwrap_or("**/*");
        let pattern = compile_glob(file_pattern)?;
        tracing::info!(query = %query, file_pattern = %file_pattern, "search_code tool execute");

        let fs = self.fs.clone();
        let max_file_size = self.max_file_size;
        let hits = tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            for path in walk_files(fs.root()) {
                let relative = fs.display(&path);
                if !glob_matches(&pattern, &relative) {
                    continue;
                }
                let too_big = std::fs::metadata(&path)
                    .map(|m| m.len() > max_file_size)
                    .unwrap_or(true);
                if too_big {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&path) else {
                    continue; // 跳过二进制或无法读取的文件
                };
                let matches = content.to_lowercase().matches(&query).count();
                if matches > 0 {
                    hits.push((relative, matches));
                }
                if hits.len() >= MAX_RESULTS {
                    break;
                }
            }
            hits.sort();
            hits
        })
        .await
        .map_err(|e| ToolError::Failed(format!("Search failed: {e}")))?;

        Ok(Value::Array(
            hits.into_iter()
                .map(|(file, matches)| json!({ "file": file, "matches": matches }))
                .collect(),
        ))
    }
}

/// file_search：按 glob 或文件名片段查找文件
pub struct FileSearchTool {
    fs: SafeFs,
}

impl FileSearchTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for FileSearchTool {
    fn kind(&self) -> ToolKind {
        ToolKind::FileSearch
    }

    fn description(&self) -> &str {
        "Find files by glob or name fragment. Args: {\"pattern\": \"*.toml\"}"
    }

    async fn invoke(&self, params: &Parameters, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let raw = str_param(params, "pattern")?.trim().to_string();
        if raw.is_empty() {
            return Err(ToolError::InvalidInput("pattern must not be empty".to_string()));
        }
        let is_glob = raw.contains(['*', '?', '[']);
        let pattern = if is_glob { Some(compile_glob(&raw)?) } else { None };
        let needle = raw.to_lowercase();
        tracing::info!(pattern = %raw, "file_search tool execute");

        let fs = self.fs.clone();
        let mut files = tokio::task::spawn_blocking(move || {
            walk_files(fs.root())
                .into_iter()
                .map(|p| fs.display(&p))
                .filter(|rel| match &pattern {
                    Some(p) => glob_matches(p, rel),
                    None => rel.to_lowercase().contains(&needle),
                })
                .take(MAX_RESULTS)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ToolError::Failed(format!("Search failed: {e}")))?;
        files.sort();
        Ok(json!({ "files": files }))
    }
}
