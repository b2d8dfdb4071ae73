//! 静态代码检查：基于正则的逐行规则（硬编码密钥、eval、shell 注入、SQL 拼接、unsafe、TODO/FIXME）

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::core::error::ToolError;
use crate::planner::Parameters;
use crate::tools::capability::ToolKind;
use crate::tools::filesystem::SafeFs;
use crate::tools::registry::{InvocationContext, Tool};
use crate::tools::search::walk_files;

const MAX_FILES: usize = 500;
const MAX_FINDINGS: usize = 500;

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "go", "java", "c", "h", "cpp", "hpp", "rb", "php", "sh", "toml",
    "yaml", "yml", "json", "env", "txt", "md",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
    Info,
}

struct Rule {
    id: &'static str,
    severity: Severity,
    message: &'static str,
    regex: Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub file: String,
    pub line: usize,
    pub rule: &'static str,
    pub severity: Severity,
    pub message: &'static str,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let defs: [(&str, Severity, &str, &str); 6] = [
            (
                "hardcoded_secret",
                Severity::High,
                "Possible hard-coded credential",
                r#"(?i)\b(password|passwd|secret|api_?key|access_?token|token)\b\s*[:=]\s*["'][^"']{4,}["']"#,
            ),
            (
                "unsafe_eval",
                Severity::High,
                "Dynamic code evaluation",
                r"\b(eval|exec)\s*\(",
            ),
            (
                "shell_injection",
                Severity::High,
                "Shell command built at runtime",
                r"(?i)(os\.system\s*\(|shell\s*=\s*true|child_process\.exec\s*\(|popen\s*\()",
            ),
            (
                "sql_concatenation",
                Severity::Medium,
                "SQL statement built by string concatenation",
                r#"(?i)\b(select|insert|update|delete)\b[^\n]*["']\s*(\+|%\s|\.format\()"#,
            ),
            (
                "unsafe_block",
                Severity::Low,
                "unsafe block",
                r"\bunsafe\s*\{",
            ),
            ("todo_marker", Severity::Info, "Unresolved marker", r"\b(TODO|FIXME|XXX)\b"),
        ];
        defs.into_iter()
            .filter_map(|(id, severity, message, pattern)| {
                Regex::new(pattern).ok().map(|regex| Rule {
                    id,
                    severity,
                    message,
                    regex,
                })
            })
            .collect()
    })
}

/// 对一段文本逐行套用全部规则
pub fn scan_content(file: &str, content: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for rule in rules() {
            if rule.regex.is_match(line) {
                findings.push(Finding {
                    file: file.to_string(),
                    line: idx + 1,
                    rule: rule.id,
                    severity: rule.severity,
                    message: rule.message,
                });
            }
        }
    }
    findings
}

fn is_code_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CODE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// analyze_code：检查单个文件或目录
pub struct AnalyzeCodeTool {
    fs: SafeFs,
    max_file_size: u64,
}

impl AnalyzeCodeTool {
    pub fn new(root_dir: impl AsRef<Path>, max_file_size_mb: u64) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            max_file_size: max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }
}

#[async_trait]
impl Tool for AnalyzeCodeTool {
    fn kind(&self) -> ToolKind {
        ToolKind::AnalyzeCode
    }

    fn description(&self) -> &str {
        "Static checks for secrets, eval, shell injection, SQL concatenation and TODO markers. Args: {\"path\": \".\"}"
    }

    async fn invoke(&self, params: &Parameters, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let path = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "analyze_code tool execute");
        let target = self.fs.resolve(path)?;
        if !target.exists() {
            return Err(ToolError::Failed(format!("Path not found: {path}")));
        }

        let fs = self.fs.clone();
        let max_file_size = self.max_file_size;
        let (files_scanned, findings) = tokio::task::spawn_blocking(move || {
            let files = if target.is_file() {
                vec![target]
            } else {
                walk_files(&target)
                    .into_iter()
                    .filter(|p| is_code_file(p))
                    .take(MAX_FILES)
                    .collect()
            };
            let mut scanned = 0usize;
            let mut findings = Vec::new();
            for file in files {
                let small = std::fs::metadata(&file)
                    .map(|m| m.len() <= max_file_size)
                    .unwrap_or(false);
                if !small {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(&file) else {
                    continue;
                };
                scanned += 1;
                findings.extend(scan_content(&fs.display(&file), &content));
                if findings.len() >= MAX_FINDINGS {
                    findings.truncate(MAX_FINDINGS);
                    break;
                }
            }
            findings.sort_by(|a: &Finding, b: &Finding| (&a.file, a.line).cmp(&(&b.file, b.line)));
            (scanned, findings)
        })
        .await
        .map_err(|e| ToolError::Failed(format!("Analysis failed: {e}")))?;

        Ok(serde_json::json!({
            "files_scanned": files_scanned,
            "findings": findings,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskId;

    #[test]
    fn test_scan_content_rules() {
        let src = "api_key = \"sk-1234567890\"\nlet x = 1;\n// TODO: remove\nos.system(cmd)\n";
        let findings = scan_content("a.py", src);
        let rules: Vec<_> = findings.iter().map(|f| (f.line, f.rule)).collect();
        assert_eq!(
            rules,
            vec![(1, "hardcoded_secret"), (3, "todo_marker"), (4, "shell_injection")]
        );
    }

    #[test]
    fn test_sql_concatenation() {
        let findings = scan_content("q.py", "q = \"SELECT * FROM users WHERE id=\" + uid");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule, "sql_concatenation");
        assert_eq!(findings[0].severity, Severity::Medium);
    }

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(rules().len(), 6);
    }

    #[tokio::test]
    async fn test_analyze_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "unsafe { run() }\n").unwrap();
        std::fs::write(dir.path().join("image.png"), "TODO").unwrap();
        let tool = AnalyzeCodeTool::new(dir.path(), 10);
        let out = tool
            .invoke(&Parameters::new(), &InvocationContext::new(TaskId::new(), 0))
            .await
            .unwrap();
        assert_eq!(out["files_scanned"], 1);
        assert_eq!(out["findings"][0]["file"], "src/lib.rs");
        assert_eq!(out["findings"][0]["rule"], "unsafe_block");
    }

    #[tokio::test]
    async fn test_analyze_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = AnalyzeCodeTool::new(dir.path(), 10);
        let mut params = Parameters::new();
        params.insert("path".into(), Value::String("nope".into()));
        let err = tool
            .invoke(&params, &InvocationContext::new(TaskId::new(), 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::FailureKind::ToolFailure);
    }
}
