//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANT__*` 覆盖（双下划线表示嵌套，如 `ANT__MONITOR__MAX_ERRORS=3`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub resources: ResourcesSection,
    pub monitor: MonitorSection,
    pub recovery: RecoverySection,
    pub planning: PlanningSection,
    pub server: ServerSection,
}

/// [app] 段：工作目录与任务表容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 任务表上限，超出时淘汰最早结束的任务
    pub max_tasks: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            max_tasks: 1000,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai；openai 需要 api_key 或环境变量 OPENAI_API_KEY，否则回退 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            timeout_secs: 60,
        }
    }
}

impl LlmSection {
    /// 配置中的 key 优先，其次 OPENAI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [tools] 段：Shell 白名单、超时与文件大小上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 允许执行的命令名（仅首词，如 ls、grep、cargo）
    pub allowed_commands: Vec<String>,
    pub command_timeout_secs: u64,
    pub max_file_size_mb: u64,
    pub enable_execute_command: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            command_timeout_secs: 30,
            max_file_size_mb: 10,
            enable_execute_command: true,
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "echo".into(),
        "cargo".into(),
        "rustc".into(),
    ]
}

/// [resources] 段：各资源种类的容量；未列出的种类不限量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub capacity: BTreeMap<String, u64>,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        let capacity = [
            ("tool_slot", 4),
            ("model_session", 1),
            ("subprocess", 2),
            ("workspace_write", 1),
            ("memory_mb", 512),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { capacity }
    }
}

/// [monitor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub poll_interval_ms: u64,
    pub step_timeout_ms: u64,
    pub timeout_extension_factor: f64,
    pub max_errors: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            step_timeout_ms: 30_000,
            timeout_extension_factor: 2.0,
            max_errors: 5,
        }
    }
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub resource_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_substitutions: u32,
    pub allow_escalation: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            resource_retries: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 2000,
            max_substitutions: 2,
            allow_escalation: false,
        }
    }
}

/// [planning] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanningSection {
    /// 规则文件（.toml 或 .json）；未设置时用内置规则
    pub rules_path: Option<PathBuf>,
    pub max_parse_attempts: u32,
    pub enable_model_tier: bool,
    /// 是否按历史成功率重排规则命中的工具序列
    pub learned_ordering: bool,
}

impl Default for PlanningSection {
    fn default() -> Self {
        Self {
            rules_path: None,
            max_parse_attempts: 2,
            enable_model_tier: true,
            learned_ordering: true,
        }
    }
}

/// [server] 段：TCP 服务监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ANT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
