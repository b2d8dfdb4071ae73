//! Agent 构建器：从 AppConfig 组装注册表、资源账本、规划器、恢复策略、监控器与任务表
//!
//! CLI 与 JSON-RPC 服务共用同一套组装逻辑；测试通过 with_llm / with_tool 注入替身。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::Agent;
use crate::config::AppConfig;
use crate::core::error::AgentError;
use crate::core::ledger::{ResourceKind, ResourceLedger};
use crate::core::monitor::{ExecutionMonitor, MonitorSettings};
use crate::core::recovery::{RecoveryPolicy, RecoverySettings};
use crate::core::task::TaskManager;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{PatternLearner, PatternStore};
use crate::planner::{KeywordTier, ModelTier, PlanSynthesizer, PlanValidator, RuleSet, RuleTier};
use crate::tools::{
    AnalyzeCodeTool, CapabilityRegistry, ExecuteCommandTool, FileSearchTool, GenerateTool,
    ReadFileTool, SearchCodeTool, Tool, ToolCapability, ToolDispatcher, WriteFileTool,
};

/// 按 provider 与 API Key 选择 LLM 后端；缺 Key 时回退 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::echo())
        }
        "openai" => match cfg.llm.resolved_api_key() {
            Some(key) => {
                tracing::info!(model = %cfg.llm.model, "Using OpenAI LLM");
                Arc::new(OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    &key,
                    cfg.llm.timeout_secs,
                ))
            }
            None => {
                tracing::warn!("No API key set, using Mock LLM");
                Arc::new(MockLlmClient::echo())
            }
        },
        other => {
            tracing::warn!(provider = %other, "Unknown LLM provider, using Mock LLM");
            Arc::new(MockLlmClient::echo())
        }
    }
}

/// 配置中的容量表；未知种类告警后忽略
fn parse_capacity(raw: &BTreeMap<String, u64>) -> BTreeMap<ResourceKind, u64> {
    raw.iter()
        .filter_map(|(name, qty)| match name.parse::<ResourceKind>() {
            Ok(kind) => Some((kind, *qty)),
            Err(e) => {
                tracing::warn!(resource = %name, error = %e, "ignoring unknown resource kind");
                None
            }
        })
        .collect()
}

enum ExtraTool {
    Standard(Arc<dyn Tool>),
    WithCapability(ToolCapability, Arc<dyn Tool>),
}

pub struct AgentBuilder {
    config: AppConfig,
    workspace: Option<PathBuf>,
    llm: Option<Arc<dyn LlmClient>>,
    rules: Option<RuleSet>,
    extra_tools: Vec<ExtraTool>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            workspace: None,
            llm: None,
            rules: None,
            extra_tools: Vec::new(),
        }
    }

    /// 覆盖 [app].workspace_root
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 覆盖 [planning].rules_path 与内置规则
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    /// 额外注册的工具（同名替换内置工具）
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.extra_tools.push(ExtraTool::Standard(Arc::new(tool)));
        self
    }

    pub fn with_capability(mut self, capability: ToolCapability, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(ExtraTool::WithCapability(capability, tool));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn resolve_workspace(&self) -> Result<PathBuf, AgentError> {
        let workspace = match self.workspace.clone().or_else(|| self.config.app.workspace_root.clone()) {
            Some(p) => p,
            None => std::env::current_dir()
                .map_err(|e| AgentError::Config(format!("cannot determine current dir: {e}")))?
                .join("workspace"),
        };
        std::fs::create_dir_all(&workspace).map_err(|e| {
            AgentError::Config(format!("cannot create workspace {}: {e}", workspace.display()))
        })?;
        Ok(workspace.canonicalize().unwrap_or(workspace))
    }

    fn build_registry(&self, workspace: &Path, llm: Arc<dyn LlmClient>) -> CapabilityRegistry {
        let tools = &self.config.tools;
        let mut registry = CapabilityRegistry::new();
        registry.register(ReadFileTool::new(workspace, tools.max_file_size_mb));
        registry.register(WriteFileTool::new(workspace));
        registry.register(SearchCodeTool::new(workspace, tools.max_file_size_mb));
        registry.register(FileSearchTool::new(workspace));
        registry.register(AnalyzeCodeTool::new(workspace, tools.max_file_size_mb));
        if tools.enable_execute_command {
            registry.register(ExecuteCommandTool::new(
                workspace,
                tools.allowed_commands.clone(),
                tools.command_timeout_secs,
            ));
        }
        registry.register(GenerateTool::new(llm));

        for extra in &self.extra_tools {
            match extra {
                ExtraTool::Standard(tool) => {
                    registry.register_with(ToolCapability::standard(tool.kind()), Arc::clone(tool))
                }
                ExtraTool::WithCapability(capability, tool) => {
                    registry.register_with(capability.clone(), Arc::clone(tool))
                }
            }
        }
        registry
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let workspace = self.resolve_workspace()?;
        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let rules = match (&self.rules, &self.config.planning.rules_path) {
            (Some(rules), _) => rules.clone(),
            (None, Some(path)) => RuleSet::from_path(path)?,
            (None, None) => RuleSet::builtin()?,
        };
        let rules = Arc::new(rules);

        let registry = Arc::new(self.build_registry(&workspace, llm.clone()));
        let ledger = ResourceLedger::new(parse_capacity(&self.config.resources.capacity));
        let patterns = Arc::new(PatternStore::new());
        let validator = Arc::new(PlanValidator::new(registry.clone()));

        let planning = &self.config.planning;
        let mut synthesizer =
            PlanSynthesizer::new(KeywordTier::new(registry.clone()), validator.clone(), rules.clone());
        if planning.enable_model_tier {
            synthesizer = synthesizer.with_tier(Box::new(ModelTier::new(
                llm.clone(),
                registry.clone(),
                patterns.clone(),
                rules.clone(),
                planning.max_parse_attempts,
            )));
        }
        synthesizer = synthesizer.with_tier(Box::new(RuleTier::new(
            rules.clone(),
            patterns.clone(),
            planning.learned_ordering,
        )));

        let rc = &self.config.recovery;
        let recovery = Arc::new(RecoveryPolicy::new(
            RecoverySettings {
                resource_retries: rc.resource_retries,
                backoff_base: Duration::from_millis(rc.backoff_base_ms),
                backoff_max: Duration::from_millis(rc.backoff_max_ms),
                max_substitutions: rc.max_substitutions,
                allow_escalation: rc.allow_escalation,
            },
            registry.clone(),
            validator.clone(),
        ));

        let mc = &self.config.monitor;
        let dispatcher = Arc::new(ToolDispatcher::new(registry.clone(), ledger.clone()));
        let monitor = ExecutionMonitor::new(
            dispatcher,
            recovery,
            PatternLearner::new(patterns.clone()),
            MonitorSettings {
                poll_interval: Duration::from_millis(mc.poll_interval_ms),
                step_timeout: Duration::from_millis(mc.step_timeout_ms),
                timeout_extension_factor: mc.timeout_extension_factor,
                max_errors: mc.max_errors,
            },
        );
        let tasks = TaskManager::new(self.config.app.max_tasks);

        tracing::info!(
            workspace = %workspace.display(),
            tools = registry.len(),
            model = %llm.model_name(),
            tiers = ?synthesizer.tiers(),
            "agent built"
        );

        Ok(Agent::from_parts(crate::agent::AgentParts {
            config: self.config,
            workspace,
            llm,
            registry,
            ledger,
            patterns,
            validator,
            synthesizer,
            monitor,
            tasks,
        }))
    }
}
