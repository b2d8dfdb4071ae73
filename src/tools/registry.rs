//! 能力注册表
//!
//! 所有工具实现 Tool trait（kind / description / invoke），由 CapabilityRegistry 按 ToolKind 注册与查找；
//! 启动时注册完毕后以 Arc 共享，只读。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::ToolError;
use crate::core::task::TaskId;
use crate::planner::Parameters;
use crate::tools::capability::{ToolCapability, ToolKind};

/// 单次调用的上下文
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    pub step_index: usize,
    /// 恢复策略 EscalatePermission 之后为 true（例如允许白名单外命令）
    pub escalated: bool,
}

impl InvocationContext {
    pub fn new(task_id: TaskId, step_index: usize) -> Self {
        Self {
            task_id,
            step_index,
            escalated: false,
        }
    }
}

/// 工具 trait：种类、描述（供 LLM 理解）、能力声明、异步调用（参数为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 schema 与资源需求；默认使用该种类的标准声明
    fn capability(&self) -> ToolCapability {
        ToolCapability::standard(self.kind())
    }

    async fn invoke(&self, params: &Parameters, ctx: &InvocationContext) -> Result<Value, ToolError>;
}

struct Registered {
    capability: ToolCapability,
    tool: Arc<dyn Tool>,
}

/// 按 ToolKind 存储工具及其能力声明；同一种类重复注册时后者覆盖前者
#[derive(Default)]
pub struct CapabilityRegistry {
    tools: HashMap<ToolKind, Registered>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let capability = tool.capability();
        self.register_with(capability, Arc::new(tool));
    }

    /// 以自定义能力声明注册（例如覆盖资源需求）
    pub fn register_with(&mut self, capability: ToolCapability, tool: Arc<dyn Tool>) {
        let kind = capability.id;
        if self.tools.contains_key(&kind) {
            tracing::warn!(tool = %kind, "tool registered twice, replacing");
        }
        self.tools.insert(kind, Registered { capability, tool });
    }

    pub fn get(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.get(&kind).map(|r| Arc::clone(&r.tool))
    }

    pub fn capability(&self, kind: ToolKind) -> Option<&ToolCapability> {
        self.tools.get(&kind).map(|r| &r.capability)
    }

    pub fn contains(&self, kind: ToolKind) -> bool {
        self.tools.contains_key(&kind)
    }

    /// 已注册种类，按 ToolKind 声明顺序
    pub fn kinds(&self) -> Vec<ToolKind> {
        let mut kinds: Vec<ToolKind> = self.tools.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的 Available tools 段落
    pub fn descriptions(&self) -> Vec<(ToolKind, String)> {
        self.kinds()
            .into_iter()
            .filter_map(|k| {
                self.tools
                    .get(&k)
                    .map(|r| (k, r.tool.description().to_string()))
            })
            .collect()
    }

    pub fn to_schema_json(&self) -> Value {
        let tools: Vec<Value> = self
            .kinds()
            .into_iter()
            .filter_map(|k| self.tools.get(&k))
            .map(|r| {
                serde_json::json!({
                    "name": r.capability.id.as_str(),
                    "description": r.tool.description(),
                    "parameters": r.capability.schema.to_json(),
                })
            })
            .collect();
        Value::Array(tools)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
