//! RpcService：把 JSON-RPC 方法映射到 Agent 操作
//!
//! 方法：initialize、handle_task、get_task / get_state、cancel_task、list_tasks、model_info、ping。

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::Agent;
use crate::core::task::TaskId;
use crate::planner::{ContextItem, Goal};
use crate::rpc::protocol::{JsonRpcRequest, JsonRpcResponse, RpcError, JSONRPC_VERSION};

pub const SUPPORTED_METHODS: &[&str] = &[
    "initialize",
    "handle_task",
    "get_task",
    "get_state",
    "cancel_task",
    "list_tasks",
    "model_info",
    "ping",
];

/// context 可以是 [{key, value}] 或 {key: value}
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContextParam {
    List(Vec<ContextItem>),
    Map(IndexMap<String, Value>),
}

impl ContextParam {
    fn into_items(self) -> Vec<ContextItem> {
        match self {
            ContextParam::List(items) => items,
            ContextParam::Map(map) => map
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => ContextItem::new(k, s),
                    other => ContextItem::new(k, other.to_string()),
                })
                .collect(),
        }
    }
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct HandleTaskParams {
    goal: String,
    #[serde(default)]
    context: Option<ContextParam>,
    #[serde(default = "default_wait")]
    wait: bool,
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    task_id: TaskId,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(e.to_string()))
}

pub struct RpcService {
    agent: Agent,
}

impl RpcService {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// 处理一行文本；空行返回 None
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let response = match serde_json::from_str::<Value>(trimmed) {
            Err(e) => {
                tracing::warn!(error = %e, "invalid JSON in request");
                JsonRpcResponse::failure(None, RpcError::Parse(e.to_string()))
            }
            Ok(value) => {
                let id = value.get("id").cloned();
                match serde_json::from_value::<JsonRpcRequest>(value) {
                    Ok(request) => self.handle(request).await,
                    Err(e) => JsonRpcResponse::failure(id, RpcError::InvalidRequest(e.to_string())),
                }
            }
        };
        match serde_json::to_string(&response) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                None
            }
        }
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc != JSONRPC_VERSION {
            return JsonRpcResponse::failure(
                request.id,
                RpcError::InvalidRequest(format!("unsupported jsonrpc version {}", request.jsonrpc)),
            );
        }
        tracing::debug!(method = %request.method, "handling request");
        match self.dispatch(&request.method, request.params).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(e) => {
                tracing::warn!(method = %request.method, code = e.code(), error = %e, "request failed");
                JsonRpcResponse::failure(request.id, e)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize()),
            "handle_task" => self.handle_task(parse_params(params)?).await,
            "get_task" | "get_state" => {
                let p: TaskIdParams = parse_params(params)?;
                let snapshot = self
                    .agent
                    .snapshot(p.task_id)
                    .await
                    .ok_or_else(|| RpcError::InvalidParams(format!("Task not found: {}", p.task_id)))?;
                to_json(&snapshot)
            }
            "cancel_task" => {
                let p: TaskIdParams = parse_params(params)?;
                let cancelled = self.agent.cancel(p.task_id).await?;
                Ok(json!({ "task_id": p.task_id, "cancelled": cancelled }))
            }
            "list_tasks" => {
                let tasks = to_json(&self.agent.list().await)?;
                Ok(json!({ "tasks": tasks }))
            }
            "model_info" => {
                let llm = self.agent.llm();
                let (prompt, completion, total) = llm.token_usage();
                Ok(json!({
                    "model": llm.model_name(),
                    "token_usage": {
                        "prompt_tokens": prompt,
                        "completion_tokens": completion,
                        "total_tokens": total,
                    }
                }))
            }
            "ping" => Ok(json!({ "pong": true })),
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "serverType": "agent",
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": {
                "supportedMethods": SUPPORTED_METHODS,
                "tools": self.agent.registry().to_schema_json(),
            }
        })
    }

    async fn handle_task(&self, p: HandleTaskParams) -> Result<Value, RpcError> {
        if p.goal.trim().is_empty() {
            return Err(RpcError::InvalidParams("goal must not be empty".to_string()));
        }
        let context = p.context.map(ContextParam::into_items).unwrap_or_default();
        let goal = Goal::new(p.goal).with_context(context);
        if p.wait {
            let report = self.agent.run_goal(goal).await?;
            to_json(&report)
        } else {
            let id = self.agent.submit(goal).await?;
            Ok(json!({ "task_id": id }))
        }
    }
}
