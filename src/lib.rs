//! Ant - 分层规划 + 受监督执行的任务智能体
//!
//! 模块划分：
//! - **agent**: Agent 运行时（规划 → 任务 → 监督执行 → 报告）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、资源账本、任务生命周期、执行监控、失败恢复、构建器
//! - **llm**: 生成能力抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 模式学习（按目标模式统计工具成功率）
//! - **observability**: tracing 初始化
//! - **planner**: Model / Rule / Keyword 三层规划与计划校验
//! - **rpc**: JSON-RPC 2.0 服务（stdio / TCP）
//! - **tools**: 能力注册表、分发器与参考工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod rpc;
pub mod tools;

pub use agent::{Agent, TaskReport};
pub use config::{load_config, AppConfig};
pub use core::{AgentBuilder, AgentError, FailureKind, TaskId, TaskStatus};
pub use planner::{ContextItem, Goal, Plan, Step, Tier};
