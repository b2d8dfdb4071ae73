//! 生成能力抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：generate(prompt, context) → 文本或 ModelError。

use async_trait::async_trait;

use crate::core::error::ModelError;
use crate::planner::ContextItem;

/// 生成能力 trait；context 为目标附带的有序键值对
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, context: &[ContextItem]) -> Result<String, ModelError>;

    /// 模型名（model_info 使用）
    fn model_name(&self) -> &str {
        "unknown"
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
