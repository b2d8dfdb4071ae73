//! generate：把生成能力包装成工具，模型失败映射为 ToolFailure

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::ToolError;
use crate::llm::LlmClient;
use crate::planner::Parameters;
use crate::tools::capability::ToolKind;
use crate::tools::filesystem::str_param;
use crate::tools::registry::{InvocationContext, Tool};

pub struct GenerateTool {
    llm: Arc<dyn LlmClient>,
}

impl GenerateTool {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Tool for GenerateTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Generate
    }

    fn description(&self) -> &str {
        "Answer a question or produce text with the language model. Args: {\"prompt\": \"text\"}"
    }

    async fn invoke(&self, params: &Parameters, ctx: &InvocationContext) -> Result<Value, ToolError> {
        let prompt = str_param(params, "prompt")?;
        tracing::info!(task_id = %ctx.task_id, prompt_len = prompt.len(), "generate tool execute");
        self.llm
            .generate(prompt, &[])
            .await
            .map(Value::String)
            .map_err(|e| ToolError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::FailureKind;
    use crate::core::task::TaskId;
    use crate::llm::MockLlmClient;

    fn prompt(text: &str) -> Parameters {
        let mut p = Parameters::new();
        p.insert("prompt".into(), Value::String(text.into()));
        p
    }

    #[tokio::test]
    async fn test_generate_echo() {
        let tool = GenerateTool::new(Arc::new(MockLlmClient::echo()));
        let out = tool
            .invoke(&prompt("why"), &InvocationContext::new(TaskId::new(), 0))
            .await
            .unwrap();
        assert_eq!(out, Value::String("Model response to: why".into()));
    }

    #[tokio::test]
    async fn test_model_error_is_tool_failure() {
        let tool = GenerateTool::new(Arc::new(MockLlmClient::failing("offline")));
        let err = tool
            .invoke(&prompt("why"), &InvocationContext::new(TaskId::new(), 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ToolFailure);
    }
}
