//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 三种模式：Echo 回显提示词；Scripted 按顺序返回预置结果（用完后回显）；Failing 始终返回 ModelError。
//! 收到的提示词都会记录下来，便于断言重新提示的内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::error::ModelError;
use crate::llm::LlmClient;
use crate::planner::ContextItem;

#[derive(Debug)]
enum Mode {
    Echo,
    Scripted(VecDeque<Result<String, ModelError>>),
    Failing(String),
}

#[derive(Debug)]
pub struct MockLlmClient {
    mode: Mutex<Mode>,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::echo()
    }
}

impl MockLlmClient {
    pub fn echo() -> Self {
        Self::with_mode(Mode::Echo)
    }

    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_mode(Mode::Scripted(
            responses.into_iter().map(|s| Ok(s.into())).collect(),
        ))
    }

    /// 预置结果中可以混入 Err
    pub fn scripted_results(results: Vec<Result<String, ModelError>>) -> Self {
        Self::with_mode(Mode::Scripted(results.into()))
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_mode(Mode::Failing(reason.into()))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn echo_text(prompt: &str) -> String {
        format!("Model response to: {prompt}")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str, _context: &[ContextItem]) -> Result<String, ModelError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let mut mode = self.mode.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *mode {
            Mode::Echo => Ok(Self::echo_text(prompt)),
            Mode::Scripted(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Ok(Self::echo_text(prompt))),
            Mode::Failing(reason) => Err(ModelError::new(reason.clone())),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_then_echo() {
        let m = MockLlmClient::scripted(["first"]);
        assert_eq!(m.generate("a", &[]).await.unwrap(), "first");
        assert_eq!(m.generate("b", &[]).await.unwrap(), "Model response to: b");
        assert_eq!(m.prompts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failing() {
        let m = MockLlmClient::failing("offline");
        assert_eq!(m.generate("a", &[]).await.unwrap_err().reason, "offline");
    }
}
