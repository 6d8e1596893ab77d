use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::LLMConfig;
use crate::types::{AppError, AppResult, LLMMessage, LLMProvider, LLMRequest, LLMResponse};
use crate::utils::retry::{with_retry, RetryPolicy};

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;
}

/// Error for a non-success provider status. Rate limits and server errors
/// may clear up on retry; other client errors will not.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, message: &str) -> AppError {
    let text = format!("{} API error ({}): {}", provider, status, message);
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        AppError::ServiceRejected(text)
    } else {
        AppError::ServiceInvocation(text)
    }
}

/// The completion service as seen by the planner and the stage agents:
/// one system instruction plus one user instruction in, free text out.
#[derive(Clone)]
pub struct LLM {
    adapter: Arc<dyn LLMAdapter>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl LLM {
    pub fn new(adapter: Arc<dyn LLMAdapter>, model: impl Into<String>) -> Self {
        Self {
            adapter,
            model: model.into(),
            temperature: 0.2,
            max_tokens: 2048,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the configured provider, or `None` when no API key is set.
    pub fn from_config(config: &LLMConfig) -> Option<Self> {
        let api_key = config.active_api_key()?;
        let adapter: Arc<dyn LLMAdapter> = match (config.provider, &config.base_url) {
            (LLMProvider::OpenAI, Some(base)) => {
                Arc::new(crate::llm::openai::OpenAIAdapter::new_with_api_base(&api_key, base))
            }
            (LLMProvider::OpenAI, None) => Arc::new(crate::llm::openai::OpenAIAdapter::new(&api_key)),
            (LLMProvider::Anthropic, Some(base)) => {
                Arc::new(crate::llm::anthropic::AnthropicAdapter::new_with_api_base(&api_key, base))
            }
            (LLMProvider::Anthropic, None) => {
                Arc::new(crate::llm::anthropic::AnthropicAdapter::new(&api_key))
            }
            (LLMProvider::Groq, _) => Arc::new(crate::llm::groq::GroqAdapter::new(&api_key)),
        };

        Some(
            Self::new(adapter, config.model.clone())
                .with_sampling(config.temperature, config.max_tokens)
                .with_retry(RetryPolicy::new(
                    config.max_attempts,
                    Duration::from_millis(config.retry_base_delay_ms),
                )),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        with_retry(self.retry, move || self.adapter.create_chat_completion(request)).await
    }

    /// Send one instruction and return the reply text.
    pub async fn complete(&self, system: &str, instruction: &str) -> AppResult<String> {
        let request = LLMRequest {
            model: self.model.clone(),
            messages: vec![LLMMessage::user(instruction)],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            system_instruction: Some(system.to_string()),
        };

        let response = self.create_chat_completion(&request).await?;
        debug!(
            model = %self.model,
            response_len = response.content.len(),
            total_tokens = response.usage.total_tokens,
            "Completion received"
        );
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLLM;

    #[tokio::test]
    async fn test_complete_forwards_system_and_instruction() {
        let scripted = ScriptedLLM::new(vec![Ok("hello".to_string())]);
        let llm = LLM::new(scripted.clone(), "test-model");

        let reply = llm.complete("be brief", "say hi").await.unwrap();
        assert_eq!(reply, "hello");

        let requests = scripted.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "test-model");
        assert_eq!(requests[0].system_instruction.as_deref(), Some("be brief"));
        assert_eq!(requests[0].messages, vec![LLMMessage::user("say hi")]);
    }

    #[test]
    fn test_from_config_requires_key() {
        let mut config = crate::config::Config::default().llm;
        assert!(LLM::from_config(&config).is_none());

        config.openai_api_key = "sk-test".to_string();
        config.model = "gpt-test".to_string();
        let llm = LLM::from_config(&config).expect("configured");
        assert_eq!(llm.model(), "gpt-test");
    }
}
