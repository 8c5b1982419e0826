//! Narration rewriting through an `edgequake-llm` provider.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids a thundering herd: with 500 ms base and 3 retries the wait sequence
//! is 500 ms → 1 s → 2 s. The per-segment timeout of the rewriting stage
//! bounds the whole sequence.

use super::TextRewriter;
use crate::error::ServiceError;
use crate::pipeline::postprocess::clean_narration;
use crate::prompts::{rewrite_request, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Default model when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// [`TextRewriter`] backed by a chat-completion provider.
pub struct LlmRewriter {
    provider: Arc<dyn LLMProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmRewriter {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 0.3,
            max_tokens: 2000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }

    /// Resolve a provider, from most-specific to least-specific.
    ///
    /// 1. **Named provider + model**: e.g. `"openai"` and an optional model;
    ///    [`ProviderFactory::create_llm_provider`] reads the API key from the
    ///    environment.
    /// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
    ///    so the model choice is honoured even when several API keys exist.
    /// 3. **`OPENAI_API_KEY`** present: OpenAI with `model` or the default.
    /// 4. **Full auto-detection** ([`ProviderFactory::from_env`]).
    ///
    /// A caller holding a ready provider uses [`LlmRewriter::new`] instead.
    pub fn from_env(provider_name: Option<&str>, model: Option<&str>) -> Result<Self, ServiceError> {
        if let Some(name) = provider_name {
            return create_provider(name, model.unwrap_or(DEFAULT_MODEL)).map(Self::new);
        }

        if let (Ok(prov), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !env_model.is_empty() {
                return create_provider(&prov, &env_model).map(Self::new);
            }
        }

        if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
            if !openai_key.is_empty() {
                return create_provider("openai", model.unwrap_or(DEFAULT_MODEL)).map(Self::new);
            }
        }

        let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
            ServiceError::Unavailable(format!(
                "No LLM provider could be auto-detected from environment. \
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider. Error: {e}"
            ))
        })?;
        Ok(Self::new(llm_provider))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }
}

fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ServiceError> {
    ProviderFactory::create_llm_provider(provider_name, model)
        .map_err(|e| ServiceError::Unavailable(format!("provider '{provider_name}': {e}")))
}

#[async_trait]
impl TextRewriter for LlmRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, ServiceError> {
        let start = Instant::now();
        let messages = vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user(rewrite_request(text).as_str()),
        ];
        let options = build_options(self.temperature, self.max_tokens);
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!("Rewrite: retry {}/{} after {}ms", attempt, self.max_retries, backoff);
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Rewrite: {} input tokens, {} output tokens, {:?}",
                        response.prompt_tokens,
                        response.completion_tokens,
                        start.elapsed()
                    );
                    let cleaned = clean_narration(&response.content);
                    if cleaned.is_empty() {
                        last_err = Some("model returned an empty rewrite".to_string());
                        warn!("Rewrite: attempt {} returned nothing usable", attempt + 1);
                        continue;
                    }
                    return Ok(cleaned);
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    warn!("Rewrite: attempt {} failed: {}", attempt + 1, err_msg);
                    last_err = Some(err_msg);
                }
            }
        }

        Err(ServiceError::Failed(
            last_err.unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_narration_defaults() {
        let opts = build_options(0.3, 2000);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(2000));
    }
}
