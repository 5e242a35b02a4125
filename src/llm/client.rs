//! Completion-client interface and a static test double.
//!
//! The real provider clients are out of scope for this crate (see the
//! purpose statement); this module supplies just enough surface to drive
//! and test the Executor end-to-end.

use async_trait::async_trait;

use super::types::{CompletionRequest, CompletionResponse, TokenUsage};

pub type Result<T> = std::result::Result<T, String>;

/// Trait implemented by the host's LLM provider client.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn create_completion(
        &self,
        provider_hint: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse>;
}

/// A deterministic completion client for tests and examples: always
/// returns a canned response sized from the request's message content.
pub struct StaticCompletionClient {
    pub fixed_response: String,
    pub usd_cost_per_call: f64,
}

impl StaticCompletionClient {
    pub fn new(fixed_response: impl Into<String>) -> Self {
        Self { fixed_response: fixed_response.into(), usd_cost_per_call: 0.001 }
    }
}

#[async_trait]
impl CompletionClient for StaticCompletionClient {
    async fn create_completion(
        &self,
        _provider_hint: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let prompt_tokens: u64 = request
            .messages
            .iter()
            .map(|m| (m.content.len() as u64).div_ceil(4))
            .sum();
        let completion_tokens = (self.fixed_response.len() as u64).div_ceil(4);
        Ok(CompletionResponse {
            model: request.model,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            usd_cost: self.usd_cost_per_call,
            choices: vec![self.fixed_response.clone()],
        })
    }
}
