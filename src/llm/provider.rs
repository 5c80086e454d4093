//! The completion capability the pipeline depends on.

use async_trait::async_trait;

use crate::error::LlmError;

/// A single prompt → text request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            max_output_tokens: 512,
            temperature: 0.2,
        }
    }

    pub fn with_max_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Completion text plus token accounting when the backend reports it.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Turns a prompt into text. Backends (hosted API, local inference server)
/// and decorators (retry) all implement this.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Backend identifier, used in errors and logs.
    fn name(&self) -> &str;

    /// Model identifier.
    fn model_name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_sets_fields() {
        let req = CompletionRequest::new("sys", "user")
            .with_max_tokens(64)
            .with_temperature(0.7);
        assert_eq!(req.system_prompt, "sys");
        assert_eq!(req.user_prompt, "user");
        assert_eq!(req.max_output_tokens, 64);
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
    }
}
