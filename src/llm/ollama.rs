//! Local Ollama backend (`/api/generate`, non-streaming).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::http::send_json;
use crate::llm::provider::{CompletionProvider, CompletionRequest, CompletionResponse};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(model: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = GenerateRequest {
            model: &self.model,
            system: &request.system_prompt,
            prompt: &request.user_prompt,
            stream: false,
            options: GenerateOptions {
                temperature: request.temperature,
                num_predict: request.max_output_tokens,
            },
        };

        let http = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body);
        let parsed: GenerateResponse = send_json(self.name(), http).await?;

        Ok(CompletionResponse {
            content: parsed.response.trim().to_string(),
            input_tokens: parsed.prompt_eval_count,
            output_tokens: parsed.eval_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint() {
        let p = OllamaProvider::new("llama3.1", None);
        assert_eq!(p.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn request_is_not_streaming() {
        let body = GenerateRequest {
            model: "llama3.1",
            system: "sys",
            prompt: "hello",
            stream: false,
            options: GenerateOptions {
                temperature: 0.2,
                num_predict: 100,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 100);
    }

    #[test]
    fn parses_generate_response() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"model":"llama3.1","response":" ok ","done":true}"#).unwrap();
        assert_eq!(parsed.response, " ok ");
        assert_eq!(parsed.eval_count, 0);
    }
}
