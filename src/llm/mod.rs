//! LLM integration for mail-digest.
//!
//! Supports:
//! - **OpenAI**: chat completions API (or any compatible endpoint)
//! - **Ollama**: local `/api/generate`
//! - **Anthropic**: Messages API
//!
//! Every backend speaks plain HTTP through reqwest so that status codes can
//! be classified into retryable and fatal errors. `RetryingProvider` wraps a
//! backend with per-call timeouts and exponential backoff.

mod anthropic;
mod http;
mod ollama;
mod openai;
pub mod provider;
pub mod retry;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use provider::*;
pub use retry::{RetryPolicy, RetryingProvider};

use std::sync::Arc;

use secrecy::SecretString;

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmBackend {
    #[default]
    OpenAi,
    Ollama,
    Anthropic,
}

impl LlmBackend {
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Ollama => "llama3.1",
            Self::Anthropic => "claude-sonnet-4-20250514",
        }
    }

    /// Environment variable holding the API key, if the backend needs one.
    pub fn default_key_env(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Ollama => None,
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Ollama => write!(f, "ollama"),
            Self::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for LlmBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" | "local" => Ok(Self::Ollama),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown LLM backend: {other}")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub model: String,
    /// Override for the backend base URL.
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read `DIGEST_LLM_BACKEND`, `DIGEST_MODEL`, `DIGEST_LLM_ENDPOINT` and
    /// the API key variable named by `DIGEST_API_KEY_ENV`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("DIGEST_LLM_BACKEND") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "DIGEST_LLM_BACKEND".into(),
                message,
            })?,
            None => LlmBackend::default(),
        };
        let model = lookup("DIGEST_MODEL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| backend.default_model().to_string());
        let endpoint = lookup("DIGEST_LLM_ENDPOINT").filter(|s| !s.trim().is_empty());

        let key_env = lookup("DIGEST_API_KEY_ENV")
            .or_else(|| backend.default_key_env().map(str::to_string));
        let api_key = match key_env {
            Some(var) => {
                let value = lookup(&var)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or(ConfigError::MissingEnvVar(var))?;
                Some(SecretString::from(value))
            }
            None => None,
        };

        Ok(Self {
            backend,
            model,
            endpoint,
            api_key,
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>, LlmError> {
    let provider: Arc<dyn CompletionProvider> = match config.backend {
        LlmBackend::OpenAi => Arc::new(OpenAiProvider::new(
            require_key(config)?,
            &config.model,
            config.endpoint.clone(),
        )),
        LlmBackend::Ollama => Arc::new(OllamaProvider::new(&config.model, config.endpoint.clone())),
        LlmBackend::Anthropic => Arc::new(AnthropicProvider::new(
            require_key(config)?,
            &config.model,
            config.endpoint.clone(),
        )),
    };
    tracing::info!("Using {} (model: {})", config.backend, config.model);
    Ok(provider)
}

fn require_key(config: &LlmConfig) -> Result<SecretString, LlmError> {
    config.api_key.clone().ok_or_else(|| LlmError::AuthFailed {
        provider: config.backend.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn openai_is_default_and_needs_key() {
        let err = LlmConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "OPENAI_API_KEY"));

        let config = LlmConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.backend, LlmBackend::OpenAi);
        assert_eq!(config.model, "gpt-4o-mini");
        assert!(config.api_key.is_some());
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = LlmConfig::from_lookup(lookup(&[
            ("DIGEST_LLM_BACKEND", "ollama"),
            ("DIGEST_MODEL", "mistral"),
        ]))
        .unwrap();
        assert_eq!(config.backend, LlmBackend::Ollama);
        assert_eq!(config.model, "mistral");
        assert!(config.api_key.is_none());

        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.model_name(), "mistral");
    }

    #[test]
    fn custom_key_variable() {
        let config = LlmConfig::from_lookup(lookup(&[
            ("DIGEST_LLM_BACKEND", "anthropic"),
            ("DIGEST_API_KEY_ENV", "MY_KEY"),
            ("MY_KEY", "secret"),
        ]))
        .unwrap();
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.model_name(), "claude-sonnet-4-20250514");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = LlmConfig::from_lookup(lookup(&[("DIGEST_LLM_BACKEND", "palm")])).unwrap_err();
        assert!(err.to_string().contains("DIGEST_LLM_BACKEND"));
    }

    #[test]
    fn keyed_backend_without_key_fails_to_construct() {
        let config = LlmConfig {
            backend: LlmBackend::OpenAi,
            model: "gpt-4o".into(),
            endpoint: None,
            api_key: None,
        };
        assert!(matches!(
            create_provider(&config),
            Err(LlmError::AuthFailed { .. })
        ));
    }
}
