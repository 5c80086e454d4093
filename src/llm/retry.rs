//! Retry/backoff decorator around any `CompletionProvider`.
//!
//! - Rate limits, timeouts, unavailability, malformed or empty responses →
//!   retried with exponential backoff, up to `max_retries` retries.
//! - Authentication failures → returned immediately.
//! - Other request errors → returned immediately.
//!
//! Every attempt runs under the per-call timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::SummarizerConfig;
use crate::error::LlmError;
use crate::llm::provider::{CompletionProvider, CompletionRequest, CompletionResponse};

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SummarizerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            call_timeout: config.call_timeout,
            jitter: true,
        }
    }

    /// Delay before retry number `retry` (1-based), honouring a server hint.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
        let delay = hint.map_or(exp, |h| h.max(exp)).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            delay + Duration::from_millis(extra_ms)
        } else {
            delay
        }
    }
}

/// Decorator that adds timeouts and retries to an inner provider.
pub struct RetryingProvider {
    inner: Arc<dyn CompletionProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn CompletionProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let response = tokio::time::timeout(self.policy.call_timeout, self.inner.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.inner.name().to_string(),
                after: Some(self.policy.call_timeout),
            })??;

        if response.content.trim().is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: self.inner.name().to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut retry = 0;
        loop {
            let error = match self.attempt(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if error.is_fatal() || !error.is_retryable() {
                debug!(provider = self.name(), error = %error, "Completion failed without retry");
                return Err(error);
            }
            if retry >= self.policy.max_retries {
                warn!(
                    provider = self.name(),
                    attempts = retry + 1,
                    error = %error,
                    "Completion retries exhausted"
                );
                return Err(LlmError::Exhausted {
                    attempts: retry + 1,
                    last: Box::new(error),
                });
            }

            retry += 1;
            let delay = self.policy.delay_for(retry, error.retry_after());
            warn!(
                provider = self.name(),
                retry,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying completion"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
