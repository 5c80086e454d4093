//! Error types for mail-digest.
//!
//! One enum per concern. The binary wraps them with `anyhow` context.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while loading raw messages from disk.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Not a parseable message: {path}")]
    Unparseable { path: String },
}

/// LLM provider errors.
///
/// The retry wrapper decides what to do with each variant: see
/// [`LlmError::is_fatal`] and [`LlmError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    /// `after` is the local call deadline when one fired; `None` when the
    /// transport or the server reported the timeout.
    #[error("Provider {provider} timed out{}", timeout_suffix(.after))]
    Timeout {
        provider: String,
        after: Option<Duration>,
    },

    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Empty completion from {provider}")]
    EmptyResponse { provider: String },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Context length exceeded for provider {provider}")]
    ContextLengthExceeded { provider: String },

    #[error("Completion exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<LlmError> },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn timeout_suffix(after: &Option<Duration>) -> String {
    after.map(|d| format!(" after {d:?}")).unwrap_or_default()
}

impl LlmError {
    /// Fatal errors abort the whole message without retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::AuthFailed { .. } => true,
            Self::Exhausted { last, .. } => last.is_fatal(),
            _ => false,
        }
    }

    /// Transient errors and malformed or empty responses are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Unavailable { .. }
                | Self::InvalidResponse { .. }
                | Self::EmptyResponse { .. }
                | Self::Json(_)
        )
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Output store errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Record encoding failed: {0}")]
    Encoding(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Pipeline-related errors. Any of these leaves the message in the Failed state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fatal provider error on chunk {chunk}: {source}")]
    Fatal {
        chunk: usize,
        #[source]
        source: LlmError,
    },

    #[error("Reduce call failed: {0}")]
    ReduceFailed(#[source] LlmError),

    #[error("All {total} chunk summaries failed")]
    NoUsableFragments { total: usize },

    #[error("Invalid summary state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Failed to persist summary after {attempts} attempts: {source}")]
    Sink {
        attempts: u32,
        #[source]
        source: SinkError,
    },
}

impl PipelineError {
    /// Whether the failure came from an authentication problem with the backend.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Fatal { source, .. } => source.is_fatal(),
            Self::ReduceFailed(e) => e.is_fatal(),
            _ => false,
        }
    }
}
