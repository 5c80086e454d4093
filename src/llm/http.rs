//! Shared HTTP plumbing for the reqwest-based backends.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::error::LlmError;

/// Longest error body excerpt kept in an error message.
const BODY_EXCERPT_CHARS: usize = 300;

/// Map a transport-level reqwest failure into the provider error taxonomy.
pub(crate) fn map_send_error(provider: &str, err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout {
            provider: provider.to_string(),
            after: None,
        }
    } else if err.is_connect() || err.is_request() {
        LlmError::Unavailable {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn classify_status(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> LlmError {
    let provider = provider.to_string();
    let excerpt: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
    match status.as_u16() {
        401 | 403 => LlmError::AuthFailed { provider },
        429 => LlmError::RateLimited {
            provider,
            retry_after: parse_retry_after(headers),
        },
        408 | 504 => LlmError::Timeout {
            provider,
            after: None,
        },
        500..=599 => LlmError::Unavailable {
            provider,
            reason: format!("{status}: {excerpt}"),
        },
        400 | 413 if mentions_context_length(body) => LlmError::ContextLengthExceeded { provider },
        _ => LlmError::RequestFailed {
            provider,
            reason: format!("{status}: {excerpt}"),
        },
    }
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn mentions_context_length(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length") || lower.contains("context length") || lower.contains("too long")
}

/// Send a prepared request and decode a JSON success body.
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, LlmError> {
    let resp = request
        .send()
        .await
        .map_err(|e| map_send_error(provider, e))?;

    let status = resp.status();
    if !status.is_success() {
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(provider, status = %status, "Completion request rejected");
        return Err(classify_status(provider, status, &headers, &body));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| map_send_error(provider, e))?;
    serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("undecodable body: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn classify(code: u16, body: &str) -> LlmError {
        classify_status(
            "test",
            StatusCode::from_u16(code).unwrap(),
            &HeaderMap::new(),
            body,
        )
    }

    #[test]
    fn auth_statuses() {
        assert!(matches!(classify(401, ""), LlmError::AuthFailed { .. }));
        assert!(matches!(classify(403, ""), LlmError::AuthFailed { .. }));
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let err = classify_status("test", StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503, 529] {
            let err = classify(code, "overloaded");
            assert!(matches!(err, LlmError::Unavailable { .. }), "{code}");
            assert!(err.is_retryable());
        }
        assert!(matches!(
            classify(504, ""),
            LlmError::Timeout { after: None, .. }
        ));
    }

    #[test]
    fn gateway_timeout_message_has_no_bogus_duration() {
        let message = classify(408, "").to_string();
        assert_eq!(message, "Provider test timed out");
        assert!(!message.contains("0ns"));
    }

    #[test]
    fn bad_request_is_terminal() {
        let err = classify(400, "{\"error\":\"bad field\"}");
        assert!(matches!(err, LlmError::RequestFailed { .. }));
        assert!(!err.is_retryable());
        assert!(matches!(
            classify(400, "maximum context length is 8192 tokens"),
            LlmError::ContextLengthExceeded { .. }
        ));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(5000);
        let LlmError::RequestFailed { reason, .. } = classify(422, &body) else {
            panic!("expected RequestFailed");
        };
        assert!(reason.len() < 400);
    }
}
