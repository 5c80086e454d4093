//! Configuration types.
//!
//! Everything is read from `DIGEST_*` environment variables. Loading goes
//! through a lookup closure so tests can supply their own variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// Default map system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an email summarizer. Produce a crisp summary (4-6 bullet points) with: \
     • key points • action items • deadlines • links/IDs • sentiment. \
     Keep it under 120 words, neutral tone.";

/// What to do when a record for the same message id already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupeMode {
    /// First write wins, later writes are no-ops.
    #[default]
    SkipIfExists,
    /// Later writes overwrite the stored record.
    Replace,
}

impl std::fmt::Display for DedupeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SkipIfExists => write!(f, "skip-if-exists"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

impl std::str::FromStr for DedupeMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip-if-exists" | "skip" => Ok(Self::SkipIfExists),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown dedupe mode: {other}")),
        }
    }
}

/// Which output store backs the result sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Markdown,
    LibSql,
}

impl SinkKind {
    /// Guess from the output file extension: `.db`/`.sqlite` → libSQL, anything else → markdown.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("db" | "sqlite" | "sqlite3") => Self::LibSql,
            _ => Self::Markdown,
        }
    }
}

impl std::str::FromStr for SinkKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "libsql" | "sqlite" => Ok(Self::LibSql),
            other => Err(format!("unknown sink: {other}")),
        }
    }
}

/// Summarization pipeline configuration.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Upper bound on the estimated tokens of one chunk.
    pub chunk_max_tokens: usize,
    /// Trailing tokens of the previous chunk prepended to each later chunk.
    pub chunk_overlap_tokens: usize,
    /// In-flight completion calls allowed at once (shared across messages).
    pub map_concurrency_limit: usize,
    /// Messages processed concurrently by `process_batch`.
    pub message_concurrency: usize,
    /// Retries after the first attempt of a completion call.
    pub max_retries: u32,
    /// First backoff delay; doubles on every retry.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Per-call timeout applied to every completion invocation.
    pub call_timeout: Duration,
    /// Max output tokens for each map call.
    pub map_max_output_tokens: u32,
    /// Max output tokens for the reduce call.
    pub reduce_max_output_tokens: u32,
    /// Sampling temperature for all calls.
    pub temperature: f32,
    /// System prompt for map calls.
    pub system_prompt: String,
    /// Record dedupe behaviour.
    pub dedupe_mode: DedupeMode,
    /// Output store location.
    pub output_path: PathBuf,
    /// Output store kind.
    pub sink: SinkKind,
    /// Optional link template for the message reference, `{id}` is substituted.
    pub link_template: Option<String>,
    /// Attempts for persisting a record before the message is reported failed.
    pub sink_write_attempts: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        let output_path = PathBuf::from("summaries.md");
        Self {
            chunk_max_tokens: 5000,
            chunk_overlap_tokens: 0,
            map_concurrency_limit: 4,
            message_concurrency: 1,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
            map_max_output_tokens: 400,
            reduce_max_output_tokens: 600,
            temperature: 0.2,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            dedupe_mode: DedupeMode::SkipIfExists,
            sink: SinkKind::for_path(&output_path),
            output_path,
            link_template: None,
            sink_write_attempts: 3,
        }
    }
}

impl SummarizerConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let output_path = lookup("DIGEST_OUTPUT")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_path);
        let sink = match lookup("DIGEST_SINK") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "DIGEST_SINK".into(),
                message,
            })?,
            None => SinkKind::for_path(&output_path),
        };
        let dedupe_mode = match lookup("DIGEST_DEDUPE_MODE") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "DIGEST_DEDUPE_MODE".into(),
                message,
            })?,
            None => defaults.dedupe_mode,
        };

        let config = Self {
            chunk_max_tokens: parse_var(&lookup, "DIGEST_CHUNK_MAX_TOKENS")?
                .unwrap_or(defaults.chunk_max_tokens),
            chunk_overlap_tokens: parse_var(&lookup, "DIGEST_CHUNK_OVERLAP_TOKENS")?
                .unwrap_or(defaults.chunk_overlap_tokens),
            map_concurrency_limit: parse_var(&lookup, "DIGEST_MAP_CONCURRENCY")?
                .unwrap_or(defaults.map_concurrency_limit),
            message_concurrency: parse_var(&lookup, "DIGEST_MESSAGE_CONCURRENCY")?
                .unwrap_or(defaults.message_concurrency),
            max_retries: parse_var(&lookup, "DIGEST_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_base_delay: parse_var(&lookup, "DIGEST_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            call_timeout: parse_var(&lookup, "DIGEST_CALL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_timeout),
            system_prompt: lookup("DIGEST_SYSTEM_PROMPT")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.system_prompt),
            dedupe_mode,
            output_path,
            sink,
            link_template: lookup("DIGEST_LINK_TEMPLATE").filter(|s| !s.trim().is_empty()),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_max_tokens < 16 {
            return Err(invalid("chunk_max_tokens", "must be at least 16"));
        }
        if self.chunk_overlap_tokens >= self.chunk_max_tokens / 2 {
            return Err(invalid(
                "chunk_overlap_tokens",
                "must be less than half of chunk_max_tokens",
            ));
        }
        if self.map_concurrency_limit == 0 {
            return Err(invalid("map_concurrency_limit", "must be at least 1"));
        }
        if self.map_concurrency_limit > Semaphore::MAX_PERMITS {
            return Err(invalid(
                "map_concurrency_limit",
                &format!("must be at most {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.message_concurrency == 0 {
            return Err(invalid("message_concurrency", "must be at least 1"));
        }
        if self.sink_write_attempts == 0 {
            return Err(invalid("sink_write_attempts", "must be at least 1"));
        }
        Ok(())
    }

    /// Render the message reference link for `message_id`, if a template is configured.
    pub fn link_for(&self, message_id: &str) -> Option<String> {
        self.link_template
            .as_ref()
            .map(|t| t.replace("{id}", message_id))
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
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
    fn defaults_without_vars() {
        let config = SummarizerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.chunk_max_tokens, 5000);
        assert_eq!(config.chunk_overlap_tokens, 0);
        assert_eq!(config.dedupe_mode, DedupeMode::SkipIfExists);
        assert_eq!(config.sink, SinkKind::Markdown);
        assert_eq!(config.output_path, PathBuf::from("summaries.md"));
        assert!(config.link_template.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = SummarizerConfig::from_lookup(lookup(&[
            ("DIGEST_CHUNK_MAX_TOKENS", "800"),
            ("DIGEST_CHUNK_OVERLAP_TOKENS", "50"),
            ("DIGEST_MAP_CONCURRENCY", "8"),
            ("DIGEST_MAX_RETRIES", "5"),
            ("DIGEST_RETRY_BASE_MS", "250"),
            ("DIGEST_DEDUPE_MODE", "replace"),
            ("DIGEST_OUTPUT", "out/digests.db"),
        ]))
        .unwrap();
        assert_eq!(config.chunk_max_tokens, 800);
        assert_eq!(config.chunk_overlap_tokens, 50);
        assert_eq!(config.map_concurrency_limit, 8);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.dedupe_mode, DedupeMode::Replace);
        assert_eq!(config.sink, SinkKind::LibSql);
    }

    #[test]
    fn explicit_sink_beats_extension() {
        let config = SummarizerConfig::from_lookup(lookup(&[
            ("DIGEST_OUTPUT", "digests.db"),
            ("DIGEST_SINK", "markdown"),
        ]))
        .unwrap();
        assert_eq!(config.sink, SinkKind::Markdown);
    }

    #[test]
    fn rejects_unparseable_number() {
        let err = SummarizerConfig::from_lookup(lookup(&[("DIGEST_MAX_RETRIES", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("DIGEST_MAX_RETRIES"));
    }

    #[test]
    fn rejects_unknown_dedupe_mode() {
        let err = SummarizerConfig::from_lookup(lookup(&[("DIGEST_DEDUPE_MODE", "append")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_overlap_too_large() {
        let err = SummarizerConfig::from_lookup(lookup(&[
            ("DIGEST_CHUNK_MAX_TOKENS", "100"),
            ("DIGEST_CHUNK_OVERLAP_TOKENS", "60"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("chunk_overlap_tokens"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = SummarizerConfig::from_lookup(lookup(&[("DIGEST_MAP_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("map_concurrency_limit"));
    }

    #[test]
    fn rejects_concurrency_beyond_semaphore_capacity() {
        let max = usize::MAX.to_string();
        let err = SummarizerConfig::from_lookup(lookup(&[("DIGEST_MAP_CONCURRENCY", max.as_str())]))
            .unwrap_err();
        assert!(err.to_string().contains("map_concurrency_limit"));

        let at_cap = SummarizerConfig {
            map_concurrency_limit: Semaphore::MAX_PERMITS,
            ..SummarizerConfig::default()
        };
        assert!(at_cap.validate().is_ok());
    }

    #[test]
    fn dedupe_mode_round_trips_through_display() {
        for mode in [DedupeMode::SkipIfExists, DedupeMode::Replace] {
            assert_eq!(mode.to_string().parse::<DedupeMode>().unwrap(), mode);
        }
    }

    #[test]
    fn link_template_substitutes_id() {
        let config = SummarizerConfig {
            link_template: Some("https://mail.google.com/mail/u/0/#inbox/{id}".into()),
            ..SummarizerConfig::default()
        };
        assert_eq!(
            config.link_for("18c2f").as_deref(),
            Some("https://mail.google.com/mail/u/0/#inbox/18c2f")
        );
    }
}
