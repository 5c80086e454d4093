//! `ResultSink` trait and the persisted record format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DedupeMode;
use crate::error::SinkError;
use crate::pipeline::types::{Completeness, FinalSummary};

pub const NO_SUBJECT: &str = "(no subject)";
pub const UNKNOWN_SENDER: &str = "(unknown sender)";

/// Extra fields that accompany a summary into the store.
#[derive(Debug, Clone, Default)]
pub struct RecordMetadata {
    /// Link to the message in the mail client, if known.
    pub link: Option<String>,
}

/// The persisted form of a `FinalSummary`, keyed by message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub link: Option<String>,
    pub body: String,
    pub completeness: Completeness,
    pub missing_chunks: Vec<usize>,
    pub written_at: DateTime<Utc>,
}

impl OutputRecord {
    pub fn from_summary(summary: &FinalSummary, metadata: &RecordMetadata) -> Self {
        Self {
            message_id: summary.message_id.clone(),
            subject: or_placeholder(&summary.subject, NO_SUBJECT),
            sender: or_placeholder(&summary.sender, UNKNOWN_SENDER),
            date: summary.date.trim().to_string(),
            link: metadata.link.clone(),
            body: summary.text.trim().to_string(),
            completeness: summary.completeness,
            missing_chunks: summary.missing_chunks.clone(),
            written_at: Utc::now(),
        }
    }

    /// Markdown block: subject, sender, date, message reference, body.
    pub fn render_markdown(&self) -> String {
        let mut out = format!(
            "### {}\n- **From:** {}\n- **Date:** {}\n- **Message ID:** {}\n",
            self.subject, self.sender, self.date, self.message_id
        );
        if let Some(link) = &self.link {
            out.push_str(&format!("- **Link:** {link}\n"));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push_str("\n\n---\n");
        out
    }
}

fn or_placeholder(value: &str, placeholder: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        placeholder.to_string()
    } else {
        trimmed.to_string()
    }
}

/// What a write did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// New record appended.
    Written,
    /// Existing record overwritten (`replace` mode).
    Replaced,
    /// Existing record kept (`skip-if-exists` mode).
    Skipped,
}

impl std::fmt::Display for WriteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Written => "written",
            Self::Replaced => "replaced",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Persistent, deduplicated output store.
///
/// Implementations make the existence check and the write a single atomic
/// step per message id, and never expose a half-written store to readers.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn dedupe_mode(&self) -> DedupeMode;

    /// Store `record` according to the dedupe mode.
    async fn store(&self, record: &OutputRecord) -> Result<WriteStatus, SinkError>;

    /// Look up the stored record for `message_id`.
    async fn get(&self, message_id: &str) -> Result<Option<OutputRecord>, SinkError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, SinkError>;

    async fn exists(&self, message_id: &str) -> Result<bool, SinkError> {
        Ok(self.get(message_id).await?.is_some())
    }

    /// Format `summary` into a record and store it.
    async fn write(
        &self,
        summary: &FinalSummary,
        metadata: &RecordMetadata,
    ) -> Result<(OutputRecord, WriteStatus), SinkError> {
        let record = OutputRecord::from_summary(summary, metadata);
        let status = self.store(&record).await?;
        Ok((record, status))
    }
}
