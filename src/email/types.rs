//! Email record types.

use std::sync::Arc;

use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};

/// An inbound message as handed over by the mail collaborator.
///
/// Read-only inside the pipeline. The raw payload is shared so cloning a
/// record for a spawned task is cheap.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Opaque unique id (provider id or Message-ID).
    pub id: String,
    /// Subject line, empty if missing.
    pub subject: String,
    /// Sender as displayed (`Name <addr>` or bare address).
    pub sender: String,
    /// Date header as sent, empty if missing.
    pub date: String,
    /// Raw RFC 5322 / MIME bytes.
    pub raw: Arc<[u8]>,
}

impl EmailMessage {
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        sender: impl Into<String>,
        date: impl Into<String>,
        raw: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            sender: sender.into(),
            date: date.into(),
            raw: raw.into(),
        }
    }

    /// Build a record from raw MIME bytes, reading subject/from/date/Message-ID
    /// from the headers. `fallback_id` is used when there is no Message-ID.
    pub fn from_raw(fallback_id: &str, raw: Vec<u8>) -> Option<Self> {
        let parsed = MessageParser::default().parse(&raw)?;

        let id = parsed
            .message_id()
            .map(|s| s.trim_matches(|c| c == '<' || c == '>').to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fallback_id.to_string());
        let subject = parsed.subject().unwrap_or_default().to_string();
        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .map(|a| match (a.name(), a.address()) {
                (Some(name), Some(address)) => format!("{name} <{address}>"),
                (None, Some(address)) => address.to_string(),
                (Some(name), None) => name.to_string(),
                (None, None) => String::new(),
            })
            .unwrap_or_default();
        let date = parsed.date().map(|d| d.to_rfc3339()).unwrap_or_default();

        drop(parsed);
        Some(Self::new(id, subject, sender, date, raw))
    }
}

/// Plain text recovered from a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlainText {
    pub text: String,
    /// True when the text came from stripping an HTML part.
    pub from_html: bool,
}

impl PlainText {
    pub fn new(text: impl Into<String>, from_html: bool) -> Self {
        Self {
            text: text.into(),
            from_html,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// No summarizable content.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}
