//! Shared types for the summarization pipeline.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ── Chunk ───────────────────────────────────────────────────────────

/// A bounded, ordered slice of a message's plain text.
///
/// `span` is a byte range into the source text (always on char
/// boundaries). When overlap is configured, the first `overlap` bytes of
/// `text` repeat the tail of the previous chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub message_id: String,
    /// 0-based, contiguous.
    pub index: usize,
    pub text: String,
    pub span: Range<usize>,
    /// Bytes at the start of `text` carried over from the previous chunk.
    pub overlap: usize,
}

impl Chunk {
    /// The part of this chunk not shared with the previous one.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }

    /// Byte range of `fresh_text` in the source.
    pub fn fresh_span(&self) -> Range<usize> {
        self.span.start + self.overlap..self.span.end
    }
}

// ── Fragments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    Ok,
    Failed,
}

/// Per-chunk partial summary produced by the map stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryFragment {
    pub message_id: String,
    pub chunk_index: usize,
    /// Summary text for `Ok`, the failure reason for `Failed`.
    pub text: String,
    pub status: FragmentStatus,
}

impl SummaryFragment {
    pub fn ok(message_id: &str, chunk_index: usize, text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            chunk_index,
            text: text.into(),
            status: FragmentStatus::Ok,
        }
    }

    pub fn failed(message_id: &str, chunk_index: usize, reason: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            chunk_index,
            text: reason.into(),
            status: FragmentStatus::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FragmentStatus::Ok
    }
}

/// Fragments keyed by chunk index. Iteration is always in document order.
pub type FragmentSet = BTreeMap<usize, SummaryFragment>;

// ── Final summary ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    /// One or more chunks could not be summarized.
    Partial,
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl std::str::FromStr for Completeness {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "partial" => Ok(Self::Partial),
            other => Err(format!("unknown completeness: {other}")),
        }
    }
}

/// Result of the reduce stage for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSummary {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub text: String,
    pub completeness: Completeness,
    /// 0-based indices of chunks with no usable fragment.
    #[serde(default)]
    pub missing_chunks: Vec<usize>,
    /// Total number of chunks the message was split into.
    pub total_chunks: usize,
}

impl FinalSummary {
    pub fn is_partial(&self) -> bool {
        self.completeness == Completeness::Partial
    }
}

// ── Summary state machine ───────────────────────────────────────────

/// Per-message summarization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryState {
    Idle,
    Mapping,
    Reducing,
    Done,
    Failed,
}

impl SummaryState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SummaryState) -> bool {
        use SummaryState::*;

        matches!(
            (self, target),
            (Idle, Mapping) | (Idle, Done) | (Idle, Failed) |
            (Mapping, Reducing) | (Mapping, Failed) |
            (Reducing, Done) | (Reducing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for SummaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Mapping => "mapping",
            Self::Reducing => "reducing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SummaryState,
    pub to: SummaryState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Tracks one message through the summarizer.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRun {
    pub message_id: String,
    pub state: SummaryState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
    /// Completion calls issued (map and reduce, excluding retries).
    pub calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl SummaryRun {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            state: SummaryState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
            calls: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: SummaryState,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(new_state) {
            return Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;
        if new_state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn record_usage(&mut self, input_tokens: u32, output_tokens: u32) {
        self.calls += 1;
        self.input_tokens += u64::from(input_tokens);
        self.output_tokens += u64::from(output_tokens);
    }
}
