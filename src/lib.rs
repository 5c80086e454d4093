//! Mail Digest: map-reduce email summarization.

pub mod config;
pub mod email;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod store;

pub use config::{DedupeMode, SinkKind, SummarizerConfig};
pub use error::{LlmError, PipelineError, SinkError};
pub use pipeline::{BatchReport, MessageOutcome, MessageProcessor};
