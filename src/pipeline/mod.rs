//! Summarization pipeline.
//!
//! Every message flows through:
//! 1. `email::extract()`: MIME body to plain text
//! 2. `Chunker::chunk()`: token-bounded, ordered chunks
//! 3. `MapReduceSummarizer`: one completion per chunk (concurrent, capped),
//!    then one reduce call over the fragments in chunk order
//! 4. `ResultSink::write()`: one deduplicated record per message
//!
//! `MessageProcessor` ties the steps together and reports per-message outcomes.

pub mod chunker;
pub mod processor;
pub mod prompts;
pub mod summarizer;
pub mod types;

pub use chunker::{CharRatioEstimator, Chunker, TokenEstimator, chunk_text};
pub use processor::{BatchReport, FailedMessage, MessageOutcome, MessageProcessor};
pub use summarizer::MapReduceSummarizer;
pub use types::{
    Chunk, Completeness, FinalSummary, FragmentSet, FragmentStatus, SummaryFragment, SummaryRun,
    SummaryState,
};
