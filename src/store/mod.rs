//! Persistence layer: deduplicated output stores for finished summaries.

pub mod libsql_backend;
pub mod markdown;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlSink;
pub use markdown::MarkdownSink;
pub use traits::{OutputRecord, RecordMetadata, ResultSink, WriteStatus};

use std::sync::Arc;

use crate::config::{SinkKind, SummarizerConfig};
use crate::error::SinkError;

/// Open the sink selected by configuration.
pub async fn open_sink(config: &SummarizerConfig) -> Result<Arc<dyn ResultSink>, SinkError> {
    let sink: Arc<dyn ResultSink> = match config.sink {
        SinkKind::Markdown => {
            Arc::new(MarkdownSink::open(&config.output_path, config.dedupe_mode).await?)
        }
        SinkKind::LibSql => {
            Arc::new(LibSqlSink::new_local(&config.output_path, config.dedupe_mode).await?)
        }
    };
    Ok(sink)
}
