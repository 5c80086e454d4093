//! Markdown file sink.
//!
//! The document is a `# Email Summaries` heading followed by one block per
//! message. Each block starts with an HTML comment carrying the message id
//! and bookkeeping as JSON, which keeps the file readable while letting the
//! sink find, skip or replace records by id.
//!
//! Every write rewrites the document into a temporary file in the same
//! directory and renames it over the original, so readers see either the
//! old or the new document, never a partial one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::DedupeMode;
use crate::error::SinkError;
use crate::pipeline::types::Completeness;
use crate::store::traits::{OutputRecord, ResultSink, WriteStatus};

pub const DOCUMENT_HEADING: &str = "# Email Summaries";
const MARKER_PREFIX: &str = "<!-- digest: ";
const MARKER_SUFFIX: &str = " -->";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockMeta {
    id: String,
    completeness: Completeness,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    missing: Vec<usize>,
    written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Block {
    meta: BlockMeta,
    /// Rendered markdown, ending with a single newline.
    rendered: String,
}

impl Block {
    fn from_record(record: &OutputRecord) -> Self {
        Self {
            meta: BlockMeta {
                id: record.message_id.clone(),
                completeness: record.completeness,
                missing: record.missing_chunks.clone(),
                written_at: record.written_at,
            },
            rendered: escape_markers(&record.render_markdown()),
        }
    }
}

pub struct MarkdownSink {
    path: PathBuf,
    mode: DedupeMode,
    lock: Mutex<()>,
}

impl MarkdownSink {
    /// Prepare a sink at `path`. The file is created on first write.
    pub async fn open(path: impl Into<PathBuf>, mode: DedupeMode) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        info!(path = %path.display(), mode = %mode, "Markdown sink ready");
        Ok(Self {
            path,
            mode,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_blocks(&self) -> Result<Vec<Block>, SinkError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(parse_document(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    async fn write_blocks(&self, blocks: &[Block]) -> Result<(), SinkError> {
        let document = render_document(blocks)?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("summaries.md");
        let tmp = self.path.with_file_name(format!(".{file_name}.tmp"));

        tokio::fs::write(&tmp, document)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MarkdownSink {
    fn name(&self) -> &str {
        "markdown"
    }

    fn dedupe_mode(&self) -> DedupeMode {
        self.mode
    }

    async fn store(&self, record: &OutputRecord) -> Result<WriteStatus, SinkError> {
        let _guard = self.lock.lock().await;
        let mut blocks = self.read_blocks().await?;

        let existing = blocks.iter().position(|b| b.meta.id == record.message_id);
        let status = match (existing, self.mode) {
            (Some(_), DedupeMode::SkipIfExists) => {
                debug!(id = %record.message_id, "Record exists, skipping");
                return Ok(WriteStatus::Skipped);
            }
            (Some(pos), DedupeMode::Replace) => {
                blocks[pos] = Block::from_record(record);
                WriteStatus::Replaced
            }
            (None, _) => {
                blocks.push(Block::from_record(record));
                WriteStatus::Written
            }
        };

        self.write_blocks(&blocks).await?;
        debug!(id = %record.message_id, status = %status, path = %self.path.display(), "Record stored");
        Ok(status)
    }

    async fn get(&self, message_id: &str) -> Result<Option<OutputRecord>, SinkError> {
        let _guard = self.lock.lock().await;
        let blocks = self.read_blocks().await?;
        Ok(blocks
            .iter()
            .find(|b| b.meta.id == message_id)
            .map(parse_record))
    }

    async fn count(&self) -> Result<usize, SinkError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_blocks().await?.len())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn render_document(blocks: &[Block]) -> Result<String, SinkError> {
    let mut out = format!("{DOCUMENT_HEADING}\n\n");
    for block in blocks {
        let meta = serde_json::to_string(&block.meta)
            .map_err(|e| SinkError::Encoding(e.to_string()))?;
        out.push_str(MARKER_PREFIX);
        out.push_str(&meta);
        out.push_str(MARKER_SUFFIX);
        out.push('\n');
        out.push_str(&block.rendered);
        out.push('\n');
    }
    Ok(out)
}

/// A line that would read as a block marker once leading backslashes are removed.
fn looks_like_marker(line: &str) -> bool {
    line.trim_start_matches('\\').starts_with(MARKER_PREFIX)
}

/// Prefix marker-like lines with a backslash so record text can never open a block.
fn escape_markers(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    for line in rendered.split_inclusive('\n') {
        if looks_like_marker(line) {
            out.push('\\');
        }
        out.push_str(line);
    }
    out
}

fn unescape_marker(line: &str) -> &str {
    if looks_like_marker(line) {
        line.strip_prefix('\\').unwrap_or(line)
    } else {
        line
    }
}

fn parse_marker(line: &str) -> Option<BlockMeta> {
    let json = line.strip_prefix(MARKER_PREFIX)?.strip_suffix(MARKER_SUFFIX)?;
    serde_json::from_str(json).ok()
}

/// Split a document into blocks. Text before the first marker is dropped.
fn parse_document(content: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    for line in content.lines() {
        if let Some(meta) = parse_marker(line.trim_end()) {
            blocks.push(Block {
                meta,
                rendered: String::new(),
            });
        } else if let Some(block) = blocks.last_mut() {
            block.rendered.push_str(line);
            block.rendered.push('\n');
        }
    }
    for block in &mut blocks {
        let trimmed_len = block.rendered.trim_end().len();
        block.rendered.truncate(trimmed_len);
        block.rendered.push('\n');
    }
    blocks
}

/// Rebuild a record from its rendered block.
fn parse_record(block: &Block) -> OutputRecord {
    let mut record = OutputRecord {
        message_id: block.meta.id.clone(),
        subject: String::new(),
        sender: String::new(),
        date: String::new(),
        link: None,
        body: String::new(),
        completeness: block.meta.completeness,
        missing_chunks: block.meta.missing.clone(),
        written_at: block.meta.written_at,
    };

    let mut lines = block.rendered.lines().map(unescape_marker).peekable();
    while let Some(line) = lines.next_if(|l| !l.is_empty()) {
        if let Some(subject) = line.strip_prefix("### ") {
            record.subject = subject.to_string();
        } else if let Some(sender) = line.strip_prefix("- **From:** ") {
            record.sender = sender.to_string();
        } else if let Some(date) = line.strip_prefix("- **Date:** ") {
            record.date = date.to_string();
        } else if let Some(link) = line.strip_prefix("- **Link:** ") {
            record.link = Some(link.to_string());
        }
    }

    let body: Vec<&str> = lines.collect();
    let body = body.join("\n");
    let body = body.trim_end();
    record.body = body
        .strip_suffix("---")
        .unwrap_or(body)
        .trim()
        .to_string();
    record
}
