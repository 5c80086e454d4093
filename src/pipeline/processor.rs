//! Message processor: drives one message (or a batch) from raw MIME to a
//! stored record.
//!
//! Flow per message:
//! 1. `extract()` → plain text (warnings are logged, never fatal)
//! 2. `Chunker::chunk()` → bounded chunks
//! 3. `MapReduceSummarizer::summarize()` → `FinalSummary`
//! 4. `ResultSink::write()` → one record, retried on sink errors
//!
//! A message counts as Done only once its record is written.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::config::SummarizerConfig;
use crate::email::{EmailMessage, extract};
use crate::error::PipelineError;
use crate::llm::CompletionProvider;
use crate::pipeline::chunker::Chunker;
use crate::pipeline::summarizer::MapReduceSummarizer;
use crate::pipeline::types::{Completeness, FinalSummary, SummaryRun, SummaryState};
use crate::store::{OutputRecord, RecordMetadata, ResultSink, WriteStatus};

/// Body of the record written for a message with no readable text.
pub const NO_READABLE_CONTENT: &str = "(no readable content)";

/// First delay between sink write attempts; doubles per attempt.
const SINK_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Result of processing one message.
#[derive(Debug)]
pub enum MessageOutcome {
    /// Summary produced and persisted (or deliberately skipped by dedupe).
    Done {
        record: OutputRecord,
        status: WriteStatus,
        run: SummaryRun,
    },
    /// No record was written. Safe to re-queue.
    Failed {
        message_id: String,
        error: PipelineError,
        run: SummaryRun,
    },
}

impl MessageOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Done { record, .. } => &record.message_id,
            Self::Failed { message_id, .. } => message_id,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// A message that ended without a record.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub message_id: String,
    pub error: String,
    /// The backend rejected our credentials.
    pub auth: bool,
}

/// Tally of a batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub written: usize,
    pub replaced: usize,
    pub skipped: usize,
    /// Done messages whose summary is missing some chunks.
    pub partial: usize,
    pub failures: Vec<FailedMessage>,
}

impl BatchReport {
    /// Messages that reached Done.
    pub fn done(&self) -> usize {
        self.written + self.replaced + self.skipped
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.message_id.as_str()).collect()
    }

    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Done { record, status, .. } => {
                match status {
                    WriteStatus::Written => self.written += 1,
                    WriteStatus::Replaced => self.replaced += 1,
                    WriteStatus::Skipped => self.skipped += 1,
                }
                if record.completeness == Completeness::Partial {
                    self.partial += 1;
                }
            }
            MessageOutcome::Failed {
                message_id, error, ..
            } => self.failures.push(FailedMessage {
                message_id: message_id.clone(),
                error: error.to_string(),
                auth: error.is_auth(),
            }),
        }
    }
}

/// Runs messages through extraction, chunking, summarization and storage.
///
/// All messages share one summarizer, so `map_concurrency_limit` caps
/// in-flight completion calls across the whole batch.
pub struct MessageProcessor {
    summarizer: MapReduceSummarizer,
    chunker: Chunker,
    sink: Arc<dyn ResultSink>,
    config: SummarizerConfig,
    sink_retry_delay: Duration,
}

impl MessageProcessor {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        sink: Arc<dyn ResultSink>,
        config: SummarizerConfig,
    ) -> Self {
        Self {
            summarizer: MapReduceSummarizer::new(provider, &config),
            chunker: Chunker::from_config(&config),
            sink,
            config,
            sink_retry_delay: SINK_RETRY_BASE_DELAY,
        }
    }

    /// Replace the chunker (e.g. to plug in a different token estimator).
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_sink_retry_delay(mut self, delay: Duration) -> Self {
        self.sink_retry_delay = delay;
        self
    }

    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.sink
    }

    /// Process a single message through the full pipeline.
    pub async fn process(&self, message: &EmailMessage) -> MessageOutcome {
        info!(id = %message.id, sender = %message.sender, "Processing message");
        let mut run = SummaryRun::new(&message.id);

        let summary = match self.summarize(message, &mut run).await {
            Ok(summary) => summary,
            Err(error) => {
                error!(id = %message.id, error = %error, "Message failed");
                return MessageOutcome::Failed {
                    message_id: message.id.clone(),
                    error,
                    run,
                };
            }
        };

        let metadata = RecordMetadata {
            link: self.config.link_for(&message.id),
        };
        match self.write_with_retry(&summary, &metadata).await {
            Ok((record, status)) => {
                info!(
                    id = %message.id,
                    status = %status,
                    completeness = %record.completeness,
                    calls = run.calls,
                    "Message done"
                );
                MessageOutcome::Done {
                    record,
                    status,
                    run,
                }
            }
            Err(error) => {
                error!(id = %message.id, error = %error, "Summary could not be stored");
                MessageOutcome::Failed {
                    message_id: message.id.clone(),
                    error,
                    run,
                }
            }
        }
    }

    /// Process messages concurrently (`message_concurrency` at a time).
    ///
    /// Failures on individual messages are reported, never propagated.
    pub async fn process_batch(&self, messages: &[EmailMessage]) -> BatchReport {
        let count = messages.len();
        info!(count, "Processing message batch");

        let outcomes: Vec<MessageOutcome> = futures::stream::iter(messages)
            .map(|message| self.process(message))
            .buffer_unordered(self.config.message_concurrency)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for outcome in &outcomes {
            report.record(outcome);
        }

        info!(
            done = report.done(),
            failed = report.failed(),
            total = count,
            "Batch processing complete"
        );
        report
    }

    async fn summarize(
        &self,
        message: &EmailMessage,
        run: &mut SummaryRun,
    ) -> Result<FinalSummary, PipelineError> {
        let (plain, warning) = extract(&message.raw);
        if let Some(warning) = warning {
            warn!(id = %message.id, warning = %warning, "Extraction warning, continuing with empty text");
        }

        if plain.is_blank() {
            debug!(id = %message.id, "No readable content, skipping completion calls");
            run.transition_to(SummaryState::Done, Some(NO_READABLE_CONTENT.to_string()))?;
            return Ok(FinalSummary {
                message_id: message.id.clone(),
                subject: message.subject.clone(),
                sender: message.sender.clone(),
                date: message.date.clone(),
                text: NO_READABLE_CONTENT.to_string(),
                completeness: Completeness::Complete,
                missing_chunks: Vec::new(),
                total_chunks: 0,
            });
        }

        let chunks = self.chunker.chunk(&message.id, &plain.text);
        debug!(
            id = %message.id,
            chunks = chunks.len(),
            from_html = plain.from_html,
            "Message chunked"
        );
        self.summarizer.summarize(message, &chunks, run).await
    }

    async fn write_with_retry(
        &self,
        summary: &FinalSummary,
        metadata: &RecordMetadata,
    ) -> Result<(OutputRecord, WriteStatus), PipelineError> {
        let attempts = self.config.sink_write_attempts.max(1);
        let mut delay = self.sink_retry_delay;
        let mut attempt = 1;
        loop {
            match self.sink.write(summary, metadata).await {
                Ok(written) => return Ok(written),
                Err(source) if attempt >= attempts => {
                    return Err(PipelineError::Sink { attempts, source });
                }
                Err(e) => {
                    warn!(
                        id = %summary.message_id,
                        sink = self.sink.name(),
                        attempt,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::DedupeMode;
    use crate::error::{LlmError, SinkError};
    use crate::llm::{CompletionRequest, CompletionResponse};
    use crate::store::MarkdownSink;

    /// Answers every call with a fixed text, or fails auth.
    struct StubLlm {
        auth_fails: bool,
        calls: AtomicU32,
    }

    impl StubLlm {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                auth_fails: false,
                calls: AtomicU32::new(0),
            })
        }

        fn unauthorized() -> Arc<Self> {
            Arc::new(Self {
                auth_fails: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for StubLlm {
        fn name(&self) -> &str {
            "stub"
        }
        fn model_name(&self) -> &str {
            "stub-1"
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.auth_fails {
                return Err(LlmError::AuthFailed {
                    provider: "stub".into(),
                });
            }
            Ok(CompletionResponse::text("- Budget approved\n- Deliverables due Friday"))
        }
    }

    /// Sink that fails a fixed number of writes before accepting.
    struct FlakySink {
        failures_left: AtomicU32,
        stored: Mutex<Vec<OutputRecord>>,
    }

    #[async_trait]
    impl ResultSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }
        fn dedupe_mode(&self) -> DedupeMode {
            DedupeMode::SkipIfExists
        }
        async fn store(&self, record: &OutputRecord) -> Result<WriteStatus, SinkError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::Database("disk full".into()));
            }
            self.stored.lock().unwrap().push(record.clone());
            Ok(WriteStatus::Written)
        }
        async fn get(&self, message_id: &str) -> Result<Option<OutputRecord>, SinkError> {
            Ok(self
                .stored
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.message_id == message_id)
                .cloned())
        }
        async fn count(&self) -> Result<usize, SinkError> {
            Ok(self.stored.lock().unwrap().len())
        }
    }

    fn eml(id: &str, body: &str) -> EmailMessage {
        let raw = format!(
            "Message-ID: <{id}>\r\nFrom: Alice <alice@example.com>\r\nSubject: Budget\r\n\
             Date: Mon, 4 Aug 2025 10:00:00 +0000\r\n\r\n{body}\r\n"
        );
        EmailMessage::from_raw(id, raw.into_bytes()).unwrap()
    }

    async fn markdown_sink(dir: &tempfile::TempDir, mode: DedupeMode) -> Arc<dyn ResultSink> {
        Arc::new(
            MarkdownSink::open(&dir.path().join("summaries.md"), mode)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn short_message_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let llm = StubLlm::ok();
        let processor = MessageProcessor::new(
            llm.clone(),
            markdown_sink(&dir, DedupeMode::SkipIfExists).await,
            SummarizerConfig::default(),
        );

        let message = eml(
            "m1@example.com",
            "Budget approved. Deliverables due Friday. Confirm resource plan.",
        );
        let outcome = processor.process(&message).await;

        let MessageOutcome::Done { record, status, run } = outcome else {
            panic!("expected Done");
        };
        assert_eq!(status, WriteStatus::Written);
        assert_eq!(record.body, "- Budget approved\n- Deliverables due Friday");
        assert_eq!(record.completeness, Completeness::Complete);
        assert_eq!(run.state, SummaryState::Done);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_body_skips_completion_calls() {
        let dir = tempfile::tempdir().unwrap();
        let llm = StubLlm::ok();
        let processor = MessageProcessor::new(
            llm.clone(),
            markdown_sink(&dir, DedupeMode::SkipIfExists).await,
            SummarizerConfig::default(),
        );

        let outcome = processor.process(&eml("blank@example.com", "   ")).await;

        let MessageOutcome::Done { record, run, .. } = outcome else {
            panic!("expected Done");
        };
        assert_eq!(record.body, NO_READABLE_CONTENT);
        assert_eq!(run.transitions.len(), 1);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auth_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = markdown_sink(&dir, DedupeMode::SkipIfExists).await;
        let processor =
            MessageProcessor::new(StubLlm::unauthorized(), sink.clone(), SummarizerConfig::default());

        let outcome = processor.process(&eml("m1@example.com", "Some text.")).await;

        match outcome {
            MessageOutcome::Failed { message_id, error, run } => {
                assert_eq!(message_id, "m1@example.com");
                assert!(error.is_auth());
                assert_eq!(run.state, SummaryState::Failed);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sink.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sink_errors_are_retried() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(2),
            stored: Mutex::new(Vec::new()),
        });
        let processor = MessageProcessor::new(StubLlm::ok(), sink.clone(), SummarizerConfig::default())
            .with_sink_retry_delay(Duration::from_millis(1));

        let outcome = processor.process(&eml("m1@example.com", "Some text.")).await;

        assert!(outcome.is_done());
        assert_eq!(sink.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sink_gives_up_after_configured_attempts() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(10),
            stored: Mutex::new(Vec::new()),
        });
        let config = SummarizerConfig {
            sink_write_attempts: 2,
            ..SummarizerConfig::default()
        };
        let processor = MessageProcessor::new(StubLlm::ok(), sink.clone(), config)
            .with_sink_retry_delay(Duration::from_millis(1));

        let outcome = processor.process(&eml("m1@example.com", "Some text.")).await;

        match outcome {
            MessageOutcome::Failed { error, .. } => {
                assert!(matches!(error, PipelineError::Sink { attempts: 2, .. }));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn batch_report_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let config = SummarizerConfig {
            message_concurrency: 3,
            ..SummarizerConfig::default()
        };
        let processor = MessageProcessor::new(
            StubLlm::ok(),
            markdown_sink(&dir, DedupeMode::SkipIfExists).await,
            config,
        );
        let messages = vec![
            eml("a@example.com", "First."),
            eml("b@example.com", "Second."),
            eml("a@example.com", "First again."),
        ];

        let report = processor.process_batch(&messages).await;

        assert_eq!(report.written, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.done(), 3);
        assert_eq!(report.failed(), 0);
        assert_eq!(processor.sink().count().await.unwrap(), 2);
    }
}
