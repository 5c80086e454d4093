//! Map-reduce summarization of one message's chunks.
//!
//! Map calls run concurrently, bounded by a semaphore that may be shared
//! across messages. Results land in an index-keyed set and are read back in
//! chunk order, so completion timing never affects the output.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::prompts;
use super::types::{
    Chunk, Completeness, FinalSummary, FragmentSet, SummaryFragment, SummaryRun, SummaryState,
};
use crate::config::SummarizerConfig;
use crate::email::EmailMessage;
use crate::error::{LlmError, PipelineError};
use crate::llm::{CompletionProvider, CompletionRequest, CompletionResponse};

pub struct MapReduceSummarizer {
    provider: Arc<dyn CompletionProvider>,
    limiter: Arc<Semaphore>,
    system_prompt: String,
    map_max_tokens: u32,
    reduce_max_tokens: u32,
    temperature: f32,
}

impl MapReduceSummarizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &SummarizerConfig) -> Self {
        Self {
            provider,
            limiter: Arc::new(Semaphore::new(config.map_concurrency_limit)),
            system_prompt: config.system_prompt.clone(),
            map_max_tokens: config.map_max_output_tokens,
            reduce_max_tokens: config.reduce_max_output_tokens,
            temperature: config.temperature,
        }
    }

    /// Share an in-flight call limit with other summarizers.
    pub fn with_limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Summarize `chunks` (in index order, at least one) of `message`.
    ///
    /// `run` ends in `Done` on success and `Failed` otherwise.
    pub async fn summarize(
        &self,
        message: &EmailMessage,
        chunks: &[Chunk],
        run: &mut SummaryRun,
    ) -> Result<FinalSummary, PipelineError> {
        run.transition_to(SummaryState::Mapping, None)?;
        info!(id = %message.id, chunks = chunks.len(), "Summarizing message");

        let fragments = match self.map(message, chunks, run).await {
            Ok(fragments) => fragments,
            Err(e) => return Err(fail(run, e)),
        };

        run.transition_to(SummaryState::Reducing, None)?;
        match self.reduce(message, chunks.len(), &fragments, run).await {
            Ok(summary) => {
                run.transition_to(SummaryState::Done, Some(summary.completeness.to_string()))?;
                Ok(summary)
            }
            Err(e) => Err(fail(run, e)),
        }
    }

    async fn map(
        &self,
        message: &EmailMessage,
        chunks: &[Chunk],
        run: &mut SummaryRun,
    ) -> Result<FragmentSet, PipelineError> {
        let total = chunks.len();
        let mut pending: FuturesUnordered<_> = chunks
            .iter()
            .map(|chunk| self.map_one(message, chunk, total))
            .collect();

        let mut fragments = FragmentSet::new();
        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(response) => {
                    debug!(id = %message.id, chunk = index, "Chunk summarized");
                    run.record_usage(response.input_tokens, response.output_tokens);
                    fragments.insert(index, SummaryFragment::ok(&message.id, index, response.content));
                }
                Err(e) if e.is_fatal() => {
                    // Dropping `pending` cancels the remaining calls.
                    warn!(id = %message.id, chunk = index, error = %e, "Fatal provider error, aborting message");
                    return Err(PipelineError::Fatal {
                        chunk: index,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(id = %message.id, chunk = index, error = %e, "Chunk summary failed");
                    fragments.insert(index, SummaryFragment::failed(&message.id, index, e.to_string()));
                }
            }
        }
        Ok(fragments)
    }

    async fn map_one(
        &self,
        message: &EmailMessage,
        chunk: &Chunk,
        total: usize,
    ) -> (usize, Result<CompletionResponse, LlmError>) {
        // The limiter is never closed; if it were, calls would go out uncapped.
        let _permit = self.limiter.acquire().await.ok();
        let request = CompletionRequest::new(
            self.system_prompt.as_str(),
            prompts::map_prompt(&message.subject, chunk, total),
        )
        .with_max_tokens(self.map_max_tokens)
        .with_temperature(self.temperature);
        (chunk.index, self.provider.complete(request).await)
    }

    async fn reduce(
        &self,
        message: &EmailMessage,
        total: usize,
        fragments: &FragmentSet,
        run: &mut SummaryRun,
    ) -> Result<FinalSummary, PipelineError> {
        let ok: Vec<&SummaryFragment> = fragments.values().filter(|f| f.is_ok()).collect();
        let missing: Vec<usize> = fragments
            .values()
            .filter(|f| !f.is_ok())
            .map(|f| f.chunk_index)
            .collect();
        if ok.is_empty() {
            return Err(PipelineError::NoUsableFragments { total });
        }

        let combined = if total == 1 {
            ok[0].text.clone()
        } else {
            let request = CompletionRequest::new(
                prompts::REDUCE_SYSTEM_PROMPT,
                prompts::reduce_prompt(ok.iter().copied()),
            )
            .with_max_tokens(self.reduce_max_tokens)
            .with_temperature(self.temperature);
            let _permit = self.limiter.acquire().await.ok();
            let response = self
                .provider
                .complete(request)
                .await
                .map_err(PipelineError::ReduceFailed)?;
            run.record_usage(response.input_tokens, response.output_tokens);
            response.content
        };

        let (text, completeness) = if missing.is_empty() {
            (combined, Completeness::Complete)
        } else {
            let marker = prompts::gap_marker(&missing, total);
            (format!("{}\n\n{marker}", combined.trim_end()), Completeness::Partial)
        };

        Ok(FinalSummary {
            message_id: message.id.clone(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            date: message.date.clone(),
            text,
            completeness,
            missing_chunks: missing,
            total_chunks: total,
        })
    }
}

fn fail(run: &mut SummaryRun, error: PipelineError) -> PipelineError {
    if let Err(e) = run.transition_to(SummaryState::Failed, Some(error.to_string())) {
        warn!(id = %run.message_id, error = %e, "Could not record failure");
    }
    error
}
