//! Token-bounded chunking of plain text.
//!
//! Text is cut into units at paragraph breaks. A paragraph too large for one
//! chunk is cut at sentence ends, and a sentence still too large is hard-cut
//! (at the last whitespace when there is one). Units are then packed greedily
//! into chunks whose estimated size, including any carried-over overlap,
//! never exceeds the configured maximum.

use std::ops::Range;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::types::Chunk;
use crate::config::SummarizerConfig;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("static regex"));
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]+["')\]]*\s+"#).expect("static regex"));

/// Approximate token counter. Must be deterministic and monotonic in the
/// length of its input.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Fixed characters-per-token ratio, rounded up.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// Splits plain text into ordered, token-bounded chunks.
#[derive(Clone)]
pub struct Chunker {
    max_tokens: usize,
    overlap_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("max_tokens", &self.max_tokens)
            .field("overlap_tokens", &self.overlap_tokens)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            overlap_tokens: overlap_tokens.min(max_tokens.saturating_sub(1)),
            estimator: Arc::new(CharRatioEstimator::default()),
        }
    }

    pub fn from_config(config: &SummarizerConfig) -> Self {
        Self::new(config.chunk_max_tokens, config.chunk_overlap_tokens)
    }

    /// Swap in a model-aware estimator.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn estimate(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Split `text` into chunks. Always returns at least one chunk.
    pub fn chunk(&self, message_id: &str, text: &str) -> Vec<Chunk> {
        if self.estimate(text) <= self.max_tokens {
            return vec![Chunk {
                message_id: message_id.to_string(),
                index: 0,
                text: text.to_string(),
                span: 0..text.len(),
                overlap: 0,
            }];
        }

        let budget = self.max_tokens - self.overlap_tokens;
        let units = self.units(text, budget);

        let mut chunks = Vec::new();
        let mut push = |overlap_start: usize, fresh: &Range<usize>| {
            chunks.push(Chunk {
                message_id: message_id.to_string(),
                index: chunks.len(),
                text: text[overlap_start..fresh.end].to_string(),
                span: overlap_start..fresh.end,
                overlap: fresh.start - overlap_start,
            });
        };

        // `fresh` is the current chunk's new text; `overlap_start..fresh.start`
        // is the tail carried over from the previous chunk.
        let mut overlap_start = 0;
        let mut fresh = 0..0;
        for unit in units {
            if self.estimate(&text[overlap_start..unit.end]) <= self.max_tokens {
                fresh.end = unit.end;
                continue;
            }
            if fresh.is_empty() {
                // Unit plus overlap does not fit: drop the overlap.
                overlap_start = fresh.start;
                fresh.end = unit.end;
                continue;
            }

            push(overlap_start, &fresh);
            overlap_start = self.overlap_start(text, &fresh);
            fresh = fresh.end..unit.end;
            if self.estimate(&text[overlap_start..fresh.end]) > self.max_tokens {
                overlap_start = fresh.start;
            }
        }
        push(overlap_start, &fresh);
        chunks
    }

    /// Contiguous ranges covering `text`, each estimated at most `budget`.
    fn units(&self, text: &str, budget: usize) -> Vec<Range<usize>> {
        let mut units = Vec::new();
        for paragraph in split_after(&PARAGRAPH_BREAK, text, 0..text.len()) {
            if self.estimate(&text[paragraph.clone()]) <= budget {
                units.push(paragraph);
                continue;
            }
            for sentence in split_after(&SENTENCE_END, text, paragraph) {
                if self.estimate(&text[sentence.clone()]) <= budget {
                    units.push(sentence);
                } else {
                    self.hard_cut(text, sentence, budget, &mut units);
                }
            }
        }
        units
    }

    /// Cut `range` into pieces of at most `budget` tokens, preferring to end
    /// each piece just after a whitespace character.
    fn hard_cut(&self, text: &str, range: Range<usize>, budget: usize, out: &mut Vec<Range<usize>>) {
        let mut start = range.start;
        while start < range.end {
            if self.estimate(&text[start..range.end]) <= budget {
                out.push(start..range.end);
                return;
            }

            let bounds: Vec<usize> = text[start..range.end]
                .char_indices()
                .skip(1)
                .map(|(i, _)| start + i)
                .chain(std::iter::once(range.end))
                .collect();
            // Largest prefix within budget; always at least one char.
            let fit = bounds.partition_point(|&end| self.estimate(&text[start..end]) <= budget);
            let mut cut = bounds[fit.saturating_sub(1)];

            let piece = &text[start..cut];
            if let Some((ws, ch)) = piece.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
                let after = start + ws + ch.len_utf8();
                if after - start > piece.len() / 2 {
                    cut = after;
                }
            }

            out.push(start..cut);
            start = cut;
        }
    }

    /// Start of the largest tail of `fresh` that fits in the overlap budget.
    fn overlap_start(&self, text: &str, fresh: &Range<usize>) -> usize {
        if self.overlap_tokens == 0 {
            return fresh.end;
        }
        let bounds: Vec<usize> = text[fresh.clone()]
            .char_indices()
            .map(|(i, _)| fresh.start + i)
            .collect();
        let first_fit =
            bounds.partition_point(|&b| self.estimate(&text[b..fresh.end]) > self.overlap_tokens);
        let start = bounds.get(first_fit).copied().unwrap_or(fresh.end);

        // Begin the overlap on a word when the tail contains one.
        match text[start..fresh.end].find(char::is_whitespace) {
            Some(ws) if start != fresh.start => {
                let ws_abs = start + ws;
                let after = ws_abs + text[ws_abs..].chars().next().map_or(1, char::len_utf8);
                if after < fresh.end { after } else { start }
            }
            _ => start,
        }
    }
}

/// Split `range` into pieces that each end right after a match of `re`.
fn split_after(re: &Regex, text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut start = range.start;
    for m in re.find_iter(&text[range.clone()]) {
        let end = range.start + m.end();
        if end > start {
            pieces.push(start..end);
            start = end;
        }
    }
    if start < range.end || pieces.is_empty() {
        pieces.push(start..range.end);
    }
    pieces
}

/// Chunk `text` with the default character-ratio estimator.
pub fn chunk_text(
    message_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    Chunker::new(max_tokens, overlap_tokens).chunk(message_id, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(chunks: &[Chunk]) -> String {
        chunks.iter().map(Chunk::fresh_text).collect()
    }

    fn assert_invariants(chunker: &Chunker, text: &str, chunks: &[Chunk]) {
        assert!(!chunks.is_empty());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i, "indices contiguous");
            assert!(
                chunker.estimate(&c.text) <= chunker.max_tokens(),
                "chunk {i} has {} tokens",
                chunker.estimate(&c.text)
            );
            assert_eq!(&text[c.span.clone()], c.text);
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].span.end, pair[1].fresh_span().start, "gap-free");
        }
        assert_eq!(reconstruct(chunks), text);
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for p in 0..12 {
            for s in 0..(3 + p % 4) {
                text.push_str(&format!("Paragraph {p} sentence {s} talks about budgets. "));
            }
            text.push_str("\n\n");
        }
        text.push_str(&"unbroken".repeat(80));
        text.push_str(" done.");
        text
    }

    #[test]
    fn estimator_rounds_up() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("abc"), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
        assert_eq!(est.estimate("éééé"), 1);
    }

    #[test]
    fn short_text_is_one_chunk() {
        let text = "Budget approved. Deliverables due Friday. Confirm resource plan.";
        let chunks = chunk_text("m1", text, 5000, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].span, 0..text.len());
    }

    #[test]
    fn empty_text_is_one_empty_chunk() {
        let chunks = chunk_text("m1", "", 100, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn bound_and_coverage_hold_across_sizes() {
        let text = sample_text();
        for max in [16, 20, 33, 64, 100, 257] {
            let chunker = Chunker::new(max, 0);
            let chunks = chunker.chunk("m", &text);
            assert_invariants(&chunker, &text, &chunks);
            assert!(chunks.iter().all(|c| c.overlap == 0));
        }
    }

    #[test]
    fn bound_and_coverage_hold_with_overlap() {
        let text = sample_text();
        for (max, overlap) in [(16, 4), (40, 10), (100, 30), (200, 99)] {
            let chunker = Chunker::new(max, overlap);
            let chunks = chunker.chunk("m", &text);
            assert_invariants(&chunker, &text, &chunks);
            assert_eq!(chunks[0].overlap, 0);
            for pair in chunks.windows(2) {
                let carried = &pair[1].text[..pair[1].overlap];
                assert!(pair[0].text.ends_with(carried));
                assert!(chunker.estimate(carried) <= overlap);
            }
            assert!(chunks.iter().skip(1).any(|c| c.overlap > 0));
        }
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let para = "word ".repeat(30);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunker = Chunker::new(50, 0);
        let chunks = chunker.chunk("m", &text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.ends_with("\n\n"));
        assert!(chunks[1].text.starts_with("word"));
    }

    #[test]
    fn falls_back_to_sentences() {
        let text = "First sentence is here. Second sentence is here. Third sentence is here.";
        let chunker = Chunker::new(16, 0);
        let chunks = chunker.chunk("m", text);
        assert_invariants(&chunker, text, &chunks);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.ends_with(". "));
    }

    #[test]
    fn hard_cuts_unbroken_text() {
        let text = "x".repeat(1000);
        let chunker = Chunker::new(20, 0);
        let chunks = chunker.chunk("m", &text);
        assert_invariants(&chunker, &text, &chunks);
        assert_eq!(chunks.len(), 13);
    }

    #[test]
    fn hard_cut_respects_char_boundaries() {
        let text = "日本語のテキスト".repeat(50);
        let chunker = Chunker::new(16, 3);
        let chunks = chunker.chunk("m", &text);
        assert_invariants(&chunker, &text, &chunks);
    }

    #[test]
    fn three_times_max_yields_three_chunks() {
        // 30 sentences of exactly 40 chars = 10 tokens each; 300 tokens total.
        let text: String = (0..30)
            .map(|i| format!("{:<38}. ", format!("Item {i:02} of the plan")))
            .collect();
        assert_eq!(CharRatioEstimator::default().estimate(&text), 300);

        let chunker = Chunker::new(100, 0);
        let chunks = chunker.chunk("m", &text);
        assert_eq!(chunks.len(), 3);
        assert_invariants(&chunker, &text, &chunks);
    }

    #[test]
    fn natural_prose_at_three_times_max_stays_bounded() {
        // 48 chars = 12 tokens per sentence; 25 sentences = 300 tokens.
        let text = "The quarterly budget was approved by the board. ".repeat(25);
        assert_eq!(CharRatioEstimator::default().estimate(&text), 300);

        let chunker = Chunker::new(100, 0);
        let chunks = chunker.chunk("m", &text);
        assert_invariants(&chunker, &text, &chunks);
        // Sentences don't divide 100 evenly, so packing leaves slack.
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.text.ends_with(". ")));
    }

    struct WordEstimator;

    impl TokenEstimator for WordEstimator {
        fn estimate(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    #[test]
    fn custom_estimator_is_used() {
        let text = "one two three four five six seven eight nine ten";
        let chunker = Chunker::new(4, 0).with_estimator(Arc::new(WordEstimator));
        let chunks = chunker.chunk("m", text);
        assert_invariants(&chunker, text, &chunks);
        assert_eq!(chunks.len(), 3);
    }
}
