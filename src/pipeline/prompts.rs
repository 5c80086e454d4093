//! Prompt construction for the map and reduce calls.

use super::types::{Chunk, SummaryFragment};

/// System prompt for the reduce call.
pub const REDUCE_SYSTEM_PROMPT: &str = "You are an email summarizer. You receive partial summaries of \
     consecutive parts of one long email, in document order. Merge them into a single summary \
     (4-6 bullet points: key points, action items, deadlines, links/IDs, sentiment). \
     Do not repeat points that appear in more than one part.";

/// User prompt for one map call.
pub fn map_prompt(subject: &str, chunk: &Chunk, total_chunks: usize) -> String {
    if total_chunks <= 1 {
        return format!("Subject: {subject}\n\nEmail:\n{}", chunk.text);
    }
    format!(
        "Subject: {subject}\n\nThis is part {} of {total_chunks} of a long email. \
         Summarize only this part.\n\nEmail part:\n{}",
        chunk.index + 1,
        chunk.text
    )
}

/// User prompt for the reduce call. `fragments` must already be in chunk order.
pub fn reduce_prompt<'a>(fragments: impl IntoIterator<Item = &'a SummaryFragment>) -> String {
    let mut prompt =
        String::from("Combine and compress these partial summaries into one under 150 words:\n");
    for fragment in fragments {
        prompt.push_str(&format!(
            "\nPart {}:\n{}\n",
            fragment.chunk_index + 1,
            fragment.text.trim()
        ));
    }
    prompt
}

/// Marker appended to a partial summary naming the unsummarized chunks (0-based).
pub fn gap_marker(missing: &[usize], total_chunks: usize) -> String {
    let list = missing
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "[Incomplete: {} of {total_chunks} chunks could not be summarized (chunk index {list})]",
        missing.len()
    )
}
