//! Recursive text splitting for the ingestion pipeline.
//!
//! Sizes are measured in characters. `semchunk-rs` supplies the boundary-preferring recursive
//! split (paragraphs, then lines, sentences, words, characters). A sliding overlap is then
//! prepended from the tail of the previous chunk, snapped to a word boundary. Chunks above the
//! hard ceiling are truncated and whitespace-only chunks are dropped, so every returned chunk is
//! non-empty and at most `max_chars` characters.

use semchunk_rs::Chunker;
use std::sync::Arc;

type LengthCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Splitter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Target chunk length including overlap.
    pub chunk_size: usize,
    /// Characters carried over from the previous chunk.
    pub chunk_overlap: usize,
    /// Hard per-chunk ceiling applied after splitting.
    pub max_chars: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            max_chars: 10_000,
        }
    }
}

/// Split `text` into overlapping chunks. Deterministic for identical input and settings.
///
/// Text that already fits in `chunk_size` comes back as a single chunk. Longer text is split
/// with room reserved for the overlap, and the overlap itself only ever shrinks to fit: the
/// chunk's own text is never cut to make room for it.
pub fn chunk_text(text: &str, settings: &ChunkSettings) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let chunk_size = settings.chunk_size.max(1);
    let overlap = settings.chunk_overlap.min(chunk_size / 2);
    let counter = char_counter();
    let max_chars = settings.max_chars.max(1);

    if counter.as_ref()(trimmed) <= chunk_size {
        return vec![truncate_chars(trimmed.to_string(), max_chars)];
    }

    // Leave room for the overlap and its separating space.
    let base_size = if overlap == 0 {
        chunk_size
    } else {
        chunk_size.saturating_sub(overlap + 1).max(1)
    };

    let chunks = chunk_text_with_counter(text, base_size, chunk_size, overlap, counter);
    chunks
        .into_iter()
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| truncate_chars(chunk, max_chars))
        .collect()
}

fn char_counter() -> LengthCounter {
    Arc::new(|segment: &str| segment.chars().count())
}

fn chunk_text_with_counter(
    text: &str,
    base_size: usize,
    chunk_size: usize,
    overlap: usize,
    counter: LengthCounter,
) -> Vec<String> {
    let counter_for_chunker = counter.clone();
    let chunker = Chunker::new(
        base_size,
        Box::new(move |segment: &str| counter_for_chunker.as_ref()(segment)),
    );
    let base_chunks: Vec<String> = chunker
        .chunk(text)
        .iter()
        .flat_map(|chunk| split_to_budget(chunk, base_size, &counter))
        .collect();
    apply_overlap(base_chunks, chunk_size, overlap, &counter)
}

/// Re-split a chunk the recursive splitter left above `budget`, preferring paragraph, line,
/// sentence, and word boundaries before falling back to a hard character cut.
fn split_to_budget(chunk: &str, budget: usize, counter: &LengthCounter) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = chunk.trim();
    while !rest.is_empty() {
        if counter.as_ref()(rest) <= budget {
            pieces.push(rest.to_string());
            break;
        }
        let limit = rest
            .char_indices()
            .nth(budget)
            .map_or(rest.len(), |(index, _)| index);
        let cut = boundary_before(&rest[..limit]).unwrap_or(limit);
        let (head, tail) = rest.split_at(cut);
        pieces.push(head.trim_end().to_string());
        rest = tail.trim_start();
    }
    pieces
}

const SENTENCE_ENDS: [&str; 6] = [". ", "! ", "? ", "。", "！", "？"];

/// Byte offset of the last usable split point in `window`, or `None` if it holds no boundary.
fn boundary_before(window: &str) -> Option<usize> {
    for separator in ["\n\n", "\n"] {
        if let Some(index) = window.rfind(separator)
            && index > 0
        {
            return Some(index);
        }
    }
    let sentence_end = SENTENCE_ENDS
        .iter()
        .filter_map(|end| {
            window
                .rfind(end)
                .map(|index| index + end.trim_end().len())
        })
        .max();
    if let Some(index) = sentence_end
        && index < window.len()
    {
        return Some(index);
    }
    window
        .char_indices()
        .filter(|(index, c)| *index > 0 && c.is_whitespace())
        .map(|(index, _)| index)
        .last()
}

fn apply_overlap(
    chunks: Vec<String>,
    chunk_size: usize,
    overlap: usize,
    counter: &LengthCounter,
) -> Vec<String> {
    if overlap == 0 {
        return chunks;
    }

    let mut overlapped = Vec::with_capacity(chunks.len());
    let mut previous: Option<String> = None;
    for current in chunks {
        let chunk = match previous.as_deref() {
            Some(prev) => build_overlapped_chunk(prev, &current, overlap, chunk_size, counter),
            None => current.clone(),
        };
        overlapped.push(chunk);
        previous = Some(current);
    }
    overlapped
}

/// Prefix `current` with as much of the previous tail as still fits in `chunk_size`.
fn build_overlapped_chunk(
    previous: &str,
    current: &str,
    overlap: usize,
    chunk_size: usize,
    counter: &LengthCounter,
) -> String {
    let room = chunk_size.saturating_sub(counter.as_ref()(current) + 1);
    let tail = tail_at_word_boundary(previous, overlap.min(room), counter);
    if tail.is_empty() {
        return current.to_string();
    }

    let mut combined = String::with_capacity(tail.len() + current.len() + 1);
    combined.push_str(tail);
    if !ends_with_whitespace(tail) && !starts_with_whitespace(current) {
        combined.push(' ');
    }
    combined.push_str(current);
    combined
}

/// Longest suffix of `text` within `limit` that does not start mid-word.
fn tail_at_word_boundary<'a>(text: &'a str, limit: usize, counter: &LengthCounter) -> &'a str {
    let tail = trim_to_budget(text, limit, counter);
    let offset = text.len() - tail.len();
    let mid_word = text[..offset]
        .chars()
        .next_back()
        .is_some_and(|c| !c.is_whitespace());
    if !mid_word {
        return tail;
    }
    match tail.find(char::is_whitespace) {
        Some(index) => tail[index..].trim_start(),
        // A single word longer than the overlap contributes nothing.
        None => "",
    }
}

/// Drop characters from the start until `counter` fits within `budget`.
fn trim_to_budget<'a>(text: &'a str, budget: usize, counter: &LengthCounter) -> &'a str {
    if budget == 0 {
        return "";
    }

    let trimmed_text = text.trim_start();
    if counter.as_ref()(trimmed_text) <= budget {
        return trimmed_text;
    }

    let len = text.len();
    let mut start = 0;

    while start < len {
        let next_start = text[start..]
            .char_indices()
            .nth(1)
            .map(|(offset, _)| start + offset)
            .unwrap_or(len);
        start = next_start;
        let trimmed = text[start..].trim_start();
        if counter.as_ref()(trimmed) <= budget {
            return trimmed;
        }
    }

    ""
}

fn truncate_chars(chunk: String, max_chars: usize) -> String {
    match chunk.char_indices().nth(max_chars) {
        Some((byte_index, _)) => {
            tracing::debug!(max_chars, "Truncating oversized chunk");
            chunk[..byte_index].to_string()
        }
        None => chunk,
    }
}

fn starts_with_whitespace(text: &str) -> bool {
    text.chars().next().is_some_and(char::is_whitespace)
}

fn ends_with_whitespace(text: &str) -> bool {
    text.chars().next_back().is_some_and(char::is_whitespace)
}
