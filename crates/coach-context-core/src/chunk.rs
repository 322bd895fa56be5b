//! Sentence-boundary text chunker.
//!
//! Splits a knowledge document's body into segments of at most
//! `max_chars` characters. Splitting happens only on sentence boundaries
//! (a run of `.`, `!` or `?` followed by whitespace or end of text), so
//! every chunk except a truncated one ends where a sentence ends.
//!
//! # Algorithm
//!
//! 1. Split the text into sentences. Whitespace following a boundary
//!    stays with the sentence it follows.
//! 2. Greedily pack sentences into a buffer until the next sentence
//!    would push it past `max_chars`; flush and start a new chunk.
//! 3. A single sentence longer than `max_chars` is flushed on its own,
//!    hard-truncated to `max_chars`.
//! 4. At least one chunk is always produced, even for empty text.
//!
//! Chunks are exact slices of the input: concatenating them in order
//! reproduces the document, minus the tails of truncated sentences.
//!
//! # Example
//!
//! ```rust
//! use coach_context_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Warm up first. Then lift. Rest well!", 1000);
//! assert_eq!(chunks, vec!["Warm up first. Then lift. Rest well!".to_string()]);
//! ```

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::ContextError;
use crate::models::{ChunkMetadata, KnowledgeChunk, KnowledgeDocument};

/// Result of splitting a text, including which sentences were truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSplit {
    pub chunks: Vec<String>,
    /// Original character length of every sentence that was cut down.
    pub truncated_sentences: Vec<usize>,
}

/// Split text into sentence-aligned chunks of at most `max_chars` characters.
///
/// Never returns an empty list. A `max_chars` of 0 is treated as 1.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    split_text(text, max_chars).chunks
}

/// Like [`chunk_text`], but also reports truncated sentences.
pub fn split_text(text: &str, max_chars: usize) -> ChunkSplit {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut truncated_sentences = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for sentence in split_sentences(text) {
        let len = sentence.chars().count();

        if len > max_chars {
            if !buf.is_empty() {
                chunks.push(std::mem::take(&mut buf));
                buf_chars = 0;
            }
            chunks.push(sentence.chars().take(max_chars).collect());
            truncated_sentences.push(len);
            continue;
        }

        if buf_chars + len > max_chars && !buf.is_empty() {
            chunks.push(std::mem::take(&mut buf));
            buf_chars = 0;
        }

        buf.push_str(sentence);
        buf_chars += len;
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }

    if chunks.is_empty() {
        chunks.push(text.chars().take(max_chars).collect());
    }

    ChunkSplit {
        chunks,
        truncated_sentences,
    }
}

/// Chunk a document into [`KnowledgeChunk`]s without embeddings.
///
/// Indices are contiguous from 0. Each chunk carries a SHA-256 of its text
/// and a copy of the document's metadata.
pub fn build_chunks(doc: &KnowledgeDocument, max_chars: usize) -> Vec<KnowledgeChunk> {
    let split = split_text(&doc.body, max_chars);

    for &sentence_chars in &split.truncated_sentences {
        let err = ContextError::ChunkTooLarge {
            sentence_chars,
            max_chars,
        };
        warn!(document_id = %doc.id, error = %err, "truncated over-length sentence");
    }

    let metadata = ChunkMetadata::from_document(doc);
    split
        .chunks
        .into_iter()
        .enumerate()
        .map(|(i, text)| KnowledgeChunk {
            id: Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            chunk_index: i as i64,
            hash: hash_text(&text),
            text,
            embedding: None,
            metadata: metadata.clone(),
        })
        .collect()
}

/// SHA-256 hex digest of a chunk's text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_delimiter(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !is_delimiter(c) {
            continue;
        }
        while chars.peek().is_some_and(|&(_, next)| is_delimiter(next)) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some(&(_, next)) if next.is_whitespace() => {
                while chars.peek().is_some_and(|&(_, ws)| ws.is_whitespace()) {
                    chars.next();
                }
                let end = chars.peek().map_or(text.len(), |&(i, _)| i);
                sentences.push(&text[start..end]);
                start = end;
            }
            // "2.5 kg", "e.g." mid-token: not a boundary
            Some(_) => {}
        }
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_short_text_single_chunk() {
        let text = "Drink water. Sleep eight hours. Train hard!";
        let chunks = chunk_text(text, 1000);
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn test_empty_text_yields_one_chunk() {
        let chunks = chunk_text("", 500);
        assert_eq!(chunks, vec![String::new()]);
    }

    #[test]
    fn test_oversized_sentence_truncated() {
        let sentence = format!("{}.", "a".repeat(4999));
        let split = split_text(&sentence, 500);
        assert_eq!(split.chunks.len(), 1);
        assert_eq!(split.chunks[0].chars().count(), 500);
        assert_eq!(split.truncated_sentences, vec![5000]);
    }

    #[test]
    fn test_packs_sentences_greedily() {
        // 11 chars per sentence including the trailing space
        let text = "Aaaaa bbb. Ccccc ddd. Eeeee fff. Ggggg hhh.";
        let chunks = chunk_text(text, 22);
        assert_eq!(
            chunks,
            vec!["Aaaaa bbb. Ccccc ddd. ", "Eeeee fff. Ggggg hhh."]
        );
    }

    #[test]
    fn test_chunks_end_on_sentence_boundary() {
        let text = "One fish. Two fish! Red fish? Blue fish.";
        for chunk in chunk_text(text, 12) {
            let trimmed = chunk.trim_end();
            assert!(
                trimmed.ends_with(&['.', '!', '?'][..]),
                "chunk does not end on a boundary: {:?}",
                chunk
            );
        }
    }

    #[test]
    fn test_reconstruction() {
        let text = "Squats build legs. Deadlifts build the posterior chain!\n\n\
                    Are you recovering? Protein helps. 2.5 grams per kg is plenty.";
        for max in [10, 25, 60, 1000] {
            let split = split_text(text, max);
            if split.truncated_sentences.is_empty() {
                assert_eq!(split.chunks.concat(), text, "max_chars={}", max);
            }
        }
    }

    #[test]
    fn test_decimal_is_not_boundary() {
        let sentences = split_sentences("Take 2.5 g daily. Done.");
        assert_eq!(sentences, vec!["Take 2.5 g daily. ", "Done."]);
    }

    #[test]
    fn test_delimiter_runs() {
        let sentences = split_sentences("Wow!!! Really?! Yes.");
        assert_eq!(sentences, vec!["Wow!!! ", "Really?! ", "Yes."]);
    }

    #[test]
    fn test_unicode_counts_chars() {
        let text = "Café crème. Très bien.";
        let chunks = chunk_text(text, 12);
        assert_eq!(chunks, vec!["Café crème. ", "Très bien."]);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha. Beta. Gamma. Delta. Epsilon.";
        assert_eq!(chunk_text(text, 14), chunk_text(text, 14));
    }

    #[test]
    fn test_build_chunks_contiguous_with_metadata() {
        let doc = KnowledgeDocument {
            id: "doc-1".to_string(),
            owner_tag: "nutrition".to_string(),
            title: "Hydration".to_string(),
            body: (0..30)
                .map(|i| format!("Sentence number {}.", i))
                .collect::<Vec<_>>()
                .join(" "),
            category: "basics".to_string(),
            subtype: None,
            updated_at: Utc::now(),
        };
        let chunks = build_chunks(&doc, 60);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.document_id, "doc-1");
            assert_eq!(c.metadata.title, "Hydration");
            assert_eq!(c.hash, hash_text(&c.text));
            assert!(c.embedding.is_none());
        }
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, doc.body);
    }
}
