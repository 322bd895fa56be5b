//! Storage abstraction for the knowledge corpus.
//!
//! The [`KnowledgeStore`] trait defines every storage operation the
//! retrieval and backfill paths need, so the SQLite backend and the
//! in-memory backend are interchangeable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::ContextError;
use crate::models::{ChunkFilter, KnowledgeChunk, KnowledgeDocument, ScoredChunk};

/// Abstract storage backend for documents, chunks, and vectors.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](KnowledgeStore::upsert_document) | Insert or update an authored document |
/// | [`replace_chunks`](KnowledgeStore::replace_chunks) | Atomically swap a document's chunk set |
/// | [`nearest`](KnowledgeStore::nearest) | Top-k chunks by cosine similarity |
/// | [`candidates`](KnowledgeStore::candidates) | All chunks matching a filter, for lexical scoring |
/// | [`all_missing_embeddings`](KnowledgeStore::all_missing_embeddings) | Documents with no chunks at all |
/// | [`incomplete_embeddings`](KnowledgeStore::incomplete_embeddings) | Documents with chunks lacking vectors |
///
/// Writes are never retried internally: errors surface to the caller.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert or update a document by `id`.
    async fn upsert_document(&self, doc: &KnowledgeDocument) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<KnowledgeDocument>>;

    /// All documents, ordered by `id`.
    async fn list_documents(&self) -> Result<Vec<KnowledgeDocument>>;

    /// Replace every chunk of `document_id` with `chunks`.
    ///
    /// Atomic: readers see either the complete old set or the complete new
    /// set. On failure the old set is left untouched.
    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[KnowledgeChunk],
    ) -> Result<(), ContextError>;

    /// The current chunk set of a document, ordered by `chunk_index`.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<KnowledgeChunk>>;

    /// Top-`k` embedded chunks by cosine similarity to `query_vec`.
    ///
    /// Ordered by similarity desc, then `chunk_index` asc, then `document_id` asc.
    async fn nearest(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>>;

    /// Every chunk matching `filter`, embedded or not.
    async fn candidates(&self, filter: &ChunkFilter) -> Result<Vec<KnowledgeChunk>>;

    /// Ids of documents that have zero chunks.
    async fn all_missing_embeddings(&self) -> Result<Vec<String>>;

    /// Ids of documents with at least one chunk lacking a vector.
    async fn incomplete_embeddings(&self) -> Result<Vec<String>>;
}

/// Check that a chunk set is well-formed before any write begins.
///
/// Every chunk must belong to `document_id`, indices must run `0..n` in
/// order, and all vectors present must share one dimensionality.
pub fn validate_chunk_set(
    document_id: &str,
    chunks: &[KnowledgeChunk],
) -> Result<(), ContextError> {
    if chunks.is_empty() {
        return Err(ContextError::store_write(
            document_id,
            "chunk set must not be empty",
        ));
    }

    let mut dims: Option<usize> = None;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.document_id != document_id {
            return Err(ContextError::store_write(
                document_id,
                format!("chunk {} belongs to document {}", i, chunk.document_id),
            ));
        }
        if chunk.chunk_index != i as i64 {
            return Err(ContextError::store_write(
                document_id,
                format!(
                    "chunk indices must be contiguous from 0: expected {}, found {}",
                    i, chunk.chunk_index
                ),
            ));
        }
        if let Some(vec) = &chunk.embedding {
            match dims {
                Some(d) if d != vec.len() => {
                    return Err(ContextError::store_write(
                        document_id,
                        format!("mixed vector dimensions: {} and {}", d, vec.len()),
                    ));
                }
                _ => dims = Some(vec.len()),
            }
        }
    }
    Ok(())
}

/// Ordering shared by every `nearest` implementation.
pub fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
            .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
    });
}
