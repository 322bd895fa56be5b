//! In-memory [`KnowledgeStore`] implementation for tests and embedding.
//!
//! Each document's chunk set is stored as one `Vec` inside a map behind
//! a `RwLock`, so `replace_chunks` is a single map insert and readers
//! never observe a half-replaced set. Vector search is brute-force cosine
//! similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::ContextError;
use crate::models::{ChunkFilter, KnowledgeChunk, KnowledgeDocument, ScoredChunk};

use super::{sort_scored, validate_chunk_set, KnowledgeStore};

/// In-memory store.
pub struct InMemoryStore {
    docs: RwLock<BTreeMap<String, KnowledgeDocument>>,
    chunks: RwLock<HashMap<String, Vec<KnowledgeChunk>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            chunks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// A panic while holding a guard cannot leave a chunk set half-written
// (replacement is one insert), so poisoned data is still consistent.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn upsert_document(&self, doc: &KnowledgeDocument) -> Result<()> {
        write(&self.docs).insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<KnowledgeDocument>> {
        Ok(read(&self.docs).get(id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<KnowledgeDocument>> {
        Ok(read(&self.docs).values().cloned().collect())
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[KnowledgeChunk],
    ) -> Result<(), ContextError> {
        validate_chunk_set(document_id, chunks)?;
        if !read(&self.docs).contains_key(document_id) {
            return Err(ContextError::store_write(document_id, "unknown document"));
        }
        write(&self.chunks).insert(document_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<KnowledgeChunk>> {
        Ok(read(&self.chunks)
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn nearest(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = read(&self.chunks);
        let mut scored: Vec<ScoredChunk> = chunks
            .values()
            .flatten()
            .filter(|c| filter.matches(&c.metadata))
            .filter_map(|c| {
                c.embedding.as_ref().map(|v| ScoredChunk {
                    chunk: c.clone(),
                    similarity: cosine_similarity(query_vec, v) as f64,
                })
            })
            .collect();
        sort_scored(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    async fn candidates(&self, filter: &ChunkFilter) -> Result<Vec<KnowledgeChunk>> {
        let chunks = read(&self.chunks);
        let mut out: Vec<KnowledgeChunk> = chunks
            .values()
            .flatten()
            .filter(|c| filter.matches(&c.metadata))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        Ok(out)
    }

    async fn all_missing_embeddings(&self) -> Result<Vec<String>> {
        let docs = read(&self.docs);
        let chunks = read(&self.chunks);
        Ok(docs
            .keys()
            .filter(|id| chunks.get(*id).map_or(true, |set| set.is_empty()))
            .cloned()
            .collect())
    }

    async fn incomplete_embeddings(&self) -> Result<Vec<String>> {
        let docs = read(&self.docs);
        let chunks = read(&self.chunks);
        Ok(docs
            .keys()
            .filter(|id| {
                chunks
                    .get(*id)
                    .is_some_and(|set| set.iter().any(|c| c.embedding.is_none()))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::build_chunks;
    use chrono::Utc;

    fn doc(id: &str, owner: &str, body: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            id: id.to_string(),
            owner_tag: owner.to_string(),
            title: format!("Title {}", id),
            body: body.to_string(),
            category: "general".to_string(),
            subtype: None,
            updated_at: Utc::now(),
        }
    }

    fn embedded(doc: &KnowledgeDocument, vec: Vec<f32>) -> Vec<KnowledgeChunk> {
        build_chunks(doc, 1000)
            .into_iter()
            .map(|mut c| {
                c.embedding = Some(vec.clone());
                c
            })
            .collect()
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_set() {
        let store = InMemoryStore::new();
        let d = doc("d1", "coach", "Old text.");
        store.upsert_document(&d).await.unwrap();
        store
            .replace_chunks("d1", &embedded(&d, vec![1.0, 0.0]))
            .await
            .unwrap();

        let d2 = doc("d1", "coach", "New text. More text.");
        store
            .replace_chunks("d1", &build_chunks(&d2, 10))
            .await
            .unwrap();
        let chunks = store.chunks_for_document("d1").await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.text.contains("text")));
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_old_set() {
        let store = InMemoryStore::new();
        let d = doc("d1", "coach", "Keep me.");
        store.upsert_document(&d).await.unwrap();
        let original = embedded(&d, vec![0.5, 0.5]);
        store.replace_chunks("d1", &original).await.unwrap();

        let mut broken = build_chunks(&d, 1000);
        broken[0].chunk_index = 7;
        let err = store.replace_chunks("d1", &broken).await.unwrap_err();
        assert!(matches!(err, ContextError::StoreWriteFailed { .. }));

        assert_eq!(store.chunks_for_document("d1").await.unwrap(), original);
        let hits = store
            .nearest(&[0.5, 0.5], 5, &ChunkFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_unknown_document_fails() {
        let store = InMemoryStore::new();
        let d = doc("ghost", "coach", "Boo.");
        let err = store
            .replace_chunks("ghost", &build_chunks(&d, 100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown document"));
    }

    #[tokio::test]
    async fn test_nearest_filters_and_ranks() {
        let store = InMemoryStore::new();
        let a = doc("a", "nutrition", "Protein.");
        let b = doc("b", "nutrition", "Carbs.");
        let c = doc("c", "strength", "Squats.");
        for (d, v) in [(&a, vec![1.0, 0.0]), (&b, vec![0.6, 0.8]), (&c, vec![1.0, 0.0])] {
            store.upsert_document(d).await.unwrap();
            store.replace_chunks(&d.id, &embedded(d, v)).await.unwrap();
        }

        let hits = store
            .nearest(&[1.0, 0.0], 10, &ChunkFilter::owner("nutrition"))
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);

        let top1 = store
            .nearest(&[1.0, 0.0], 1, &ChunkFilter::default())
            .await
            .unwrap();
        // a and c tie on similarity and index; document id breaks the tie
        assert_eq!(top1[0].chunk.document_id, "a");
    }

    #[tokio::test]
    async fn test_missing_and_incomplete() {
        let store = InMemoryStore::new();
        let a = doc("a", "coach", "Embedded.");
        let b = doc("b", "coach", "Never chunked.");
        let c = doc("c", "coach", "Partly. Embedded.");
        for d in [&a, &b, &c] {
            store.upsert_document(d).await.unwrap();
        }
        store
            .replace_chunks("a", &embedded(&a, vec![1.0]))
            .await
            .unwrap();
        let mut partial = embedded(&c, vec![1.0]);
        partial.push(KnowledgeChunk {
            chunk_index: 1,
            embedding: None,
            ..partial[0].clone()
        });
        store.replace_chunks("c", &partial).await.unwrap();

        assert_eq!(store.all_missing_embeddings().await.unwrap(), vec!["b"]);
        assert_eq!(store.incomplete_embeddings().await.unwrap(), vec!["c"]);
    }
}
