//! Retriever with keyword, semantic, and hybrid modes.
//!
//! The retriever works entirely through the [`KnowledgeStore`] and
//! [`EmbeddingProvider`] traits, so it has no database or HTTP
//! dependencies. The calling application constructs it with concrete
//! backends and [`RetrievalParams`] built from its own config.
//!
//! # Scoring
//!
//! | Mode | `similarity_score` | `lexical_score` | `combined_score` |
//! |------|--------------------|-----------------|------------------|
//! | semantic | cosine, clamped to `[0, 1]` | `None` | similarity |
//! | keyword | `0` | shared-term ratio | lexical |
//! | hybrid | cosine (or `0` if not a vector hit) | shared-term ratio | `w_sem × sim + w_lex × lex` |
//!
//! Results are sorted by combined desc, similarity desc, `chunk_index`
//! asc, `document_id` asc, then truncated to `max_results`. Whole results
//! are concatenated into the context string until the next one would
//! overflow the character budget.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryKey};
use crate::embedding::EmbeddingProvider;
use crate::error::ContextError;
use crate::lexical::{lexical_score, terms};
use crate::models::{
    ChunkFilter, ChunkRef, KnowledgeChunk, RagResponse, RetrievalResult, SearchMethod,
};
use crate::observe::{EmbedEvent, NoopObserver, RetrievalObserver, SearchEvent};
use crate::store::KnowledgeStore;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub semantic_weight: f64,
    pub lexical_weight: f64,
    /// A response is valid only when its top combined score exceeds this.
    pub relevance_floor: f64,
    /// Number of vector candidates fetched before merging.
    pub candidate_k: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            lexical_weight: 0.3,
            relevance_floor: 0.3,
            candidate_k: 20,
        }
    }
}

/// Inputs for one search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Restrict to chunks of one persona/domain.
    pub owner_tag: Option<&'a str>,
    pub method: SearchMethod,
    pub max_results: usize,
    pub context_char_budget: usize,
}

pub struct Retriever {
    store: Arc<dyn KnowledgeStore>,
    provider: Arc<dyn EmbeddingProvider>,
    observer: Arc<dyn RetrievalObserver>,
    cache: Option<Arc<QueryCache>>,
    params: RetrievalParams,
}

struct Scored {
    chunk: KnowledgeChunk,
    similarity: f64,
    lexical: Option<f64>,
    combined: f64,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        provider: Arc<dyn EmbeddingProvider>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            store,
            provider,
            observer: Arc::new(NoopObserver),
            cache: None,
            params,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetrievalObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Drop every cached response. Call after the corpus changes.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    /// Answer one knowledge query.
    ///
    /// A query with nothing relevant is not an error: the response comes
    /// back with `is_valid == false`. Only a failed query embedding in
    /// semantic mode, or a store read failure, returns `Err`.
    pub async fn search(&self, req: &SearchRequest<'_>) -> Result<RagResponse> {
        let started = Instant::now();

        if req.query.trim().is_empty() {
            let resp = RagResponse::empty(req.query, req.method);
            self.report(&resp, false);
            return Ok(resp);
        }

        let key = QueryKey::new(
            req.query,
            req.owner_tag,
            req.method,
            req.max_results,
            req.context_char_budget,
        );
        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.get(&key) {
                hit.response_time_ms = started.elapsed().as_millis() as u64;
                self.report(&hit, true);
                return Ok(hit);
            }
        }

        let filter = ChunkFilter {
            owner_tag: req.owner_tag.map(str::to_string),
            category: None,
        };

        let mut method = req.method;
        let query_vec = if method.uses_embeddings() {
            match self.embed_query(req.query).await {
                Ok(v) => Some(v),
                Err(source) if method == SearchMethod::Hybrid => {
                    warn!(
                        error = %source,
                        "query embedding failed, falling back to keyword search"
                    );
                    method = SearchMethod::Keyword;
                    None
                }
                Err(source) => {
                    return Err(ContextError::EmbeddingCallFailed {
                        target: "query".to_string(),
                        source,
                    }
                    .into())
                }
            }
        } else {
            None
        };

        let mut scored = match (method, query_vec) {
            (SearchMethod::Semantic, Some(qv)) => {
                self.semantic(&qv, req.max_results, &filter).await?
            }
            (SearchMethod::Hybrid, Some(qv)) => {
                self.hybrid(req.query, &qv, req.max_results, &filter).await?
            }
            _ => self.keyword(req.query, &filter).await?,
        };

        rank(&mut scored);
        scored.truncate(req.max_results);

        let results: Vec<RetrievalResult> = scored.into_iter().map(into_result).collect();
        let (context, context_chunks) = build_context(&results, req.context_char_budget);
        let top_score = results.first().map_or(0.0, |r| r.combined_score);
        let is_valid = !results.is_empty() && top_score > self.params.relevance_floor;

        debug!(
            method = %method,
            results = results.len(),
            context_chunks,
            top_score,
            is_valid,
            "retrieval scored"
        );

        let resp = RagResponse {
            query: req.query.to_string(),
            method,
            results,
            context,
            context_chunks,
            is_valid,
            top_score,
            response_time_ms: started.elapsed().as_millis() as u64,
        };

        // A degraded response must not mask recovery of the embedding service.
        if method == req.method {
            if let Some(cache) = &self.cache {
                cache.insert(key, resp.clone());
            }
        }

        self.report(&resp, false);
        Ok(resp)
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, crate::error::EmbedError> {
        let started = Instant::now();
        let result = self.provider.embed(query).await;
        self.observer.on_embed(&EmbedEvent {
            target: "query".to_string(),
            ok: result.is_ok(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Vector hits to fetch: never fewer than the caller will keep.
    fn vector_k(&self, max_results: usize) -> usize {
        self.params.candidate_k.max(max_results)
    }

    async fn semantic(
        &self,
        query_vec: &[f32],
        max_results: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<Scored>> {
        let hits = self
            .store
            .nearest(query_vec, self.vector_k(max_results), filter)
            .await?;
        Ok(hits
            .into_iter()
            .map(|h| {
                let similarity = h.similarity.clamp(0.0, 1.0);
                Scored {
                    chunk: h.chunk,
                    similarity,
                    lexical: None,
                    combined: similarity,
                }
            })
            .collect())
    }

    async fn keyword(&self, query: &str, filter: &ChunkFilter) -> Result<Vec<Scored>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self.store.candidates(filter).await?;
        Ok(candidates
            .into_iter()
            .filter_map(|chunk| {
                let lex = lexical_score(&query_terms, &chunk.text, &chunk.metadata.title);
                (lex > 0.0).then_some(Scored {
                    chunk,
                    similarity: 0.0,
                    lexical: Some(lex),
                    combined: lex,
                })
            })
            .collect())
    }

    async fn hybrid(
        &self,
        query: &str,
        query_vec: &[f32],
        max_results: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<Scored>> {
        let hits = self
            .store
            .nearest(query_vec, self.vector_k(max_results), filter)
            .await?;
        let query_terms = terms(query);

        let mut merged: BTreeMap<ChunkRef, (KnowledgeChunk, f64)> = hits
            .into_iter()
            .map(|h| (h.chunk.chunk_ref(), (h.chunk, h.similarity.clamp(0.0, 1.0))))
            .collect();

        if !query_terms.is_empty() {
            for chunk in self.store.candidates(filter).await? {
                let key = chunk.chunk_ref();
                if merged.contains_key(&key) {
                    continue;
                }
                if lexical_score(&query_terms, &chunk.text, &chunk.metadata.title) > 0.0 {
                    merged.insert(key, (chunk, 0.0));
                }
            }
        }

        let w_sem = self.params.semantic_weight;
        let w_lex = self.params.lexical_weight;
        Ok(merged
            .into_values()
            .map(|(chunk, similarity)| {
                let lex = lexical_score(&query_terms, &chunk.text, &chunk.metadata.title);
                Scored {
                    chunk,
                    similarity,
                    lexical: Some(lex),
                    combined: w_sem * similarity + w_lex * lex,
                }
            })
            .collect())
    }

    fn report(&self, resp: &RagResponse, cache_hit: bool) {
        self.observer.on_search(&SearchEvent {
            search_method: resp.method,
            results_count: resp.results.len(),
            response_time_ms: resp.response_time_ms,
            relevance_score: resp.top_score,
            context_length: resp.context.chars().count(),
            is_valid: resp.is_valid,
            cache_hit,
        });
    }
}

fn rank(scored: &mut [Scored]) {
    scored.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
            .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
    });
}

fn into_result(s: Scored) -> RetrievalResult {
    let chunk_ref = s.chunk.chunk_ref();
    let meta = s.chunk.metadata;
    RetrievalResult {
        chunk_ref,
        text: s.chunk.text,
        similarity_score: s.similarity,
        lexical_score: s.lexical,
        combined_score: s.combined,
        source_title: meta.title,
        source_category: meta.category,
        owner_tag: meta.owner_tag,
    }
}

const CONTEXT_SEPARATOR: &str = "\n\n";

fn context_entry(r: &RetrievalResult) -> String {
    format!("[{}]\n{}", r.source_title, r.text.trim())
}

/// Concatenate whole results until the next would overflow `budget` chars.
///
/// Returns the context string and how many leading results it holds.
pub fn build_context(results: &[RetrievalResult], budget: usize) -> (String, usize) {
    let mut context = String::new();
    let mut used = 0usize;
    let mut count = 0usize;

    for r in results {
        let entry = context_entry(r);
        let sep = if count == 0 { 0 } else { CONTEXT_SEPARATOR.len() };
        let cost = sep + entry.chars().count();
        if used + cost > budget {
            break;
        }
        if count > 0 {
            context.push_str(CONTEXT_SEPARATOR);
        }
        context.push_str(&entry);
        used += cost;
        count += 1;
    }

    (context, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::build_chunks;
    use crate::error::EmbedError;
    use crate::models::KnowledgeDocument;
    use crate::observe::MemoryObserver;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns one fixed vector for every text, or always fails.
    struct FixedProvider {
        vec: Option<Vec<f32>>,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(vec: Vec<f32>) -> Self {
            Self {
                vec: Some(vec),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                vec: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        fn model_name(&self) -> &str {
            "fixed"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.vec
                .clone()
                .ok_or_else(|| EmbedError::Network("connection refused".to_string()))
        }
    }

    fn doc(id: &str, owner: &str, title: &str, body: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            id: id.to_string(),
            owner_tag: owner.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            category: "nutrition".to_string(),
            subtype: None,
            updated_at: Utc::now(),
        }
    }

    /// Unit vector whose cosine with `[1, 0]` is `sim`.
    fn at_similarity(sim: f32) -> Vec<f32> {
        vec![sim, (1.0 - sim * sim).sqrt()]
    }

    async fn add(store: &InMemoryStore, d: KnowledgeDocument, vec: Vec<f32>) {
        store.upsert_document(&d).await.unwrap();
        let chunks: Vec<_> = build_chunks(&d, 1000)
            .into_iter()
            .map(|mut c| {
                c.embedding = Some(vec.clone());
                c
            })
            .collect();
        store.replace_chunks(&d.id, &chunks).await.unwrap();
    }

    async fn corpus() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        add(
            &store,
            doc("creatine", "coach", "Creatine", "Loading phases are optional for most lifters."),
            at_similarity(0.4),
        )
        .await;
        add(
            &store,
            doc("protein", "coach", "Protein", "Total daily intake matters more than timing."),
            at_similarity(0.5),
        )
        .await;
        add(
            &store,
            doc("sleep", "other", "Sleep", "Creatine does not fix poor sleep."),
            at_similarity(0.9),
        )
        .await;
        Arc::new(store)
    }

    fn request(query: &str, method: SearchMethod) -> SearchRequest<'_> {
        SearchRequest {
            query,
            owner_tag: Some("coach"),
            method,
            max_results: 5,
            context_char_budget: 4000,
        }
    }

    #[tokio::test]
    async fn test_hybrid_keyword_match_beats_better_vector() {
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![1.0, 0.0])),
            RetrievalParams::default(),
        );
        let resp = retriever
            .search(&request("creatine", SearchMethod::Hybrid))
            .await
            .unwrap();

        let ids: Vec<&str> = resp
            .results
            .iter()
            .map(|r| r.chunk_ref.document_id.as_str())
            .collect();
        assert_eq!(ids, vec!["creatine", "protein"]);

        let top = &resp.results[0];
        assert!((top.similarity_score - 0.4).abs() < 1e-4);
        assert_eq!(top.lexical_score, Some(1.0));
        assert!((top.combined_score - 0.58).abs() < 1e-4);
        assert!((resp.results[1].combined_score - 0.35).abs() < 1e-4);
        assert!(resp.is_valid);
    }

    #[tokio::test]
    async fn test_semantic_ranks_by_similarity() {
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![1.0, 0.0])),
            RetrievalParams::default(),
        );
        let resp = retriever
            .search(&request("creatine", SearchMethod::Semantic))
            .await
            .unwrap();
        assert_eq!(resp.results[0].chunk_ref.document_id, "protein");
        assert!(resp.results.iter().all(|r| r.lexical_score.is_none()));
        assert_eq!(resp.results[0].combined_score, resp.results[0].similarity_score);
    }

    #[tokio::test]
    async fn test_keyword_makes_no_embedding_call() {
        let provider = Arc::new(FixedProvider::new(vec![1.0, 0.0]));
        let retriever =
            Retriever::new(corpus().await, provider.clone(), RetrievalParams::default());
        let resp = retriever
            .search(&request("creatine loading", SearchMethod::Keyword))
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].similarity_score, 0.0);
        assert_eq!(resp.results[0].lexical_score, Some(1.0));
    }

    #[tokio::test]
    async fn test_unrelated_query_is_invalid() {
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![0.0, -1.0])),
            RetrievalParams::default(),
        );
        let resp = retriever
            .search(&request("marathon tapering", SearchMethod::Hybrid))
            .await
            .unwrap();
        assert!(!resp.is_valid);

        let resp = retriever
            .search(&request("marathon tapering", SearchMethod::Keyword))
            .await
            .unwrap();
        assert!(resp.results.is_empty());
        assert!(!resp.is_valid);
    }

    #[tokio::test]
    async fn test_ranking_is_stable() {
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![1.0, 0.0])),
            RetrievalParams::default(),
        );
        let req = request("protein creatine", SearchMethod::Hybrid);
        let a = retriever.search(&req).await.unwrap();
        let b = retriever.search(&req).await.unwrap();
        let refs = |r: &RagResponse| {
            r.results
                .iter()
                .map(|x| x.chunk_ref.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(refs(&a), refs(&b));
    }

    #[tokio::test]
    async fn test_hybrid_degrades_to_keyword_on_embed_failure() {
        let observer = Arc::new(MemoryObserver::new());
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::failing()),
            RetrievalParams::default(),
        )
        .with_observer(observer.clone());

        let resp = retriever
            .search(&request("creatine", SearchMethod::Hybrid))
            .await
            .unwrap();
        assert_eq!(resp.method, SearchMethod::Keyword);
        assert_eq!(resp.results[0].chunk_ref.document_id, "creatine");

        let embeds = observer.embeds();
        assert_eq!(embeds.len(), 1);
        assert!(!embeds[0].ok);
    }

    #[tokio::test]
    async fn test_semantic_embed_failure_is_error() {
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::failing()),
            RetrievalParams::default(),
        );
        let err = retriever
            .search(&request("creatine", SearchMethod::Semantic))
            .await
            .unwrap_err();
        let ctx = err.downcast_ref::<ContextError>().unwrap();
        assert!(matches!(ctx, ContextError::EmbeddingCallFailed { .. }));
    }

    #[tokio::test]
    async fn test_context_budget_keeps_whole_chunks() {
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![1.0, 0.0])),
            RetrievalParams::default(),
        );
        let mut req = request("creatine", SearchMethod::Hybrid);
        req.context_char_budget = 70;
        let resp = retriever.search(&req).await.unwrap();
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.context_chunks, 1);
        assert_eq!(
            resp.context,
            "[Creatine]\nLoading phases are optional for most lifters."
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_embedding() {
        let provider = Arc::new(FixedProvider::new(vec![1.0, 0.0]));
        let observer = Arc::new(MemoryObserver::new());
        let cache = Arc::new(QueryCache::new(Duration::from_secs(60), 8));
        let retriever = Retriever::new(corpus().await, provider.clone(), RetrievalParams::default())
            .with_observer(observer.clone())
            .with_cache(cache);

        let req = request("creatine", SearchMethod::Hybrid);
        let first = retriever.search(&req).await.unwrap();
        let second = retriever.search(&request("  CREATINE ", SearchMethod::Hybrid)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.results, second.results);

        let events = observer.searches();
        assert_eq!(events.len(), 2);
        assert!(!events[0].cache_hit);
        assert!(events[1].cache_hit);

        retriever.invalidate_cache();
        retriever.search(&req).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hybrid_fetches_at_least_max_results_vectors() {
        let params = RetrievalParams {
            candidate_k: 1,
            ..RetrievalParams::default()
        };
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![1.0, 0.0])),
            params,
        );
        // No lexical overlap, so every result comes from the vector side.
        let hybrid = retriever
            .search(&request("ashwagandha", SearchMethod::Hybrid))
            .await
            .unwrap();
        let semantic = retriever
            .search(&request("ashwagandha", SearchMethod::Semantic))
            .await
            .unwrap();
        assert_eq!(hybrid.results.len(), 2);
        assert_eq!(semantic.results.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_query() {
        let observer = Arc::new(MemoryObserver::new());
        let retriever = Retriever::new(
            corpus().await,
            Arc::new(FixedProvider::new(vec![1.0, 0.0])),
            RetrievalParams::default(),
        )
        .with_observer(observer.clone());
        let resp = retriever
            .search(&request("   ", SearchMethod::Hybrid))
            .await
            .unwrap();
        assert!(resp.results.is_empty());
        assert!(!resp.is_valid);
        assert_eq!(observer.searches().len(), 1);
    }
}
