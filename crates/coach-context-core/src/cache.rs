//! Injected cache for repeated knowledge queries.
//!
//! Backed by `mini_moka::sync::Cache`: entries expire `ttl` after insertion
//! and the entry count is bounded by `max_entries`. The cache is owned by
//! whoever builds the [`Retriever`](crate::search::Retriever) and is never
//! global, so tests can build and drop one freely.

use std::time::Duration;

use mini_moka::sync::{Cache, ConcurrentCacheExt};

use crate::models::{RagResponse, SearchMethod};

/// Everything that can change a retrieval response for a fixed corpus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    query: String,
    owner_tag: Option<String>,
    method: SearchMethod,
    max_results: usize,
    context_char_budget: usize,
}

impl QueryKey {
    /// Build a key; the query is lowercased and whitespace-collapsed.
    pub fn new(
        query: &str,
        owner_tag: Option<&str>,
        method: SearchMethod,
        max_results: usize,
        context_char_budget: usize,
    ) -> Self {
        Self {
            query: query
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase(),
            owner_tag: owner_tag.map(str::to_string),
            method,
            max_results,
            context_char_budget,
        }
    }
}

/// Cache of finished retrieval responses.
pub struct QueryCache {
    inner: Cache<QueryKey, RagResponse>,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries as u64)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<RagResponse> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: QueryKey, value: RagResponse) {
        self.inner.insert(key, value);
    }

    /// Drop every entry. Takes effect for all subsequent lookups.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
        self.inner.sync();
    }

    /// Number of live entries after pending maintenance is applied.
    pub fn entry_count(&self) -> u64 {
        self.inner.sync();
        self.inner.entry_count()
    }
}
