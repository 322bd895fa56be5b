//! Long-lived wiring of store, embedding provider, observer, and retriever.
//!
//! [`Engine`] is built once per process (CLI invocation or server) from
//! the config and shared by every command and HTTP handler, so the query
//! cache survives across requests.

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use coach_context_core::cache::QueryCache;
use coach_context_core::embedding::EmbeddingProvider;
use coach_context_core::format::{assemble, FormattedContext};
use coach_context_core::models::{ConversationTurn, RagResponse, SearchMethod, WindowResult};
use coach_context_core::observe::{FanoutObserver, RetrievalObserver, TracingObserver};
use coach_context_core::search::{Retriever, SearchRequest};
use coach_context_core::window::build_window;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_provider, BatchEmbedder};
use crate::migrate::migrate;
use crate::reembed::{ReembedJob, ReembedOptions, ReembedReport, ReembedTarget};
use crate::search_log::SqliteSearchLog;
use crate::sqlite_store::SqliteStore;

/// Optional per-call overrides of the configured retrieval defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    #[serde(default)]
    pub owner_tag: Option<String>,
    #[serde(default)]
    pub method: Option<SearchMethod>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub context_char_budget: Option<usize>,
}

/// Inputs for one full context assembly.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextRequest {
    /// The user's current message; retrieval is skipped when absent or blank.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default, flatten)]
    pub search: SearchOptions,
    /// Conversation history, oldest first.
    #[serde(default)]
    pub turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

pub struct Engine {
    config: Config,
    pool: SqlitePool,
    store: Arc<SqliteStore>,
    provider: Arc<dyn EmbeddingProvider>,
    observer: Arc<dyn RetrievalObserver>,
    search_log: Arc<SqliteSearchLog>,
    retriever: Retriever,
}

impl Engine {
    /// Connect, migrate, and build the configured provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate(&pool).await?;
        let provider = create_provider(&config.embedding)?;
        Ok(Self::with_provider(config, pool, provider))
    }

    /// Build on an existing, migrated pool with an explicit provider.
    pub fn with_provider(
        config: &Config,
        pool: SqlitePool,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let store = Arc::new(SqliteStore::new(pool.clone()).with_model(provider.model_name()));
        let search_log = Arc::new(SqliteSearchLog::new(pool.clone()));
        let observer: Arc<dyn RetrievalObserver> = Arc::new(FanoutObserver::new(vec![
            Arc::new(TracingObserver),
            search_log.clone(),
        ]));

        let r = &config.retrieval;
        let mut retriever = Retriever::new(store.clone(), provider.clone(), r.params())
            .with_observer(observer.clone());
        if r.cache_max_entries > 0 {
            retriever = retriever.with_cache(Arc::new(QueryCache::new(
                Duration::from_secs(r.cache_ttl_secs),
                r.cache_max_entries,
            )));
        }

        Self {
            config: config.clone(),
            pool,
            store,
            provider,
            observer,
            search_log,
            retriever,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<RagResponse> {
        let r = &self.config.retrieval;
        self.retriever
            .search(&SearchRequest {
                query,
                owner_tag: opts.owner_tag.as_deref(),
                method: opts.method.unwrap_or(r.default_method),
                max_results: opts.max_results.unwrap_or(r.max_results),
                context_char_budget: opts.context_char_budget.unwrap_or(r.context_char_budget),
            })
            .await
    }

    pub fn window(
        &self,
        turns: &[ConversationTurn],
        summary: Option<&str>,
        max_tokens: Option<usize>,
    ) -> WindowResult {
        let max_tokens = max_tokens.unwrap_or(self.config.window.max_tokens);
        let window = build_window(turns, summary, max_tokens, &self.config.window.policy());
        if window.over_budget {
            info!(
                tokens_used = window.tokens_used,
                max_tokens = window.max_tokens,
                selected_turns = window.selected_turns.len(),
                "conversation window exceeds budget at recency floor"
            );
        }
        window
    }

    /// Retrieve, window, and format in one call.
    ///
    /// A failed retrieval is logged and the context is built without
    /// knowledge rather than failing the request.
    pub async fn context(&self, req: &ContextRequest) -> Result<FormattedContext> {
        let retrieval = match req.query.as_deref().filter(|q| !q.trim().is_empty()) {
            Some(q) => match self.search(q, &req.search).await {
                Ok(resp) => Some(resp),
                Err(e) => {
                    warn!(error = %e, "retrieval failed, continuing without knowledge");
                    None
                }
            },
            None => None,
        };

        let window = self.window(&req.turns, req.summary.as_deref(), req.max_tokens);
        Ok(assemble(retrieval.as_ref(), &window, Utc::now()))
    }

    pub fn reembed_job(&self) -> ReembedJob {
        let e = &self.config.embedding;
        let embedder = BatchEmbedder::new(self.provider.clone(), e.call_delay())
            .with_observer(self.observer.clone());
        ReembedJob::new(
            self.store.clone(),
            embedder,
            ReembedOptions {
                max_chars: self.config.chunking.max_chars,
                concurrency: e.concurrency,
                batch_pause: e.batch_pause(),
            },
        )
    }

    /// Run a backfill and drop cached responses if anything was rewritten.
    pub async fn reembed(&self, target: &ReembedTarget) -> Result<ReembedReport> {
        let report = self.reembed_job().run(target).await?;
        if report.processed > 0 {
            self.retriever.invalidate_cache();
        }
        Ok(report)
    }

    pub async fn reembed_ids(&self, ids: &[String]) -> ReembedReport {
        let report = self.reembed_job().run_ids(ids).await;
        if report.processed > 0 {
            self.retriever.invalidate_cache();
        }
        report
    }

    /// Wait for queued search-log writes to land.
    pub async fn flush_search_log(&self) {
        self.search_log.flush().await;
    }

    /// Drain pending search-log writes, then close the pool.
    pub async fn close(self) {
        self.search_log.flush().await;
        self.pool.close().await;
    }
}
