//! Persistent search log.
//!
//! [`SqliteSearchLog`] writes one `search_logs` row per search. Each write
//! runs on its own tokio task; the search that produced the event never
//! waits on it, and insert errors are only logged. Pending writes are
//! tracked so [`SqliteSearchLog::flush`] can drain them before the pool
//! closes.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::task::TaskTracker;
use tracing::warn;

use coach_context_core::observe::{RetrievalObserver, SearchEvent};

pub struct SqliteSearchLog {
    pool: SqlitePool,
    pending: TaskTracker,
}

impl SqliteSearchLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pending: TaskTracker::new(),
        }
    }

    /// Wait for every write spawned so far.
    pub async fn flush(&self) {
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl RetrievalObserver for SqliteSearchLog {
    fn on_search(&self, event: &SearchEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, search log entry dropped");
            return;
        };
        let pool = self.pool.clone();
        let event = event.clone();
        self.pending.spawn_on(
            async move {
                if let Err(e) = insert_search_log(&pool, &event).await {
                    warn!(error = %e, "failed to write search log");
                }
            },
            &handle,
        );
    }
}

pub async fn insert_search_log(pool: &SqlitePool, event: &SearchEvent) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO search_logs (created_at, search_method, results_count, response_time_ms,
                                 relevance_score, context_length, is_valid, cache_hit)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(event.search_method.as_str())
    .bind(event.results_count as i64)
    .bind(event.response_time_ms as i64)
    .bind(event.relevance_score)
    .bind(event.context_length as i64)
    .bind(event.is_valid)
    .bind(event.cache_hit)
    .execute(pool)
    .await?;
    Ok(())
}
