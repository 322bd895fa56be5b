//! Observability sink for search and embedding calls.
//!
//! Every component reports through one injected [`RetrievalObserver`].
//! Observer methods are synchronous and infallible: a sink that does I/O
//! must hand the work off (e.g. spawn a task) and deal with its own
//! errors, so recording can never block or fail the operation it observes.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::models::SearchMethod;

/// One completed knowledge search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchEvent {
    pub search_method: SearchMethod,
    pub results_count: usize,
    pub response_time_ms: u64,
    /// Top combined score, `0.0` when there are no results.
    pub relevance_score: f64,
    pub context_length: usize,
    pub is_valid: bool,
    pub cache_hit: bool,
}

/// One embedding call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedEvent {
    /// What was embedded, e.g. `"doc-1#3"` or `"query"`.
    pub target: String,
    pub ok: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub trait RetrievalObserver: Send + Sync {
    fn on_search(&self, event: &SearchEvent);

    fn on_embed(&self, _event: &EmbedEvent) {}
}

/// Discards everything.
pub struct NoopObserver;

impl RetrievalObserver for NoopObserver {
    fn on_search(&self, _event: &SearchEvent) {}
}

/// Emits events as `tracing` records.
pub struct TracingObserver;

impl RetrievalObserver for TracingObserver {
    fn on_search(&self, e: &SearchEvent) {
        info!(
            search_method = %e.search_method,
            results_count = e.results_count,
            response_time_ms = e.response_time_ms,
            relevance_score = e.relevance_score,
            context_length = e.context_length,
            is_valid = e.is_valid,
            cache_hit = e.cache_hit,
            "knowledge search"
        );
    }

    fn on_embed(&self, e: &EmbedEvent) {
        if e.ok {
            info!(target_ref = %e.target, elapsed_ms = e.elapsed_ms, "embedded");
        } else {
            warn!(
                target_ref = %e.target,
                elapsed_ms = e.elapsed_ms,
                error = e.error.as_deref().unwrap_or(""),
                "embedding failed"
            );
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemoryObserver {
    searches: Mutex<Vec<SearchEvent>>,
    embeds: Mutex<Vec<EmbedEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn searches(&self) -> Vec<SearchEvent> {
        self.searches
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn embeds(&self) -> Vec<EmbedEvent> {
        self.embeds.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl RetrievalObserver for MemoryObserver {
    fn on_search(&self, event: &SearchEvent) {
        if let Ok(mut g) = self.searches.lock() {
            g.push(event.clone());
        }
    }

    fn on_embed(&self, event: &EmbedEvent) {
        if let Ok(mut g) = self.embeds.lock() {
            g.push(event.clone());
        }
    }
}

/// Forwards each event to several sinks in order.
pub struct FanoutObserver {
    sinks: Vec<Arc<dyn RetrievalObserver>>,
}

impl FanoutObserver {
    pub fn new(sinks: Vec<Arc<dyn RetrievalObserver>>) -> Self {
        Self { sinks }
    }
}

impl RetrievalObserver for FanoutObserver {
    fn on_search(&self, event: &SearchEvent) {
        for s in &self.sinks {
            s.on_search(event);
        }
    }

    fn on_embed(&self, event: &EmbedEvent) {
        for s in &self.sinks {
            s.on_embed(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> SearchEvent {
        SearchEvent {
            search_method: SearchMethod::Hybrid,
            results_count: 2,
            response_time_ms: 12,
            relevance_score: 0.8,
            context_length: 300,
            is_valid: true,
            cache_hit: false,
        }
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemoryObserver::new());
        let b = Arc::new(MemoryObserver::new());
        let fan = FanoutObserver::new(vec![a.clone(), b.clone(), Arc::new(NoopObserver)]);
        fan.on_search(&event());
        fan.on_embed(&EmbedEvent {
            target: "d#0".to_string(),
            ok: true,
            elapsed_ms: 3,
            error: None,
        });
        assert_eq!(a.searches(), vec![event()]);
        assert_eq!(b.searches().len(), 1);
        assert_eq!(b.embeds().len(), 1);
    }
}
