//! Final context assembly for the prompt layer.
//!
//! [`assemble`] merges a retrieval response and a conversation window into
//! two delimited text blocks plus a machine-readable [`ContextTrace`]. The
//! trace is for debugging and audit only; nothing reads it back.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ChunkRef, RagResponse, SearchMethod, WindowResult};

pub const KNOWLEDGE_OPEN: &str = "[KNOWLEDGE]";
pub const KNOWLEDGE_CLOSE: &str = "[/KNOWLEDGE]";
pub const HISTORY_OPEN: &str = "[CONVERSATION HISTORY]";
pub const HISTORY_CLOSE: &str = "[/CONVERSATION HISTORY]";

/// What the prompt layer receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedContext {
    /// Present only when retrieval was valid and produced context.
    pub knowledge_block: Option<String>,
    /// Present when there is a summary or at least one turn.
    pub history_block: Option<String>,
    pub trace: ContextTrace,
}

impl FormattedContext {
    /// Both blocks, in order, separated by a blank line.
    pub fn render(&self) -> String {
        [self.knowledge_block.as_deref(), self.history_block.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextTrace {
    pub generated_at: DateTime<Utc>,
    pub retrieval: Option<RetrievalTrace>,
    pub knowledge_included: bool,
    pub window: WindowTrace,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalTrace {
    pub query: String,
    pub search_method: SearchMethod,
    pub is_valid: bool,
    pub top_score: f64,
    pub context_chunks: usize,
    pub context_chars: usize,
    pub response_time_ms: u64,
    pub results: Vec<ResultTrace>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTrace {
    pub chunk_ref: ChunkRef,
    pub similarity_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    pub combined_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowTrace {
    pub selected_turns: usize,
    pub trimmed_count: usize,
    pub tokens_used: usize,
    pub max_tokens: usize,
    pub summary_tokens: usize,
    pub summary_truncated: bool,
    pub over_budget: bool,
}

/// Build the prompt context; `now` anchors the relative time labels.
pub fn assemble(
    retrieval: Option<&RagResponse>,
    window: &WindowResult,
    now: DateTime<Utc>,
) -> FormattedContext {
    let knowledge_block = retrieval
        .filter(|r| r.is_valid && !r.context.is_empty())
        .map(|r| format!("{}\n{}\n{}", KNOWLEDGE_OPEN, r.context, KNOWLEDGE_CLOSE));

    let history_block = history_block(window, now);

    let trace = ContextTrace {
        generated_at: now,
        retrieval: retrieval.map(retrieval_trace),
        knowledge_included: knowledge_block.is_some(),
        window: WindowTrace {
            selected_turns: window.selected_turns.len(),
            trimmed_count: window.trimmed_count,
            tokens_used: window.tokens_used,
            max_tokens: window.max_tokens,
            summary_tokens: window.summary_tokens,
            summary_truncated: window.summary_truncated,
            over_budget: window.over_budget,
        },
    };

    FormattedContext {
        knowledge_block,
        history_block,
        trace,
    }
}

fn history_block(window: &WindowResult, now: DateTime<Utc>) -> Option<String> {
    if window.summary_included.is_none() && window.selected_turns.is_empty() {
        return None;
    }

    let mut parts: Vec<String> = vec![HISTORY_OPEN.to_string()];
    if let Some(summary) = &window.summary_included {
        parts.push(format!("Summary of earlier conversation:\n{}", summary));
    }
    for turn in &window.selected_turns {
        parts.push(format!(
            "({})\nUser: {}\nCoach: {}",
            relative_time(turn.created_at, now),
            turn.user_message,
            turn.agent_response
        ));
    }
    parts.push(HISTORY_CLOSE.to_string());
    Some(parts.join("\n\n"))
}

fn retrieval_trace(r: &RagResponse) -> RetrievalTrace {
    RetrievalTrace {
        query: r.query.clone(),
        search_method: r.method,
        is_valid: r.is_valid,
        top_score: r.top_score,
        context_chunks: r.context_chunks,
        context_chars: r.context.chars().count(),
        response_time_ms: r.response_time_ms,
        results: r
            .results
            .iter()
            .map(|x| ResultTrace {
                chunk_ref: x.chunk_ref.clone(),
                similarity_score: x.similarity_score,
                lexical_score: x.lexical_score,
                combined_score: x.combined_score,
            })
            .collect(),
    }
}

/// Coarse label such as `"5 minutes ago"`. Future times read as `"just now"`.
pub fn relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let (n, unit) = if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86_400, "day")
    };
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}
