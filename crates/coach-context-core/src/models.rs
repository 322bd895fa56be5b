//! Core data models used throughout the context engine.
//!
//! These types represent the knowledge documents, chunks, conversation
//! turns, and per-request results that flow through retrieval and
//! windowing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version of [`ChunkMetadata`].
pub const CHUNK_METADATA_VERSION: u32 = 1;

/// One authored unit of domain knowledge.
///
/// Read-only to the retrieval path. Editing the body requires a re-embed
/// of the document so its chunk set matches the new text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    /// Persona or domain the document belongs to (e.g. `"nutrition-coach"`).
    pub owner_tag: String,
    pub title: String,
    pub body: String,
    pub category: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Denormalized document fields copied onto every chunk.
///
/// Lets the store filter and label chunks without joining back to the
/// owning document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub version: u32,
    pub title: String,
    pub category: String,
    pub owner_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl ChunkMetadata {
    pub fn from_document(doc: &KnowledgeDocument) -> Self {
        Self {
            version: CHUNK_METADATA_VERSION,
            title: doc.title.clone(),
            category: doc.category.clone(),
            owner_tag: doc.owner_tag.clone(),
            subtype: doc.subtype.clone(),
        }
    }
}

/// A contiguous slice of a document's body.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeChunk {
    pub id: String,
    pub document_id: String,
    /// 0-based, contiguous within `document_id`.
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    /// `None` when the embedding call for this chunk failed.
    pub embedding: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
}

impl KnowledgeChunk {
    pub fn chunk_ref(&self) -> ChunkRef {
        ChunkRef {
            document_id: self.document_id.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// Stable reference to a chunk: owning document plus position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkRef {
    pub document_id: String,
    pub chunk_index: i64,
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document_id, self.chunk_index)
    }
}

/// A chunk paired with its cosine similarity to a query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub similarity: f64,
}

/// Optional restriction applied to store lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkFilter {
    #[serde(default)]
    pub owner_tag: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl ChunkFilter {
    pub fn owner(owner_tag: impl Into<String>) -> Self {
        Self {
            owner_tag: Some(owner_tag.into()),
            category: None,
        }
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        let owner_ok = self
            .owner_tag
            .as_deref()
            .map_or(true, |o| o == metadata.owner_tag);
        let category_ok = self
            .category
            .as_deref()
            .map_or(true, |c| c == metadata.category);
        owner_ok && category_ok
    }
}

/// One user/agent exchange. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_message: String,
    pub agent_response: String,
    pub created_at: DateTime<Utc>,
}

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Semantic => "semantic",
            SearchMethod::Keyword => "keyword",
            SearchMethod::Hybrid => "hybrid",
        }
    }

    /// Whether this method needs a query embedding.
    pub fn uses_embeddings(&self) -> bool {
        !matches!(self, SearchMethod::Keyword)
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMethod::Semantic),
            "keyword" => Ok(SearchMethod::Keyword),
            "hybrid" => Ok(SearchMethod::Hybrid),
            other => anyhow::bail!(
                "Unknown search method: {}. Use semantic, keyword, or hybrid.",
                other
            ),
        }
    }
}

/// A single ranked passage returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_ref: ChunkRef,
    pub text: String,
    pub similarity_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    pub combined_score: f64,
    pub source_title: String,
    pub source_category: String,
    pub owner_tag: String,
}

/// The full answer to one knowledge query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagResponse {
    pub query: String,
    pub method: SearchMethod,
    /// Ranked results, already truncated to `max_results`.
    pub results: Vec<RetrievalResult>,
    /// Whole results concatenated up to the character budget.
    pub context: String,
    /// How many leading results made it into `context`.
    pub context_chunks: usize,
    /// False when there are no results or the best one is below the relevance floor.
    pub is_valid: bool,
    pub top_score: f64,
    pub response_time_ms: u64,
}

impl RagResponse {
    pub fn empty(query: &str, method: SearchMethod) -> Self {
        Self {
            query: query.to_string(),
            method,
            results: Vec::new(),
            context: String::new(),
            context_chunks: 0,
            is_valid: false,
            top_score: 0.0,
            response_time_ms: 0,
        }
    }
}

/// The trimmed conversation window computed for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowResult {
    /// Chronological (oldest first) contiguous suffix of the input.
    pub selected_turns: Vec<ConversationTurn>,
    pub tokens_used: usize,
    pub trimmed_count: usize,
    /// Summary text as included, possibly truncated to its sub-budget.
    pub summary_included: Option<String>,
    pub summary_tokens: usize,
    pub summary_truncated: bool,
    /// The token budget the window was built against.
    pub max_tokens: usize,
    /// True when the recency floor pushed `tokens_used` past `max_tokens`.
    pub over_budget: bool,
}
