//! Error kinds callers need to branch on.
//!
//! Everything else propagates as `anyhow::Error`.

use thiserror::Error;

/// Why a single embedding call failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbedError {
    #[error("embedding API error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    #[error("expected {expected}-dimensional vector, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding provider is disabled")]
    Disabled,
}

/// Engine-level error kinds.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A single sentence is longer than the chunk limit. Recovered by truncation.
    #[error("sentence of {sentence_chars} chars exceeds chunk limit of {max_chars}")]
    ChunkTooLarge {
        sentence_chars: usize,
        max_chars: usize,
    },

    #[error("embedding call failed for {target}: {source}")]
    EmbeddingCallFailed {
        target: String,
        #[source]
        source: EmbedError,
    },

    /// The atomic chunk replacement did not complete; the old set is intact.
    #[error("store write failed for document {document_id}: {reason}")]
    StoreWriteFailed { document_id: String, reason: String },
}

impl ContextError {
    pub fn store_write(document_id: &str, reason: impl ToString) -> Self {
        ContextError::StoreWriteFailed {
            document_id: document_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
