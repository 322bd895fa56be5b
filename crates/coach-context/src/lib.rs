//! # Coach Context
//!
//! **Context assembly for an LLM fitness coach.**
//!
//! Before each model call the prompt layer asks this crate for two blocks
//! of text: the knowledge passages most relevant to the user's message,
//! and the slice of conversation history that fits the token budget.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Documents  │──▶│ Chunk+Embed  │──▶│  SQLite  │
//! │  (JSON)    │   │  (reembed)   │   │  chunks  │
//! └────────────┘   └──────────────┘   └────┬─────┘
//!                                          │
//!            ┌─────────────────────────────┤
//!            ▼                             ▼
//!     ┌─────────────┐   ┌──────────┐  ┌──────────┐
//!     │  Retriever  │──▶│ Formatter│◀─│ Windower │
//!     └─────────────┘   └────┬─────┘  └──────────┘
//!                            ▼
//!                  CLI (coachctx) / HTTP
//! ```
//!
//! ## Data Flow
//!
//! 1. Authored knowledge documents are upserted and split into chunks
//!    ([`coach_context_core::chunk`]).
//! 2. The backfill job ([`reembed`]) embeds each chunk through the
//!    configured provider ([`embedding`]) and atomically replaces the
//!    document's chunk set in SQLite ([`sqlite_store`]).
//! 3. Per turn, the retriever ([`coach_context_core::search`]) ranks chunks
//!    by semantic, keyword, or hybrid score and packs whole chunks into a
//!    character budget.
//! 4. The windower ([`coach_context_core::window`]) keeps the most recent
//!    turns that fit the token budget, plus an optional rolling summary.
//! 5. The formatter ([`coach_context_core::format`]) renders both into
//!    delimited blocks with a trace. [`engine::Engine`] wires it all.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite `KnowledgeStore` |
//! | [`embedding`] | Embedding providers and paced batch embedder |
//! | [`reembed`] | Backfill job |
//! | [`search_log`] | Search analytics persisted to SQLite |
//! | [`engine`] | Long-lived wiring shared by CLI and server |
//! | [`documents`] | `docs add` / `docs list` |
//! | [`search`] | `search` command output |
//! | [`context`] | `context` command |
//! | [`server`] | HTTP API |

pub mod config;
pub mod context;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod engine;
pub mod migrate;
pub mod reembed;
pub mod search;
pub mod search_log;
pub mod server;
pub mod sqlite_store;

pub use coach_context_core::{
    chunk, error, format, lexical, models, observe, store, window,
};
