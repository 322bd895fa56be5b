//! # Coach Context Core
//!
//! Pure logic for the coach context engine: data models, chunking,
//! lexical scoring, the store and embedding abstractions, the retriever,
//! conversation windowing, and final context formatting.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Concrete backends live in the `coach-context` app crate.

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod format;
pub mod lexical;
pub mod models;
pub mod observe;
pub mod search;
pub mod store;
pub mod window;
