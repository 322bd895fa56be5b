//! Knowledge document management: `coachctx docs add|list`.
//!
//! Added documents are upserted and immediately re-chunked. With an
//! embedding provider configured, the new chunks are embedded through the
//! backfill job; otherwise they are stored without vectors, which keeps
//! keyword search working until a later `reembed missing`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use coach_context_core::chunk::build_chunks;
use coach_context_core::models::KnowledgeDocument;
use coach_context_core::store::KnowledgeStore;

use crate::engine::Engine;
use crate::reembed::ReembedReport;

/// A JSON file holds either one document or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentFile {
    Many(Vec<KnowledgeDocument>),
    One(KnowledgeDocument),
}

/// Parse a documents file body.
pub fn parse_documents(json: &str) -> Result<Vec<KnowledgeDocument>> {
    let parsed: DocumentFile =
        serde_json::from_str(json).with_context(|| "Failed to parse documents JSON")?;
    let docs = match parsed {
        DocumentFile::Many(docs) => docs,
        DocumentFile::One(doc) => vec![doc],
    };
    for doc in &docs {
        if doc.id.trim().is_empty() {
            anyhow::bail!("document id must not be empty");
        }
    }
    Ok(docs)
}

/// Upsert documents and rebuild their chunk sets.
pub async fn add_documents(engine: &Engine, docs: &[KnowledgeDocument]) -> Result<ReembedReport> {
    let store = engine.store();
    for doc in docs {
        store.upsert_document(doc).await?;
    }
    let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();

    if engine.config().embedding.is_enabled() {
        return Ok(engine.reembed_ids(&ids).await);
    }

    let max_chars = engine.config().chunking.max_chars;
    let mut report = ReembedReport {
        total: docs.len(),
        ..ReembedReport::default()
    };
    for doc in docs {
        let chunks = build_chunks(doc, max_chars);
        store.replace_chunks(&doc.id, &chunks).await?;
        report.processed += 1;
        info!(document_id = %doc.id, chunks = chunks.len(), "document chunked without embeddings");
    }
    engine.retriever().invalidate_cache();
    Ok(report)
}

/// CLI entry point for `coachctx docs add <file>`.
pub async fn run_docs_add(engine: &Engine, path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read documents file: {}", path.display()))?;
    let docs = parse_documents(&json)?;
    let report = add_documents(engine, &docs).await?;

    println!("docs add {}", path.display());
    println!("  documents: {}", report.total);
    println!("  processed: {}", report.processed);
    println!("  failed: {}", report.failed);
    if engine.config().embedding.is_enabled() {
        println!("  chunks embedded: {}", report.chunks_embedded);
        println!("  chunks failed: {}", report.chunks_failed);
    } else {
        println!(
            "  embeddings disabled; run `coachctx reembed missing` once a provider is configured"
        );
    }
    Ok(())
}

/// CLI entry point for `coachctx docs list`.
pub async fn run_docs_list(engine: &Engine) -> Result<()> {
    let docs = engine.store().list_documents().await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    println!(
        "{:<24} {:<16} {:<14} {:>6}  TITLE",
        "ID", "OWNER", "CATEGORY", "CHUNKS"
    );
    for doc in &docs {
        let chunks = engine.store().chunks_for_document(&doc.id).await?;
        println!(
            "{:<24} {:<16} {:<14} {:>6}  {}",
            doc.id,
            doc.owner_tag,
            doc.category,
            chunks.len(),
            doc.title
        );
    }
    Ok(())
}
