//! Knowledge backfill: re-chunk and re-embed documents.
//!
//! [`ReembedJob::run`] resolves a [`ReembedTarget`] to document ids and
//! processes them in batches of `concurrency` documents. Documents in a
//! batch run concurrently; chunks within a document are embedded one at a
//! time with the configured inter-call delay. A fixed pause separates
//! batches.
//!
//! # Outcome per document
//!
//! | Embedding result | Store write | Counted as |
//! |------------------|-------------|------------|
//! | every chunk ok | chunk set replaced | `processed` |
//! | some chunks failed | replaced, failed chunks stored without vectors | `processed` (failures listed) |
//! | every chunk failed | skipped, old set kept | `failed` |
//! | any | atomic replace failed, old set kept | `failed` |
//!
//! Chunks stored without vectors are picked up again by the `missing`
//! target. Re-running the job on unchanged documents rewrites identical
//! chunk sets, so it is safe to repeat.

use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use coach_context_core::chunk::build_chunks;
use coach_context_core::error::ContextError;
use coach_context_core::store::KnowledgeStore;

use crate::embedding::BatchEmbedder;
use crate::engine::Engine;

/// Which documents a backfill run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReembedTarget {
    Document(String),
    All,
    /// Documents with no chunks, plus documents with chunks lacking vectors.
    Missing,
}

impl FromStr for ReembedTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => bail!("reembed target must not be empty"),
            "all" => Ok(ReembedTarget::All),
            "missing" => Ok(ReembedTarget::Missing),
            id => Ok(ReembedTarget::Document(id.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Load,
    Embed,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReembedFailure {
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<i64>,
    pub stage: FailureStage,
    pub reason: String,
}

/// Partial-success summary of one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReembedReport {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub chunks_embedded: usize,
    pub chunks_failed: usize,
    pub failures: Vec<ReembedFailure>,
}

impl ReembedReport {
    /// Whether any atomic chunk replacement failed.
    pub fn has_store_failures(&self) -> bool {
        self.failures.iter().any(|f| f.stage == FailureStage::Store)
    }
}

#[derive(Debug, Clone)]
pub struct ReembedOptions {
    pub max_chars: usize,
    pub concurrency: usize,
    pub batch_pause: Duration,
}

#[derive(Default)]
struct DocOutcome {
    written: bool,
    chunks_embedded: usize,
    chunks_failed: usize,
    failures: Vec<ReembedFailure>,
}

pub struct ReembedJob {
    store: Arc<dyn KnowledgeStore>,
    embedder: BatchEmbedder,
    options: ReembedOptions,
}

impl ReembedJob {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        embedder: BatchEmbedder,
        options: ReembedOptions,
    ) -> Self {
        Self {
            store,
            embedder,
            options,
        }
    }

    /// Document ids covered by `target`, sorted.
    pub async fn resolve(&self, target: &ReembedTarget) -> Result<Vec<String>> {
        match target {
            ReembedTarget::Document(id) => Ok(vec![id.clone()]),
            ReembedTarget::All => Ok(self
                .store
                .list_documents()
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect()),
            ReembedTarget::Missing => {
                let mut ids: BTreeSet<String> =
                    self.store.all_missing_embeddings().await?.into_iter().collect();
                ids.extend(self.store.incomplete_embeddings().await?);
                Ok(ids.into_iter().collect())
            }
        }
    }

    pub async fn run(&self, target: &ReembedTarget) -> Result<ReembedReport> {
        let ids = self.resolve(target).await?;
        info!(target_kind = ?target, documents = ids.len(), "reembed target resolved");
        Ok(self.run_ids(&ids).await)
    }

    /// Re-embed exactly these documents.
    pub async fn run_ids(&self, ids: &[String]) -> ReembedReport {
        let mut report = ReembedReport {
            total: ids.len(),
            ..ReembedReport::default()
        };

        info!(
            documents = ids.len(),
            model = self.embedder.provider().model_name(),
            "reembed started"
        );

        let width = self.options.concurrency.max(1);
        for (n, batch) in ids.chunks(width).enumerate() {
            if n > 0 && !self.options.batch_pause.is_zero() {
                tokio::time::sleep(self.options.batch_pause).await;
            }

            let outcomes = join_all(batch.iter().map(|id| self.reembed_document(id))).await;

            for outcome in outcomes {
                if outcome.written {
                    report.processed += 1;
                } else {
                    report.failed += 1;
                }
                report.chunks_embedded += outcome.chunks_embedded;
                report.chunks_failed += outcome.chunks_failed;
                report.failures.extend(outcome.failures);
            }
        }

        info!(
            total = report.total,
            processed = report.processed,
            failed = report.failed,
            chunks_embedded = report.chunks_embedded,
            chunks_failed = report.chunks_failed,
            "reembed finished"
        );

        report
    }

    async fn reembed_document(&self, document_id: &str) -> DocOutcome {
        let mut outcome = DocOutcome::default();

        let doc = match self.store.get_document(document_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                outcome.failures.push(failure(
                    document_id,
                    None,
                    FailureStage::Load,
                    "document not found",
                ));
                return outcome;
            }
            Err(e) => {
                outcome
                    .failures
                    .push(failure(document_id, None, FailureStage::Load, format!("{:#}", e)));
                return outcome;
            }
        };

        let mut chunks = build_chunks(&doc, self.options.max_chars);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let results = self.embedder.embed_batch(&doc.id, &texts).await;

        for (chunk, result) in chunks.iter_mut().zip(results) {
            match result {
                Ok(vec) => {
                    chunk.embedding = Some(vec);
                    outcome.chunks_embedded += 1;
                }
                Err(e) => {
                    let err = ContextError::EmbeddingCallFailed {
                        target: chunk.chunk_ref().to_string(),
                        source: e,
                    };
                    outcome.chunks_failed += 1;
                    outcome.failures.push(failure(
                        document_id,
                        Some(chunk.chunk_index),
                        FailureStage::Embed,
                        err.to_string(),
                    ));
                }
            }
        }

        if outcome.chunks_embedded == 0 {
            warn!(
                document_id,
                chunks = chunks.len(),
                "every chunk failed to embed, keeping old set"
            );
            return outcome;
        }

        match self.store.replace_chunks(document_id, &chunks).await {
            Ok(()) => {
                outcome.written = true;
                info!(
                    document_id,
                    chunks = chunks.len(),
                    chunks_failed = outcome.chunks_failed,
                    "document reembedded"
                );
            }
            Err(e) => {
                warn!(document_id, error = %e, "chunk replacement failed");
                outcome
                    .failures
                    .push(failure(document_id, None, FailureStage::Store, e.to_string()));
            }
        }

        outcome
    }
}

fn failure(
    document_id: &str,
    chunk_index: Option<i64>,
    stage: FailureStage,
    reason: impl Into<String>,
) -> ReembedFailure {
    ReembedFailure {
        document_id: document_id.to_string(),
        chunk_index,
        stage,
        reason: reason.into(),
    }
}

/// CLI entry point for `coachctx reembed <target>`.
pub async fn run_reembed(engine: &Engine, target: &str) -> Result<()> {
    if !engine.config().embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let target: ReembedTarget = target.parse()?;
    let report = engine.reembed(&target).await?;

    println!("reembed {}", describe(&target));
    println!("  documents: {}", report.total);
    println!("  processed: {}", report.processed);
    println!("  failed: {}", report.failed);
    println!("  chunks embedded: {}", report.chunks_embedded);
    println!("  chunks failed: {}", report.chunks_failed);
    for f in &report.failures {
        match f.chunk_index {
            Some(i) => println!("  ! {}#{} [{:?}] {}", f.document_id, i, f.stage, f.reason),
            None => println!("  ! {} [{:?}] {}", f.document_id, f.stage, f.reason),
        }
    }

    if report.has_store_failures() {
        bail!("one or more chunk replacements failed; previous chunk sets were kept");
    }
    Ok(())
}

/// CLI entry point for `coachctx missing`.
pub async fn run_missing(engine: &Engine) -> Result<()> {
    let store = engine.store();
    let missing = store.all_missing_embeddings().await?;
    let incomplete = store.incomplete_embeddings().await?;

    if missing.is_empty() && incomplete.is_empty() {
        println!("All documents are embedded.");
        return Ok(());
    }
    for id in &missing {
        println!("{}  (no chunks)", id);
    }
    for id in &incomplete {
        println!("{}  (chunks without vectors)", id);
    }
    Ok(())
}

fn describe(target: &ReembedTarget) -> &str {
    match target {
        ReembedTarget::Document(id) => id,
        ReembedTarget::All => "all",
        ReembedTarget::Missing => "missing",
    }
}
