//! SQLite-backed [`KnowledgeStore`] implementation.
//!
//! Documents live in `knowledge_documents`; each chunk row in
//! `knowledge_chunks` carries its text, JSON metadata, and an optional
//! little-endian f32 embedding BLOB. Vector search loads the filtered
//! embedded rows and ranks them by cosine similarity in process.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use coach_context_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use coach_context_core::error::ContextError;
use coach_context_core::models::{
    ChunkFilter, ChunkMetadata, KnowledgeChunk, KnowledgeDocument, ScoredChunk,
};
use coach_context_core::store::{sort_scored, validate_chunk_set, KnowledgeStore};

/// SQLite implementation of the [`KnowledgeStore`] trait.
///
/// When a model name is set, embeddings are tagged with it on write and
/// `nearest` only considers vectors from that model.
pub struct SqliteStore {
    pool: SqlitePool,
    model: Option<String>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, model: None }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn write_chunks(&self, document_id: &str, chunks: &[KnowledgeChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Delete first so the transaction takes the write lock up front.
        sqlx::query("DELETE FROM knowledge_chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM knowledge_documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            bail!("unknown document");
        }

        for chunk in chunks {
            let metadata = serde_json::to_string(&chunk.metadata)?;
            let blob = chunk.embedding.as_deref().map(vec_to_blob);
            let dims = chunk.embedding.as_ref().map(|v| v.len() as i64);
            let model = chunk.embedding.as_ref().and(self.model.as_deref());

            sqlx::query(
                r#"
                INSERT INTO knowledge_chunks (id, document_id, chunk_index, text, hash,
                                              owner_tag, category, metadata,
                                              embedding, model, dims)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(&chunk.metadata.owner_tag)
            .bind(&chunk.metadata.category)
            .bind(&metadata)
            .bind(blob)
            .bind(model)
            .bind(dims)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn document_from_row(row: &SqliteRow) -> KnowledgeDocument {
    let updated_at: i64 = row.get("updated_at");
    KnowledgeDocument {
        id: row.get("id"),
        owner_tag: row.get("owner_tag"),
        title: row.get("title"),
        body: row.get("body"),
        category: row.get("category"),
        subtype: row.get("subtype"),
        updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<KnowledgeChunk> {
    let id: String = row.get("id");
    let metadata: String = row.get("metadata");
    let metadata: ChunkMetadata = serde_json::from_str(&metadata)
        .with_context(|| format!("Corrupt metadata on chunk {}", id))?;
    let blob: Option<Vec<u8>> = row.get("embedding");

    Ok(KnowledgeChunk {
        id,
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        hash: row.get("hash"),
        embedding: blob.map(|b| blob_to_vec(&b)),
        metadata,
    })
}

const CHUNK_COLUMNS: &str =
    "id, document_id, chunk_index, text, hash, metadata, embedding";

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn upsert_document(&self, doc: &KnowledgeDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO knowledge_documents (id, owner_tag, title, body, category, subtype, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner_tag = excluded.owner_tag,
                title = excluded.title,
                body = excluded.body,
                category = excluded.category,
                subtype = excluded.subtype,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_tag)
        .bind(&doc.title)
        .bind(&doc.body)
        .bind(&doc.category)
        .bind(&doc.subtype)
        .bind(doc.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<KnowledgeDocument>> {
        let row = sqlx::query(
            "SELECT id, owner_tag, title, body, category, subtype, updated_at FROM knowledge_documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(document_from_row))
    }

    async fn list_documents(&self) -> Result<Vec<KnowledgeDocument>> {
        let rows = sqlx::query(
            "SELECT id, owner_tag, title, body, category, subtype, updated_at FROM knowledge_documents ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[KnowledgeChunk],
    ) -> Result<(), ContextError> {
        validate_chunk_set(document_id, chunks)?;
        self.write_chunks(document_id, chunks)
            .await
            .map_err(|e| ContextError::store_write(document_id, format!("{:#}", e)))
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM knowledge_chunks WHERE document_id = ? ORDER BY chunk_index ASC",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn nearest(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM knowledge_chunks
            WHERE embedding IS NOT NULL
              AND dims = ?
              AND (? IS NULL OR model = ?)
              AND (? IS NULL OR owner_tag = ?)
              AND (? IS NULL OR category = ?)
            "#,
            CHUNK_COLUMNS
        ))
        .bind(query_vec.len() as i64)
        .bind(self.model.as_deref())
        .bind(self.model.as_deref())
        .bind(filter.owner_tag.as_deref())
        .bind(filter.owner_tag.as_deref())
        .bind(filter.category.as_deref())
        .bind(filter.category.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunk_from_row(row)?;
            let similarity = chunk
                .embedding
                .as_deref()
                .map_or(0.0, |v| cosine_similarity(query_vec, v) as f64);
            scored.push(ScoredChunk { chunk, similarity });
        }

        sort_scored(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    async fn candidates(&self, filter: &ChunkFilter) -> Result<Vec<KnowledgeChunk>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM knowledge_chunks
            WHERE (? IS NULL OR owner_tag = ?)
              AND (? IS NULL OR category = ?)
            ORDER BY document_id ASC, chunk_index ASC
            "#,
            CHUNK_COLUMNS
        ))
        .bind(filter.owner_tag.as_deref())
        .bind(filter.owner_tag.as_deref())
        .bind(filter.category.as_deref())
        .bind(filter.category.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    async fn all_missing_embeddings(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT d.id FROM knowledge_documents d
            WHERE NOT EXISTS (SELECT 1 FROM knowledge_chunks c WHERE c.document_id = d.id)
            ORDER BY d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn incomplete_embeddings(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT document_id FROM knowledge_chunks WHERE embedding IS NULL ORDER BY document_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
