//! Ingestion pipeline: one document from raw bytes to a searchable index.
//!
//! Flow: load document row → extract text → chunk → embed → replace chunk
//! rows → build and persist the index artifact → mark processed. The
//! pipeline is the only writer of a document's `processed` flag and chunk
//! rows. Reprocessing deletes prior chunk rows in the same transaction
//! that inserts the new ones, so chunk ordinals stay contiguous and no
//! duplicates accumulate.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunker;
use crate::config::Config;
use crate::embedding::{blob_to_vec, vec_to_blob, EmbeddingClient};
use crate::error::{Error, Result};
use crate::extract;
use crate::index::VectorIndex;
use crate::index_store::IndexStore;
use crate::models::{Chunk, Document, FileType};

/// Register a document for a user. Validates the file extension up front;
/// an unsupported extension never reaches the ingestion queue.
pub async fn register_document(
    pool: &SqlitePool,
    owner: &str,
    title: &str,
    path: &std::path::Path,
) -> Result<String> {
    let file_type = FileType::from_path(path)?;
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO documents (id, owner, title, file_type, path, processed, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(&id)
    .bind(owner)
    .bind(title)
    .bind(file_type.tag())
    .bind(path.to_string_lossy().as_ref())
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Run one ingestion for `document_id`. On any failure the document is
/// left `processed = false` and the error is returned for the task runner
/// to schedule a retry.
pub async fn run_ingest(
    config: &Config,
    pool: &SqlitePool,
    store: &IndexStore,
    embedder: &dyn EmbeddingClient,
    document_id: &str,
) -> Result<String> {
    match ingest_inner(config, pool, store, embedder, document_id).await {
        Ok(message) => Ok(message),
        Err(e) => {
            if let Err(reset_err) = mark_unprocessed(pool, document_id).await {
                warn!(document_id, "failed to reset processed flag: {reset_err}");
            }
            Err(e)
        }
    }
}

async fn ingest_inner(
    config: &Config,
    pool: &SqlitePool,
    store: &IndexStore,
    embedder: &dyn EmbeddingClient,
    document_id: &str,
) -> Result<String> {
    let row = sqlx::query("SELECT title, file_type, path FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;

    let title: String = row.get("title");
    let file_type = FileType::from_tag(&row.get::<String, _>("file_type"))?;
    let path: String = row.get("path");

    let bytes = std::fs::read(&path)?;
    let text = extract::extract_text(&bytes, file_type)?;
    let texts = chunker::split(&text, config.chunking.size, config.chunking.overlap)?;

    // Embed in provider-sized batches; output order matches chunk order.
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(config.embedding.batch_size) {
        vectors.extend(embedder.embed_batch(batch).await?);
    }

    let index = VectorIndex::build(vectors.clone(), config.index.flat_threshold)?;
    let artifact = index.to_bytes()?;

    // The artifact lands before the processed flag flips; a crash in
    // between leaves the document unprocessed and retriable.
    store.put(document_id, &artifact)?;

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (ordinal, (chunk_text, vector)) in texts.iter().zip(vectors.iter()).enumerate() {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, text, embedding)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(ordinal as i64)
        .bind(chunk_text)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE documents SET processed = 1 WHERE id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(document_id, chunks = texts.len(), "ingested document");
    Ok(format!("Processed {} ({} chunks)", title, texts.len()))
}

async fn mark_unprocessed(pool: &SqlitePool, document_id: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET processed = 0 WHERE id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// List a user's documents, oldest first.
pub async fn list_documents(pool: &SqlitePool, owner: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        r#"
        SELECT id, owner, title, file_type, path, processed, created_at
        FROM documents WHERE owner = ? ORDER BY created_at, id
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Document {
            id: row.get("id"),
            owner: row.get("owner"),
            title: row.get("title"),
            file_type: row.get("file_type"),
            path: row.get("path"),
            processed: row.get("processed"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Load a document's chunk rows with decoded embeddings, ordinal order.
pub async fn load_chunks(pool: &SqlitePool, document_id: &str) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, chunk_index, text, embedding
        FROM chunks WHERE document_id = ? ORDER BY chunk_index
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            text: row.get("text"),
            embedding: blob_to_vec(&row.get::<Vec<u8>, _>("embedding")),
        })
        .collect())
}

/// Rebuild a document's index artifact from its stored chunk embeddings,
/// without re-extracting or re-embedding. Recovers a lost or corrupt
/// artifact as long as the chunk rows survive.
pub async fn rebuild_index(
    config: &Config,
    pool: &SqlitePool,
    store: &IndexStore,
    document_id: &str,
) -> Result<String> {
    let title: String = sqlx::query_scalar("SELECT title FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;

    let chunks = load_chunks(pool, document_id).await?;
    // No chunk rows means the document was never ingested; there is
    // nothing to rebuild from.
    let vectors: Vec<Vec<f32>> = chunks.into_iter().map(|c| c.embedding).collect();
    let index = VectorIndex::build(vectors, config.index.flat_threshold)?;
    store.put(document_id, &index.to_bytes()?)?;

    info!(document_id, chunks = index.len(), "rebuilt index artifact");
    Ok(format!("Rebuilt index for {} ({} chunks)", title, index.len()))
}

/// Delete a document, its chunk rows, and its index artifact.
pub async fn delete_document(
    pool: &SqlitePool,
    store: &IndexStore,
    document_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    store.delete(document_id)?;
    Ok(())
}
