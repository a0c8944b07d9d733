//! Retrieval engine: multi-index merge, similarity search, diversity
//! filtering, and context assembly.
//!
//! Each query loads the requesting user's per-document indices, merges
//! them into one logical search space with provenance back to
//! `(document, chunk)`, embeds the query, searches, then filters the
//! ranked hits so no single document dominates the context. The merged
//! structure is rebuilt from scratch per query; no cross-request cache.

use std::collections::HashSet;

use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::Config;
use crate::embedding::{self, EmbeddingClient};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::index_store::IndexStore;

/// Bot reply when the user has no searchable documents. A normal terminal
/// outcome, not an error; the generation provider is never invoked.
pub const NO_DOCUMENTS_REPLY: &str = "Please upload and process documents first.";

/// A chunk accepted by the diversity filter, nearest first.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_title: String,
    pub text: String,
    pub distance: f32,
}

/// Outcome of a retrieval pass.
#[derive(Debug)]
pub enum Retrieval {
    /// The user has no processed documents with index artifacts.
    NoDocuments,
    /// Diversity-filtered chunks, at most one per document, nearest first.
    Hits(Vec<RetrievedChunk>),
}

/// One document's sub-index plus the provenance needed to map local
/// search positions back to chunk rows.
pub(crate) struct DocumentIndex {
    pub(crate) title: String,
    pub(crate) index: VectorIndex,
    /// `(chunk_id, text)` in chunk-ordinal order, aligned with the
    /// index's insertion positions.
    pub(crate) chunks: Vec<(String, String)>,
}

/// Run similarity retrieval for one user query.
pub async fn retrieve(
    config: &Config,
    pool: &SqlitePool,
    store: &IndexStore,
    embedder: &dyn EmbeddingClient,
    owner: &str,
    query: &str,
) -> Result<Retrieval> {
    let docs = load_document_indices(pool, store, owner).await?;
    if docs.is_empty() {
        return Ok(Retrieval::NoDocuments);
    }

    let query_vec = embedding::embed_query(embedder, query).await?;

    let candidates = merged_search(&docs, &query_vec, config.retrieval.search_k)?;

    let doc_keys: Vec<usize> = candidates.iter().map(|c| c.doc).collect();
    let selected = diversity_filter(&doc_keys, config.retrieval.diversity_cap);

    let hits = selected
        .into_iter()
        .map(|i| {
            let c = &candidates[i];
            let doc = &docs[c.doc];
            let (chunk_id, text) = &doc.chunks[c.position];
            RetrievedChunk {
                chunk_id: chunk_id.clone(),
                document_title: doc.title.clone(),
                text: text.clone(),
                distance: c.distance,
            }
        })
        .collect();

    Ok(Retrieval::Hits(hits))
}

/// Load every processed document of `owner` that has a readable artifact.
/// Missing or corrupt artifacts exclude that document from the merge, not
/// the whole query.
async fn load_document_indices(
    pool: &SqlitePool,
    store: &IndexStore,
    owner: &str,
) -> Result<Vec<DocumentIndex>> {
    let rows = sqlx::query(
        "SELECT id, title FROM documents WHERE owner = ? AND processed = 1 ORDER BY created_at, id",
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;

    let mut docs = Vec::new();

    for row in rows {
        let document_id: String = row.get("id");
        let title: String = row.get("title");

        let Some(bytes) = store.get(&document_id)? else {
            continue;
        };

        let index = match VectorIndex::from_bytes(&bytes) {
            Ok(index) => index,
            Err(e) => {
                warn!(document_id, "skipping unreadable index artifact: {e}");
                continue;
            }
        };

        let chunk_rows =
            sqlx::query("SELECT id, text FROM chunks WHERE document_id = ? ORDER BY chunk_index")
                .bind(&document_id)
                .fetch_all(pool)
                .await?;
        let chunks: Vec<(String, String)> = chunk_rows
            .iter()
            .map(|r| (r.get("id"), r.get("text")))
            .collect();

        if chunks.len() != index.len() {
            warn!(
                document_id,
                chunks = chunks.len(),
                indexed = index.len(),
                "skipping document with chunk/index drift"
            );
            continue;
        }

        docs.push(DocumentIndex {
            title,
            index,
            chunks,
        });
    }

    Ok(docs)
}

/// A merged-space hit with provenance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub(crate) distance: f32,
    /// Sub-index ordinal in the merge. `(doc, position)` never collides
    /// across documents.
    pub(crate) doc: usize,
    pub(crate) position: usize,
}

/// Search the logical union of all sub-indices. Each sub-index's vectors
/// stay untouched; its local top-k is tagged with provenance and the
/// tagged hits are re-ranked globally, which yields exactly the top-k of
/// the concatenated space.
pub(crate) fn merged_search(
    docs: &[DocumentIndex],
    query: &[f32],
    k: usize,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();

    for (doc, entry) in docs.iter().enumerate() {
        if entry.index.dim() != query.len() {
            return Err(Error::DimensionMismatch {
                expected: entry.index.dim(),
                actual: query.len(),
            });
        }
        for (distance, position) in entry.index.search(query, k)? {
            candidates.push(Candidate {
                distance,
                doc,
                position,
            });
        }
    }

    candidates.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.doc.cmp(&b.doc))
            .then(a.position.cmp(&b.position))
    });
    candidates.truncate(k);

    Ok(candidates)
}

/// Accept hits in ranked order, at most one per source document, stopping
/// at `cap`. Returns indices into the ranked slice.
pub(crate) fn diversity_filter(doc_keys: &[usize], cap: usize) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for (i, key) in doc_keys.iter().enumerate() {
        if selected.len() == cap {
            break;
        }
        if seen.insert(*key) {
            selected.push(i);
        }
    }

    selected
}

/// Join the selected chunks into one prompt-ready context string, each
/// prefixed with its source document title, nearest-accepted-first.
pub fn assemble_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("From {}:\n{}", c.document_title, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}
