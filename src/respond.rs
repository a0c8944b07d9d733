//! Bot-turn orchestration: retrieval → context → generation → response
//! linking.
//!
//! A bot turn is always produced. Provider failure becomes a visible
//! `Error:`-prefixed reply; an empty corpus becomes the no-documents
//! sentinel. Either way the message row is recorded, so a conversation
//! never silently stalls.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::{Error, Result};
use crate::generation::GenerationClient;
use crate::index_store::IndexStore;
use crate::models::{ChatMessage, ChatSession};
use crate::retrieval::{self, Retrieval, RetrievedChunk};

/// Look up a chat session by id.
pub async fn get_session(pool: &SqlitePool, session_id: &str) -> Result<ChatSession> {
    let row = sqlx::query("SELECT id, owner, title, created_at FROM chat_sessions WHERE id = ?")
        .bind(session_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

    Ok(ChatSession {
        id: row.get("id"),
        owner: row.get("owner"),
        title: row.get("title"),
        created_at: row.get("created_at"),
    })
}

/// Load a session's messages, oldest first, user turn before the bot
/// turn it prompted.
pub async fn session_transcript(pool: &SqlitePool, session_id: &str) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT id, session_id, text, is_user, created_at
        FROM chat_messages WHERE session_id = ?
        ORDER BY created_at, is_user DESC
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ChatMessage {
            id: row.get("id"),
            session_id: row.get("session_id"),
            text: row.get("text"),
            is_user: row.get("is_user"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Create a chat session for a user.
pub async fn create_session(pool: &SqlitePool, owner: &str, title: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO chat_sessions (id, owner, title, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(owner)
        .bind(title)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await?;
    Ok(id)
}

/// Record a user message in a session.
pub async fn record_user_message(
    pool: &SqlitePool,
    session_id: &str,
    text: &str,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, text, is_user, created_at) VALUES (?, ?, ?, 1, ?)",
    )
    .bind(&id)
    .bind(session_id)
    .bind(text)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Produce the bot turn for a user message: retrieve, generate, persist
/// the answer with its chunk references. Returns the bot message text.
pub async fn respond(
    config: &Config,
    pool: &SqlitePool,
    store: &IndexStore,
    embedder: &dyn EmbeddingClient,
    generator: &dyn GenerationClient,
    session_id: &str,
    message_id: &str,
) -> Result<String> {
    let row = sqlx::query(
        r#"
        SELECT m.text AS question, s.owner AS owner
        FROM chat_messages m
        JOIN chat_sessions s ON s.id = m.session_id
        WHERE m.id = ? AND m.session_id = ? AND m.is_user = 1
        "#,
    )
    .bind(message_id)
    .bind(session_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::SessionNotFound(format!("{session_id}/{message_id}")))?;

    let question: String = row.get("question");
    let owner: String = row.get("owner");

    let (answer, sources) =
        match retrieval::retrieve(config, pool, store, embedder, &owner, &question).await? {
            Retrieval::NoDocuments => (retrieval::NO_DOCUMENTS_REPLY.to_string(), Vec::new()),
            Retrieval::Hits(chunks) => {
                let context = retrieval::assemble_context(&chunks);
                let answer = match generator.generate(&context, &question).await {
                    Ok(text) => text,
                    // The conversation always advances; provider failure
                    // becomes the bot's visible reply.
                    Err(e) => format!("Error: {e}"),
                };
                (answer, chunks)
            }
        };

    let bot_message_id = record_bot_message(pool, session_id, &answer, &sources).await?;
    info!(session_id, bot_message_id, sources = sources.len(), "recorded bot turn");

    Ok(answer)
}

/// Persist the bot message and link it to the chunks that backed it.
/// A reference whose chunk has vanished (e.g. concurrently deleted) is
/// skipped; the message itself is never aborted.
async fn record_bot_message(
    pool: &SqlitePool,
    session_id: &str,
    text: &str,
    sources: &[RetrievedChunk],
) -> Result<String> {
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, text, is_user, created_at) VALUES (?, ?, ?, 0, ?)",
    )
    .bind(&id)
    .bind(session_id)
    .bind(text)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    for source in sources {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_references (message_id, chunk_id)
            SELECT ?, id FROM chunks WHERE id = ?
            "#,
        )
        .bind(&id)
        .bind(&source.chunk_id)
        .execute(pool)
        .await?;

        if inserted.rows_affected() == 0 {
            warn!(chunk_id = %source.chunk_id, "skipping reference to missing chunk");
        }
    }

    Ok(id)
}
