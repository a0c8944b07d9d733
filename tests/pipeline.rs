//! End-to-end pipeline tests over a temporary database and index root,
//! with deterministic stub providers in place of network backends.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tempfile::TempDir;

use docrag::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, GenerationConfig, IndexConfig,
    IngestConfig, RetrievalConfig,
};
use docrag::embedding::EmbeddingClient;
use docrag::generation::GenerationClient;
use docrag::index_store::IndexStore;
use docrag::retrieval::{self, Retrieval};
use docrag::{db, ingest, migrate, respond, tasks, Error};

const DIMS: usize = 4;

/// Deterministic feature vector: a crude bag-of-bytes fingerprint. Stable
/// across calls, distinct for distinct texts, dimension-consistent.
fn stub_vectors(texts: &[String]) -> Vec<Vec<f32>> {
    texts
        .iter()
        .map(|t| {
            let bytes = t.as_bytes();
            let sum: u64 = bytes.iter().map(|&b| b as u64).sum();
            vec![
                (t.len() % 101) as f32,
                (sum % 97) as f32,
                bytes.first().copied().unwrap_or(0) as f32,
                bytes.last().copied().unwrap_or(0) as f32,
            ]
        })
        .collect()
}

struct StubEmbedder;

#[async_trait]
impl EmbeddingClient for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> docrag::Result<Vec<Vec<f32>>> {
        Ok(stub_vectors(texts))
    }
}

/// Fails the first batch with a provider error, succeeds afterwards.
struct FlakyEmbedder {
    failed_once: AtomicBool,
}

#[async_trait]
impl EmbeddingClient for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> docrag::Result<Vec<Vec<f32>>> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(Error::EmbeddingProvider("transient outage".into()));
        }
        Ok(stub_vectors(texts))
    }
}

/// Records how many batches ran and whether any two ever overlapped.
struct TrackingEmbedder {
    active: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
    completed: Arc<AtomicUsize>,
}

impl TrackingEmbedder {
    fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            overlapped: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn handle(&self) -> Self {
        Self {
            active: Arc::clone(&self.active),
            overlapped: Arc::clone(&self.overlapped),
            completed: Arc::clone(&self.completed),
        }
    }
}

#[async_trait]
impl EmbeddingClient for TrackingEmbedder {
    fn model_name(&self) -> &str {
        "tracking"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> docrag::Result<Vec<Vec<f32>>> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        // Hold the slot long enough for a concurrent run to collide.
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(stub_vectors(texts))
    }
}

struct StubGenerator {
    invoked: AtomicBool,
}

impl StubGenerator {
    fn new() -> Self {
        Self {
            invoked: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl GenerationClient for StubGenerator {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn generate(&self, context: &str, question: &str) -> docrag::Result<String> {
        self.invoked.store(true, Ordering::SeqCst);
        Ok(format!(
            "answer to '{question}' from {} context chars",
            context.len()
        ))
    }
}

struct FailingGenerator;

#[async_trait]
impl GenerationClient for FailingGenerator {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _context: &str, _question: &str) -> docrag::Result<String> {
        Err(Error::GenerationProvider("model unavailable".into()))
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("docrag.sqlite"),
        },
        index: IndexConfig {
            root: root.join("indices"),
            flat_threshold: 256,
        },
        chunking: ChunkingConfig {
            size: 1000,
            overlap: 200,
        },
        retrieval: RetrievalConfig {
            diversity_cap: 3,
            search_k: 10,
        },
        embedding: EmbeddingConfig {
            provider: "ollama".into(),
            model: "stub".into(),
            dims: DIMS,
            url: None,
            batch_size: 64,
            max_retries: 0,
            timeout_secs: 5,
        },
        generation: GenerationConfig {
            provider: "ollama".into(),
            model: "stub".into(),
            url: None,
            timeout_secs: 5,
        },
        ingest: IngestConfig {
            retry_backoff_secs: 0,
            max_attempts: Some(1),
            workers: 1,
        },
    }
}

struct TestEnv {
    _tmp: TempDir,
    config: Config,
    pool: sqlx::SqlitePool,
    store: IndexStore,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = IndexStore::open(&config.index.root).unwrap();
    TestEnv {
        _tmp: tmp,
        config,
        pool,
        store,
    }
}

/// Write a txt document of `len` characters and register it.
async fn add_txt_document(env: &TestEnv, owner: &str, title: &str, len: usize) -> String {
    let path = env._tmp.path().join(format!("{title}.txt"));
    let text: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    std::fs::write(&path, text).unwrap();
    ingest::register_document(&env.pool, owner, title, &path)
        .await
        .unwrap()
}

async fn ingest_ok(env: &TestEnv, document_id: &str) -> String {
    ingest::run_ingest(&env.config, &env.pool, &env.store, &StubEmbedder, document_id)
        .await
        .unwrap()
}

async fn processed_flag(env: &TestEnv, document_id: &str) -> bool {
    sqlx::query_scalar("SELECT processed FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_one(&env.pool)
        .await
        .unwrap()
}

async fn chunk_ordinals(env: &TestEnv, document_id: &str) -> Vec<i64> {
    sqlx::query_scalar("SELECT chunk_index FROM chunks WHERE document_id = ? ORDER BY chunk_index")
        .bind(document_id)
        .fetch_all(&env.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn ingestion_chunks_and_marks_processed() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;

    assert!(!processed_flag(&env, &doc_id).await);

    let message = ingest_ok(&env, &doc_id).await;
    assert_eq!(message, "Processed handbook (3 chunks)");

    assert!(processed_flag(&env, &doc_id).await);
    assert_eq!(chunk_ordinals(&env, &doc_id).await, vec![0, 1, 2]);
    assert!(env.store.get(&doc_id).unwrap().is_some());
}

#[tokio::test]
async fn empty_document_fails_and_stays_unprocessed() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "blank", 0).await;

    let err = ingest::run_ingest(&env.config, &env.pool, &env.store, &StubEmbedder, &doc_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyInput));
    assert!(!processed_flag(&env, &doc_id).await);
    assert!(env.store.get(&doc_id).unwrap().is_none());
}

#[tokio::test]
async fn unsupported_extension_rejected_at_registration() {
    let env = setup().await;
    let path = env._tmp.path().join("image.png");
    std::fs::write(&path, b"bytes").unwrap();

    let err = ingest::register_document(&env.pool, "alice", "image", &path)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFileType(_)));
}

#[tokio::test]
async fn reprocessing_replaces_chunk_rows() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;

    ingest_ok(&env, &doc_id).await;
    let first_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_all(&env.pool)
        .await
        .unwrap();

    // Second run: rows are replaced, not accumulated.
    ingest_ok(&env, &doc_id).await;
    let second_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_all(&env.pool)
        .await
        .unwrap();

    assert_eq!(second_ids.len(), first_ids.len());
    assert_eq!(chunk_ordinals(&env, &doc_id).await, vec![0, 1, 2]);
    for id in &second_ids {
        assert!(!first_ids.contains(id));
    }
}

#[tokio::test]
async fn single_document_diversity_yields_one_chunk() {
    let env = setup().await;
    // 4200 chars => 5 chunks with size=1000, overlap=200.
    let doc_id = add_txt_document(&env, "alice", "handbook", 4200).await;
    ingest_ok(&env, &doc_id).await;
    assert_eq!(chunk_ordinals(&env, &doc_id).await.len(), 5);

    let result = retrieval::retrieve(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        "alice",
        "what is in the handbook?",
    )
    .await
    .unwrap();

    match result {
        Retrieval::Hits(hits) => {
            assert_eq!(hits.len(), 1, "one document can contribute one chunk");
            assert_eq!(hits[0].document_title, "handbook");
        }
        Retrieval::NoDocuments => panic!("expected hits"),
    }
}

#[tokio::test]
async fn two_documents_yield_at_most_one_chunk_each() {
    let env = setup().await;
    let a = add_txt_document(&env, "alice", "alpha", 4200).await;
    let b = add_txt_document(&env, "alice", "beta", 2500).await;
    ingest_ok(&env, &a).await;
    ingest_ok(&env, &b).await;

    let result = retrieval::retrieve(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        "alice",
        "anything",
    )
    .await
    .unwrap();

    match result {
        Retrieval::Hits(hits) => {
            // Cap is 3 but only two source documents exist.
            assert_eq!(hits.len(), 2);
            let titles: Vec<&str> = hits.iter().map(|h| h.document_title.as_str()).collect();
            assert!(titles.contains(&"alpha"));
            assert!(titles.contains(&"beta"));
        }
        Retrieval::NoDocuments => panic!("expected hits"),
    }
}

#[tokio::test]
async fn retrieval_is_scoped_to_owner() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;
    ingest_ok(&env, &doc_id).await;

    let result = retrieval::retrieve(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        "mallory",
        "anything",
    )
    .await
    .unwrap();

    assert!(matches!(result, Retrieval::NoDocuments));
}

#[tokio::test]
async fn missing_artifact_excludes_document_not_query() {
    let env = setup().await;
    let a = add_txt_document(&env, "alice", "alpha", 2500).await;
    let b = add_txt_document(&env, "alice", "beta", 2500).await;
    ingest_ok(&env, &a).await;
    ingest_ok(&env, &b).await;

    // Losing one artifact silently removes that source.
    env.store.delete(&a).unwrap();

    let result = retrieval::retrieve(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        "alice",
        "anything",
    )
    .await
    .unwrap();

    match result {
        Retrieval::Hits(hits) => {
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].document_title, "beta");
        }
        Retrieval::NoDocuments => panic!("expected hits from beta"),
    }
}

#[tokio::test]
async fn no_documents_sentinel_skips_generation_but_records_bot_turn() {
    let env = setup().await;
    let generator = StubGenerator::new();

    let session_id = respond::create_session(&env.pool, "alice", "first chat")
        .await
        .unwrap();
    let message_id = respond::record_user_message(&env.pool, &session_id, "hello?")
        .await
        .unwrap();

    let answer = respond::respond(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        &generator,
        &session_id,
        &message_id,
    )
    .await
    .unwrap();

    assert_eq!(answer, retrieval::NO_DOCUMENTS_REPLY);
    assert!(!generator.invoked.load(Ordering::SeqCst));

    // The sentinel is still a recorded bot turn, with no references.
    let rows = sqlx::query(
        "SELECT text, is_user FROM chat_messages WHERE session_id = ? ORDER BY created_at, is_user DESC",
    )
    .bind(&session_id)
    .fetch_all(&env.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(!rows[1].get::<bool, _>("is_user"));
    assert_eq!(rows[1].get::<String, _>("text"), retrieval::NO_DOCUMENTS_REPLY);

    let refs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_references")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(refs, 0);
}

#[tokio::test]
async fn respond_links_answer_to_source_chunks() {
    let env = setup().await;
    let a = add_txt_document(&env, "alice", "alpha", 2500).await;
    let b = add_txt_document(&env, "alice", "beta", 2500).await;
    ingest_ok(&env, &a).await;
    ingest_ok(&env, &b).await;

    let generator = StubGenerator::new();
    let session_id = respond::create_session(&env.pool, "alice", "chat")
        .await
        .unwrap();
    let message_id = respond::record_user_message(&env.pool, &session_id, "what do I have?")
        .await
        .unwrap();

    let answer = respond::respond(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        &generator,
        &session_id,
        &message_id,
    )
    .await
    .unwrap();

    assert!(generator.invoked.load(Ordering::SeqCst));
    assert!(answer.starts_with("answer to"));

    // One reference per accepted chunk, resolvable back to its document.
    let refs: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT c.document_id FROM message_references r
        JOIN chunks c ON c.id = r.chunk_id
        "#,
    )
    .fetch_all(&env.pool)
    .await
    .unwrap();
    assert_eq!(refs.len(), 2);
    assert!(refs.contains(&a));
    assert!(refs.contains(&b));
}

#[tokio::test]
async fn generation_failure_surfaces_as_error_reply() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;
    ingest_ok(&env, &doc_id).await;

    let session_id = respond::create_session(&env.pool, "alice", "chat")
        .await
        .unwrap();
    let message_id = respond::record_user_message(&env.pool, &session_id, "question")
        .await
        .unwrap();

    let answer = respond::respond(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        &FailingGenerator,
        &session_id,
        &message_id,
    )
    .await
    .unwrap();

    assert!(answer.starts_with("Error:"), "got: {answer}");

    // The error reply is still persisted as the bot turn.
    let bot_text: String = sqlx::query_scalar(
        "SELECT text FROM chat_messages WHERE session_id = ? AND is_user = 0",
    )
    .bind(&session_id)
    .fetch_one(&env.pool)
    .await
    .unwrap();
    assert_eq!(bot_text, answer);
}

#[tokio::test]
async fn document_deletion_cascades_chunks_and_artifact() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;
    ingest_ok(&env, &doc_id).await;

    ingest::delete_document(&env.pool, &env.store, &doc_id)
        .await
        .unwrap();

    assert!(chunk_ordinals(&env, &doc_id).await.is_empty());
    assert!(env.store.get(&doc_id).unwrap().is_none());
}

#[tokio::test]
async fn list_documents_reports_processing_state() {
    let env = setup().await;
    let a = add_txt_document(&env, "alice", "alpha", 2500).await;
    let b = add_txt_document(&env, "alice", "beta", 2500).await;
    add_txt_document(&env, "mallory", "other", 2500).await;
    ingest_ok(&env, &a).await;

    let documents = ingest::list_documents(&env.pool, "alice").await.unwrap();
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].id, a);
    assert!(documents[0].processed);
    assert_eq!(documents[1].id, b);
    assert!(!documents[1].processed);
    assert_eq!(documents[1].file_type, "txt");
}

#[tokio::test]
async fn reindex_restores_a_lost_artifact_without_reembedding() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;
    ingest_ok(&env, &doc_id).await;

    env.store.delete(&doc_id).unwrap();
    assert!(env.store.get(&doc_id).unwrap().is_none());

    // Rebuild from the stored chunk embeddings alone; no embedder needed.
    let message = ingest::rebuild_index(&env.config, &env.pool, &env.store, &doc_id)
        .await
        .unwrap();
    assert_eq!(message, "Rebuilt index for handbook (3 chunks)");

    let result = retrieval::retrieve(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        "alice",
        "anything",
    )
    .await
    .unwrap();
    match result {
        Retrieval::Hits(hits) => assert_eq!(hits[0].document_title, "handbook"),
        Retrieval::NoDocuments => panic!("expected rebuilt document to be searchable"),
    }
}

#[tokio::test]
async fn reindex_of_never_ingested_document_fails() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;

    let err = ingest::rebuild_index(&env.config, &env.pool, &env.store, &doc_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyInput));

    let err = ingest::rebuild_index(&env.config, &env.pool, &env.store, "no-such-id")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DocumentNotFound(_)));
}

#[tokio::test]
async fn transcript_orders_user_turn_before_bot_turn() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;
    ingest_ok(&env, &doc_id).await;

    let session_id = respond::create_session(&env.pool, "alice", "chat")
        .await
        .unwrap();
    let message_id = respond::record_user_message(&env.pool, &session_id, "question")
        .await
        .unwrap();
    respond::respond(
        &env.config,
        &env.pool,
        &env.store,
        &StubEmbedder,
        &StubGenerator::new(),
        &session_id,
        &message_id,
    )
    .await
    .unwrap();

    let session = respond::get_session(&env.pool, &session_id).await.unwrap();
    assert_eq!(session.owner, "alice");
    assert_eq!(session.title, "chat");

    let transcript = respond::session_transcript(&env.pool, &session_id)
        .await
        .unwrap();
    assert_eq!(transcript.len(), 2);
    assert!(transcript[0].is_user);
    assert_eq!(transcript[0].text, "question");
    assert!(!transcript[1].is_user);
}

#[tokio::test]
async fn unknown_session_lookup_fails() {
    let env = setup().await;
    let err = respond::get_session(&env.pool, "no-such-session")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

/// Poll `check` until it yields true or the deadline passes.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn worker_retries_failed_ingestion_until_it_succeeds() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;

    let mut config = env.config.clone();
    config.ingest.max_attempts = Some(3);

    let embedder = Box::new(FlakyEmbedder {
        failed_once: AtomicBool::new(false),
    });
    let store = IndexStore::open(&config.index.root).unwrap();
    let (queue, _handles) = tasks::start(config, env.pool.clone(), store, embedder);

    let pending = tasks::enqueue_pending(&env.pool, &queue).await.unwrap();
    assert_eq!(pending, 1);

    // First attempt hits the transient failure; the re-enqueued attempt
    // completes the ingestion.
    wait_until(|| processed_flag(&env, &doc_id)).await;
    assert_eq!(chunk_ordinals(&env, &doc_id).await, vec![0, 1, 2]);
    assert!(env.store.get(&doc_id).unwrap().is_some());
}

#[tokio::test]
async fn worker_never_runs_one_document_concurrently() {
    let env = setup().await;
    let doc_id = add_txt_document(&env, "alice", "handbook", 2500).await;

    let mut config = env.config.clone();
    config.ingest.workers = 2;

    let tracker = TrackingEmbedder::new();
    let embedder = Box::new(tracker.handle());
    let store = IndexStore::open(&config.index.root).unwrap();
    let (queue, _handles) = tasks::start(config, env.pool.clone(), store, embedder);

    // Two jobs for the same document with two idle workers: the second
    // must be parked until the first run releases the document.
    queue.enqueue(&doc_id);
    queue.enqueue(&doc_id);

    let completed = Arc::clone(&tracker.completed);
    wait_until(|| {
        let completed = Arc::clone(&completed);
        async move { completed.load(Ordering::SeqCst) >= 2 }
    })
    .await;

    assert!(
        !tracker.overlapped.load(Ordering::SeqCst),
        "two ingestion runs of the same document overlapped"
    );
    assert!(processed_flag(&env, &doc_id).await);
}
