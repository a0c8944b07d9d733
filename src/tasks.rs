//! Ingestion task queue with retry-on-failure semantics.
//!
//! Documents are ingested as independent units of work drained by a small
//! worker pool. A failed ingestion is re-enqueued after a fixed backoff
//! (configurable, 60s by default) until it succeeds or the optional
//! attempt cap is reached. An in-flight set guarantees at-most-one
//! ingestion run per document identity at a time; a job whose document is
//! already being processed is parked briefly and re-enqueued.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::index_store::IndexStore;
use crate::ingest;

/// Delay before re-enqueueing a job whose document is already in flight.
const BUSY_REQUEUE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub document_id: String,
    pub attempt: u32,
}

/// Whether a failed attempt (0-based) should be retried under the cap.
/// `None` means retry without bound.
pub fn should_retry(attempt: u32, max_attempts: Option<u32>) -> bool {
    match max_attempts {
        None => true,
        Some(cap) => attempt + 1 < cap,
    }
}

/// Handle for enqueueing ingestion work.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::UnboundedSender<IngestJob>,
}

impl IngestQueue {
    pub fn enqueue(&self, document_id: &str) {
        self.send(IngestJob {
            document_id: document_id.to_string(),
            attempt: 0,
        });
    }

    fn send(&self, job: IngestJob) {
        // Send only fails once the workers have shut down.
        if self.tx.send(job).is_err() {
            warn!("ingest queue closed; dropping job");
        }
    }

    fn send_after(&self, job: IngestJob, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(job).is_err() {
                warn!("ingest queue closed; dropping delayed job");
            }
        });
    }
}

struct WorkerCtx {
    config: Config,
    pool: SqlitePool,
    store: IndexStore,
    embedder: Box<dyn EmbeddingClient>,
    queue: IngestQueue,
    in_flight: Mutex<HashSet<String>>,
}

/// Spawn the worker pool. Workers run until every queue handle is dropped
/// and the channel drains.
pub fn start(
    config: Config,
    pool: SqlitePool,
    store: IndexStore,
    embedder: Box<dyn EmbeddingClient>,
) -> (IngestQueue, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = IngestQueue { tx };
    let workers = config.ingest.workers;

    let ctx = Arc::new(WorkerCtx {
        config,
        pool,
        store,
        embedder,
        queue: queue.clone(),
        in_flight: Mutex::new(HashSet::new()),
    });
    let rx = Arc::new(Mutex::new(rx));

    let handles = (0..workers)
        .map(|worker_id| {
            let ctx = Arc::clone(&ctx);
            let rx = Arc::clone(&rx);
            tokio::spawn(worker_loop(worker_id, ctx, rx))
        })
        .collect();

    (queue, handles)
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerCtx>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<IngestJob>>>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        // At-most-one run per document identity: concurrent reprocessing
        // would race on chunk-row replacement and index overwrite.
        let claimed = ctx.in_flight.lock().await.insert(job.document_id.clone());
        if !claimed {
            ctx.queue.send_after(job, BUSY_REQUEUE_DELAY);
            continue;
        }

        let result = ingest::run_ingest(
            &ctx.config,
            &ctx.pool,
            &ctx.store,
            ctx.embedder.as_ref(),
            &job.document_id,
        )
        .await;

        ctx.in_flight.lock().await.remove(&job.document_id);

        match result {
            Ok(message) => {
                info!(worker_id, document_id = %job.document_id, "{message}");
            }
            Err(e) => {
                let max_attempts = ctx.config.ingest.max_attempts;
                if should_retry(job.attempt, max_attempts) {
                    let backoff = Duration::from_secs(ctx.config.ingest.retry_backoff_secs);
                    warn!(
                        worker_id,
                        document_id = %job.document_id,
                        attempt = job.attempt,
                        "ingestion failed, retrying in {}s: {e}",
                        backoff.as_secs()
                    );
                    ctx.queue.send_after(
                        IngestJob {
                            document_id: job.document_id,
                            attempt: job.attempt + 1,
                        },
                        backoff,
                    );
                } else {
                    error!(
                        worker_id,
                        document_id = %job.document_id,
                        attempt = job.attempt,
                        "ingestion failed, attempt cap reached: {e}"
                    );
                }
            }
        }
    }
}

/// Enqueue every unprocessed document (worker startup backfill).
pub async fn enqueue_pending(pool: &SqlitePool, queue: &IngestQueue) -> anyhow::Result<usize> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM documents WHERE processed = 0")
        .fetch_all(pool)
        .await?;
    for id in &ids {
        queue.enqueue(id);
    }
    Ok(ids.len())
}
