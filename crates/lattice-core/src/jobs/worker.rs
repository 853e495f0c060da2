//! Embedding worker
//!
//! Polls the job queue, computes embeddings for claimed objects, and
//! writes them back onto the object rows. Runs as a background tokio
//! task with a watch-channel shutdown signal; per-attempt timeouts are
//! independent of the queue's retry backoff.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::jobs::embedder::Embedder;
use crate::jobs::queue::{EmbeddingJob, JobQueue};
use crate::storage::format_ts;

/// Worker tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Poll interval between queue sweeps
    pub interval_ms: u64,
    /// Jobs claimed per sweep
    pub batch_size: usize,
    /// First retry delay; doubles per attempt
    pub base_retry_delay_secs: u64,
    /// Backoff ceiling
    pub max_retry_delay_secs: u64,
    /// Attempts before a job parks as failed
    pub max_attempts: i64,
    /// Per-attempt embedding timeout
    pub attempt_timeout_secs: u64,
    /// Processing jobs older than this are considered abandoned
    pub stale_threshold_minutes: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            batch_size: 10,
            base_retry_delay_secs: 60,
            max_retry_delay_secs: 3600,
            max_attempts: 5,
            attempt_timeout_secs: 30,
            stale_threshold_minutes: 10,
        }
    }
}

/// Counters accumulated over the worker's lifetime
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerMetrics {
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    processed: AtomicI64,
    succeeded: AtomicI64,
    failed: AtomicI64,
}

struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background embedding worker
pub struct EmbeddingWorker {
    queue: JobQueue,
    embedder: Arc<dyn Embedder>,
    pool: SqlitePool,
    config: WorkerConfig,
    metrics: Arc<MetricsInner>,
    state: Mutex<Option<RunningState>>,
}

impl EmbeddingWorker {
    pub fn new(
        queue: JobQueue,
        embedder: Arc<dyn Embedder>,
        pool: SqlitePool,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            embedder,
            pool,
            config,
            metrics: Arc::new(MetricsInner::default()),
            state: Mutex::new(None),
        }
    }

    /// Start the polling loop. A worker whose embedder is disabled does
    /// not start; starting twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if !self.embedder.is_enabled() {
            info!("Embedding provider disabled, worker not started");
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let queue = self.queue.clone();
        let embedder = self.embedder.clone();
        let pool = self.pool.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(config.interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_ms = config.interval_ms,
                batch_size = config.batch_size,
                "Embedding worker started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = queue.recover_stale(config.stale_threshold_minutes).await {
                            warn!(error = %e, "Stale job recovery failed");
                        }
                        match queue.dequeue(config.batch_size).await {
                            Ok(jobs) => {
                                for job in jobs {
                                    process_job(&queue, embedder.as_ref(), &pool, &config, &metrics, job)
                                        .await;
                                }
                            }
                            Err(e) => warn!(error = %e, "Job claim failed"),
                        }
                    }
                }
            }

            info!("Embedding worker stopped");
        });

        *state = Some(RunningState {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Signal the loop to stop and wait for it to exit
    pub async fn stop(&self) -> Result<()> {
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(true);
            state
                .handle
                .await
                .map_err(|e| Error::Other(format!("worker task panicked: {e}")))?;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Snapshot of the lifetime counters
    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            processed: self.metrics.processed.load(Ordering::Relaxed),
            succeeded: self.metrics.succeeded.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
        }
    }

    /// Process every currently due job once, without the polling loop.
    /// Used by tests and the CLI's one-shot drain mode.
    pub async fn drain_once(&self) -> Result<WorkerMetrics> {
        loop {
            let jobs = self.queue.dequeue(self.config.batch_size).await?;
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                process_job(
                    &self.queue,
                    self.embedder.as_ref(),
                    &self.pool,
                    &self.config,
                    &self.metrics,
                    job,
                )
                .await;
            }
        }
        Ok(self.metrics())
    }
}

/// Run one claimed job to a terminal or retry state
async fn process_job(
    queue: &JobQueue,
    embedder: &dyn Embedder,
    pool: &SqlitePool,
    config: &WorkerConfig,
    metrics: &MetricsInner,
    job: EmbeddingJob,
) {
    metrics.processed.fetch_add(1, Ordering::Relaxed);

    match embed_object(embedder, pool, config, &job).await {
        Ok(()) => {
            if let Err(e) = queue.mark_completed(&job.id).await {
                error!(job_id = %job.id, error = %e, "Failed to complete job");
                metrics.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            metrics.succeeded.fetch_add(1, Ordering::Relaxed);
            debug!(job_id = %job.id, object_id = %job.object_id, "Embedding written");
        }
        Err(e) => {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            let message = e.to_string();
            if let Err(mark_err) = queue.mark_failed(&job.id, &message).await {
                error!(job_id = %job.id, error = %mark_err, "Failed to record job failure");
            }
        }
    }
}

/// Embed one object's text and write the vector back onto its row.
///
/// Re-embedding an object that already has a vector overwrites it.
async fn embed_object(
    embedder: &dyn Embedder,
    pool: &SqlitePool,
    config: &WorkerConfig,
    job: &EmbeddingJob,
) -> Result<()> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT search_text FROM graph_objects WHERE id = ?")
            .bind(&job.object_id)
            .fetch_optional(pool)
            .await?;
    let Some((search_text,)) = row else {
        return Err(Error::Other(format!(
            "object_missing: graph object '{}' does not exist",
            job.object_id
        )));
    };

    let attempt_timeout = Duration::from_secs(config.attempt_timeout_secs);
    let embedding = tokio::time::timeout(attempt_timeout, embedder.embed(&search_text))
        .await
        .map_err(|_| {
            Error::Timeout(attempt_timeout.as_millis() as u64)
        })??;

    let now = format_ts(chrono::Utc::now());
    sqlx::query("UPDATE graph_objects SET embedding = ?, embedding_updated_at = ? WHERE id = ?")
        .bind(crate::domain::rows::encode_embedding(&embedding))
        .bind(&now)
        .bind(&job.object_id)
        .execute(pool)
        .await?;

    Ok(())
}
