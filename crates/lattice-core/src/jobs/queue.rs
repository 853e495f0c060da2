//! Embedding job queue
//!
//! SQLite-backed queue feeding the embedding workers. Jobs move through
//! `pending -> processing -> {completed | pending (retry) | failed}`.
//! Claims are a single atomic `UPDATE ... RETURNING`, so concurrent
//! workers never double-process a row. At most one active job exists per
//! object (partial unique index), making enqueue idempotent.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{format_ts, parse_ts};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One embedding job row
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub id: String,
    /// Physical id of the graph object version to embed
    pub object_id: String,
    pub status: JobStatus,
    /// Higher priority dequeues first
    pub priority: i64,
    pub attempt_count: i64,
    /// Earliest time the job may be claimed (retry backoff lands here)
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    object_id: String,
    status: String,
    priority: i64,
    attempt_count: i64,
    scheduled_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<EmbeddingJob> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("unknown job status '{}'", self.status)))?;
        Ok(EmbeddingJob {
            id: self.id,
            object_id: self.object_id,
            status,
            priority: self.priority,
            attempt_count: self.attempt_count,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Enqueue parameters
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub object_id: String,
    pub priority: i64,
    /// Defer the first claim until this time
    pub schedule_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn for_object(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Queue depth by status
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Retry behavior applied on failure
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt number, capped at the
    /// configured maximum
    pub fn backoff_secs(&self, attempt: i64) -> u64 {
        let exponent = attempt.max(1) as u32 - 1;
        self.base_delay_secs
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(self.max_delay_secs)
    }
}

/// SQLite-backed embedding job queue
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enqueue an embedding job for an object.
    ///
    /// Idempotent: while a pending or processing job exists for the
    /// object, that job is returned instead of creating a new one. After
    /// the previous job reached a terminal state a fresh job is created.
    pub async fn enqueue(&self, opts: EnqueueOptions) -> Result<EmbeddingJob> {
        if opts.object_id.is_empty() {
            return Err(Error::InvalidInput("object id is required".into()));
        }

        if let Some(active) = self.get_active_job_for_object(&opts.object_id).await? {
            debug!(job_id = %active.id, object_id = %opts.object_id, "Active job exists, reusing");
            return Ok(active);
        }

        let now = Utc::now();
        let job = EmbeddingJob {
            id: Uuid::new_v4().to_string(),
            object_id: opts.object_id.clone(),
            status: JobStatus::Pending,
            priority: opts.priority,
            attempt_count: 0,
            scheduled_at: opts.schedule_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO graph_embedding_jobs
                (id, object_id, status, priority, attempt_count, scheduled_at, created_at, updated_at)
            VALUES (?, ?, 'pending', ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.object_id)
        .bind(job.priority)
        .bind(format_ts(job.scheduled_at))
        .bind(format_ts(job.created_at))
        .bind(format_ts(job.updated_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                debug!(job_id = %job.id, object_id = %job.object_id, "Embedding job enqueued");
                Ok(job)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // A concurrent enqueue won the race; return its job
                self.get_active_job_for_object(&opts.object_id)
                    .await?
                    .ok_or_else(|| Error::Conflict("embedding job enqueue race".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueue jobs for many objects, skipping those with active jobs.
    /// Returns the number of jobs actually created.
    pub async fn enqueue_batch(&self, object_ids: &[String], priority: i64) -> Result<u64> {
        let mut created = 0;
        for object_id in object_ids {
            let before = self.get_active_job_for_object(object_id).await?;
            if before.is_some() {
                continue;
            }
            self.enqueue(
                EnqueueOptions::for_object(object_id.clone()).with_priority(priority),
            )
            .await?;
            created += 1;
        }
        Ok(created)
    }

    /// Atomically claim up to `batch` due pending jobs for processing.
    ///
    /// Claimed jobs have their attempt count incremented and `started_at`
    /// stamped; concurrent workers never claim the same row twice.
    pub async fn dequeue(&self, batch: usize) -> Result<Vec<EmbeddingJob>> {
        let now = format_ts(Utc::now());
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE graph_embedding_jobs
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                started_at = ?,
                updated_at = ?
            WHERE id IN (
                SELECT id FROM graph_embedding_jobs
                WHERE status = 'pending' AND scheduled_at <= ?
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_job()).collect()
    }

    /// Mark a job done. Re-completing a completed job is a no-op.
    pub async fn mark_completed(&self, job_id: &str) -> Result<()> {
        let now = format_ts(Utc::now());
        let result = sqlx::query(
            "UPDATE graph_embedding_jobs SET status = 'completed', completed_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        debug!(job_id = %job_id, "Embedding job completed");
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Below the attempt ceiling the job is requeued as `pending` with
    /// exponential backoff; at the ceiling it parks as `failed`
    /// permanently, keeping the last error for follow-up.
    pub async fn mark_failed(&self, job_id: &str, error_message: &str) -> Result<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        let now = Utc::now();
        if job.attempt_count >= self.policy.max_attempts {
            sqlx::query(
                "UPDATE graph_embedding_jobs SET status = 'failed', last_error = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(error_message)
            .bind(format_ts(now))
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            warn!(
                job_id = %job_id,
                attempts = job.attempt_count,
                error = %error_message,
                "Embedding job failed permanently"
            );
        } else {
            let delay = self.policy.backoff_secs(job.attempt_count);
            let retry_at = now + ChronoDuration::seconds(delay as i64);
            sqlx::query(
                "UPDATE graph_embedding_jobs \
                 SET status = 'pending', last_error = ?, scheduled_at = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(error_message)
            .bind(format_ts(retry_at))
            .bind(format_ts(now))
            .bind(job_id)
            .execute(&self.pool)
            .await?;

            debug!(
                job_id = %job_id,
                attempts = job.attempt_count,
                retry_in_secs = delay,
                "Embedding job requeued for retry"
            );
        }
        Ok(())
    }

    /// Requeue `processing` jobs whose worker died, detected by a stale
    /// `started_at`. Returns the number recovered.
    pub async fn recover_stale(&self, threshold_minutes: i64) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::minutes(threshold_minutes);
        let now = format_ts(Utc::now());
        let result = sqlx::query(
            "UPDATE graph_embedding_jobs SET status = 'pending', updated_at = ? \
             WHERE status = 'processing' AND started_at <= ?",
        )
        .bind(&now)
        .bind(format_ts(cutoff))
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered stale embedding jobs");
        }
        Ok(recovered)
    }

    /// Fetch a job by id
    pub async fn get_job(&self, job_id: &str) -> Result<Option<EmbeddingJob>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM graph_embedding_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_job()).transpose()
    }

    /// The pending or processing job for an object, if any
    pub async fn get_active_job_for_object(
        &self,
        object_id: &str,
    ) -> Result<Option<EmbeddingJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            "SELECT * FROM graph_embedding_jobs \
             WHERE object_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_job()).transpose()
    }

    /// Queue depth by status
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM graph_embedding_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }
}
