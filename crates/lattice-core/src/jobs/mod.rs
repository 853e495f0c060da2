//! Asynchronous embedding jobs: queue, providers, and the worker loop

pub mod embedder;
pub mod queue;
pub mod worker;

pub use embedder::{DisabledEmbedder, Embedder, HashEmbedder};
pub use queue::{EmbeddingJob, EnqueueOptions, JobQueue, JobStatus, QueueStats, RetryPolicy};
pub use worker::{EmbeddingWorker, WorkerConfig, WorkerMetrics};
