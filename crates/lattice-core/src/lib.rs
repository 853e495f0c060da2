//! Lattice Core Library
//!
//! Versioned, branchable knowledge-graph storage and query engine:
//! - Versioning core (canonical ids, head resolution, branch lineage)
//! - Graph queries (traversal, structured listing, hybrid search)
//! - Object merges (transactional identity consolidation)
//! - Embedding jobs (queue + background worker with retry/backoff)
//! - Storage (SQLite via sqlx, migrations, FTS5 lexical index)

pub mod config;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::domain::graph::{
        Branch, GraphObject, GraphRelationship, ObjectDraft, ObjectPatch, Properties,
        RelationshipDraft, RelationshipPatch, Scope,
    };
    pub use crate::domain::merge::{MergeOptions, MergeOutcome, MergeService, MergeStrategy};
    pub use crate::domain::query::{
        GraphQueryService, GraphSnapshot, HybridSearchRequest, ObjectFilter, Page, SearchHit,
        SearchQuery, TraverseOptions, VectorSearchOptions,
    };
    pub use crate::domain::versioning::VersioningService;
    pub use crate::error::{Error, Result};
    pub use crate::jobs::{EmbeddingWorker, Embedder, JobQueue, RetryPolicy, WorkerConfig};
    pub use crate::storage::{Database, DatabaseConfig};
}
