//! Database migrations
//!
//! This module manages SQLite schema migrations for the graph engine.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Versioned graph storage
///
/// Objects and relationships are append-only version chains keyed by
/// canonical id. At most one non-deleted row exists per canonical id and
/// branch (the HEAD), enforced by partial unique indexes. Branch lineage
/// is precomputed at branch creation so read-time visibility never
/// recurses.
const MIGRATION_V1: &str = r#"
    -- Branches: named, isolated views of a project's graph
    CREATE TABLE IF NOT EXISTS graph_branches (
        id TEXT PRIMARY KEY NOT NULL,
        project_id TEXT,
        name TEXT NOT NULL,
        parent_branch_id TEXT REFERENCES graph_branches(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_branches_scope_name
        ON graph_branches(ifnull(project_id, ''), name);
    CREATE INDEX IF NOT EXISTS idx_graph_branches_project_id ON graph_branches(project_id);
    CREATE INDEX IF NOT EXISTS idx_graph_branches_parent ON graph_branches(parent_branch_id);

    -- Precomputed ancestor chains; depth 0 is the branch itself
    CREATE TABLE IF NOT EXISTS graph_branch_lineage (
        branch_id TEXT NOT NULL REFERENCES graph_branches(id) ON DELETE CASCADE,
        ancestor_branch_id TEXT NOT NULL,
        depth INTEGER NOT NULL,
        PRIMARY KEY (branch_id, ancestor_branch_id)
    );

    CREATE INDEX IF NOT EXISTS idx_graph_branch_lineage_branch ON graph_branch_lineage(branch_id);

    -- Versioned graph objects. Every patch inserts a new row; the old
    -- head is tombstoned via deleted_at. History rows are never removed.
    CREATE TABLE IF NOT EXISTS graph_objects (
        id TEXT PRIMARY KEY NOT NULL,
        canonical_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        branch_id TEXT REFERENCES graph_branches(id),
        type TEXT NOT NULL,
        key TEXT,
        status TEXT,
        properties TEXT NOT NULL DEFAULT '{}',
        labels TEXT NOT NULL DEFAULT '[]',
        search_text TEXT NOT NULL DEFAULT '',
        supersedes_id TEXT,
        deleted_at TEXT,
        embedding BLOB,
        embedding_updated_at TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (canonical_id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_graph_objects_canonical ON graph_objects(canonical_id);
    CREATE INDEX IF NOT EXISTS idx_graph_objects_project ON graph_objects(project_id);
    CREATE INDEX IF NOT EXISTS idx_graph_objects_type ON graph_objects(type);
    CREATE INDEX IF NOT EXISTS idx_graph_objects_key ON graph_objects(key);
    CREATE INDEX IF NOT EXISTS idx_graph_objects_created_at ON graph_objects(created_at);

    -- One live head per canonical id and branch
    CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_objects_head
        ON graph_objects(canonical_id, ifnull(branch_id, ''))
        WHERE deleted_at IS NULL;

    -- Versioned typed edges between canonical object ids
    CREATE TABLE IF NOT EXISTS graph_relationships (
        id TEXT PRIMARY KEY NOT NULL,
        canonical_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        branch_id TEXT REFERENCES graph_branches(id),
        type TEXT NOT NULL,
        src_id TEXT NOT NULL,
        dst_id TEXT NOT NULL,
        properties TEXT NOT NULL DEFAULT '{}',
        weight REAL,
        supersedes_id TEXT,
        deleted_at TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (canonical_id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_graph_relationships_canonical ON graph_relationships(canonical_id);
    CREATE INDEX IF NOT EXISTS idx_graph_relationships_project ON graph_relationships(project_id);
    CREATE INDEX IF NOT EXISTS idx_graph_relationships_src ON graph_relationships(src_id);
    CREATE INDEX IF NOT EXISTS idx_graph_relationships_dst ON graph_relationships(dst_id);
    CREATE INDEX IF NOT EXISTS idx_graph_relationships_type ON graph_relationships(type);

    CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_relationships_head
        ON graph_relationships(canonical_id, ifnull(branch_id, ''))
        WHERE deleted_at IS NULL;
"#;

/// Migration 2: Lexical search index
///
/// FTS5 external-content table over the derived search text, kept in sync
/// by triggers so every version row is indexed as it is written.
const MIGRATION_V2: &str = r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS graph_objects_fts USING fts5(
        key, type, labels, search_text,
        content='graph_objects',
        content_rowid='rowid'
    );

    CREATE TRIGGER IF NOT EXISTS graph_objects_ai AFTER INSERT ON graph_objects BEGIN
        INSERT INTO graph_objects_fts(rowid, key, type, labels, search_text)
        VALUES (NEW.rowid, NEW.key, NEW.type, NEW.labels, NEW.search_text);
    END;

    CREATE TRIGGER IF NOT EXISTS graph_objects_ad AFTER DELETE ON graph_objects BEGIN
        INSERT INTO graph_objects_fts(graph_objects_fts, rowid, key, type, labels, search_text)
        VALUES ('delete', OLD.rowid, OLD.key, OLD.type, OLD.labels, OLD.search_text);
    END;

    CREATE TRIGGER IF NOT EXISTS graph_objects_au AFTER UPDATE ON graph_objects BEGIN
        INSERT INTO graph_objects_fts(graph_objects_fts, rowid, key, type, labels, search_text)
        VALUES ('delete', OLD.rowid, OLD.key, OLD.type, OLD.labels, OLD.search_text);
        INSERT INTO graph_objects_fts(rowid, key, type, labels, search_text)
        VALUES (NEW.rowid, NEW.key, NEW.type, NEW.labels, NEW.search_text);
    END;
"#;

/// Migration 3: Embedding job queue
///
/// Background workers claim pending rows atomically and write embeddings
/// back onto graph_objects. At most one active (pending or processing)
/// job exists per object, enforced by a partial unique index.
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS graph_embedding_jobs (
        id TEXT PRIMARY KEY NOT NULL,
        object_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        priority INTEGER NOT NULL DEFAULT 0,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        scheduled_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_graph_embedding_jobs_status ON graph_embedding_jobs(status);
    CREATE INDEX IF NOT EXISTS idx_graph_embedding_jobs_scheduled
        ON graph_embedding_jobs(status, scheduled_at);

    CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_embedding_jobs_active
        ON graph_embedding_jobs(object_id)
        WHERE status IN ('pending', 'processing');
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    // Ensure migrations table exists
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    // Get the latest version
    let row: Option<(i32,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Versioned graph storage");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Lexical search index");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Embedding job queue");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
