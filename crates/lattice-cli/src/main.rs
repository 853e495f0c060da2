//! Lattice CLI - versioned knowledge-graph engine

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use lattice_core::config::EngineConfig;
use lattice_core::domain::merge::{MergeOptions, MergeService, MergeStrategy};
use lattice_core::domain::query::{
    GraphQueryService, HybridSearchRequest, ObjectFilter, SearchQuery, TraverseOptions,
};
use lattice_core::domain::versioning::VersioningService;
use lattice_core::jobs::{
    EmbeddingWorker, EnqueueOptions, HashEmbedder, JobQueue, RetryPolicy, WorkerConfig,
};
use lattice_core::prelude::{ObjectDraft, ObjectPatch, Properties, RelationshipDraft, Scope};
use lattice_core::storage::Database;

#[derive(Parser)]
#[command(name = "lattice")]
#[command(author, version, about = "Versioned knowledge-graph engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Project scope for graph operations
    #[arg(long, global = true, default_value = "default")]
    project: String,

    /// Branch scope; omitted means the project's default branch
    #[arg(long, global = true)]
    branch: Option<String>,

    /// Config file path (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage branches
    Branches {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Manage graph objects
    Objects {
        #[command(subcommand)]
        action: ObjectAction,
    },

    /// Manage graph relationships
    Relationships {
        #[command(subcommand)]
        action: RelationshipAction,
    },

    /// Merge one object into another
    Merge {
        /// Source canonical id (merged away)
        source: String,
        /// Target canonical id (kept)
        target: String,
        /// Conflict strategy: source-wins or target-wins
        #[arg(long, default_value = "source-wins")]
        strategy: String,
        /// Skip writing merge provenance
        #[arg(long)]
        no_provenance: bool,
        /// Acting user recorded in provenance
        #[arg(long)]
        user: Option<String>,
    },

    /// Traverse the graph from root objects
    Traverse {
        /// Root canonical ids
        roots: Vec<String>,
        #[arg(long, default_value_t = 1)]
        depth: u32,
        /// Depth-by-depth frontier queries instead of one recursive query
        #[arg(long)]
        phased: bool,
    },

    /// Hybrid search over visible objects
    Search {
        /// Query text
        query: String,
        #[arg(long)]
        types: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Embed the query and include the vector modality
        #[arg(long)]
        semantic: bool,
    },

    /// Manage embedding jobs
    Jobs {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Run the embedding worker
    Worker {
        /// Process due jobs once and exit instead of polling
        #[arg(long)]
        drain: bool,
    },

    /// Run health checks
    Doctor,
}

#[derive(Subcommand)]
enum BranchAction {
    /// Create a branch, optionally forked from a parent
    Create {
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// List branches in the project
    List,
    /// Show a branch and its lineage
    Show { id: String },
    /// Rename a branch
    Rename { id: String, name: String },
    /// Delete a branch
    Delete { id: String },
}

#[derive(Subcommand)]
enum ObjectAction {
    /// Create an object
    Create {
        /// Object type (e.g. Requirement, Decision)
        object_type: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Properties as a JSON object
        #[arg(long)]
        properties: Option<String>,
        /// Comma-separated labels
        #[arg(long)]
        labels: Option<String>,
        /// Enqueue an embedding job for the new object
        #[arg(long)]
        embed: bool,
    },
    /// Resolve and show an object's head version
    Get { canonical_id: String },
    /// Patch an object, creating a new version
    Patch {
        canonical_id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        properties: Option<String>,
        #[arg(long)]
        labels: Option<String>,
    },
    /// Soft-delete an object
    Delete { canonical_id: String },
    /// Restore a deleted version row
    Restore { row_id: String },
    /// Show all versions of an object
    History { canonical_id: String },
    /// List objects with structured filters
    List {
        #[arg(long)]
        types: Vec<String>,
        #[arg(long)]
        key_prefix: Option<String>,
        #[arg(long)]
        label: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long)]
        include_deleted: bool,
    },
    /// Show the relationships attached to an object
    Edges { canonical_id: String },
    /// List distinct labels with usage counts
    Tags,
}

#[derive(Subcommand)]
enum RelationshipAction {
    /// Create a relationship between two objects
    Create {
        rel_type: String,
        src: String,
        dst: String,
        #[arg(long)]
        properties: Option<String>,
        #[arg(long)]
        weight: Option<f64>,
    },
    /// Soft-delete a relationship
    Delete { canonical_id: String },
    /// Show all versions of a relationship
    History { canonical_id: String },
}

#[derive(Subcommand)]
enum JobAction {
    /// Enqueue an embedding job for an object version row
    Enqueue {
        object_id: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Show queue depth by status
    Stats,
    /// Requeue stale processing jobs
    Recover {
        #[arg(long, default_value_t = 10)]
        threshold_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };

    let db = Database::new(config.database_config()).await?;
    let pool = db.pool().clone();

    let versioning = VersioningService::new(pool.clone());
    let query = GraphQueryService::new(pool.clone());
    let merge = MergeService::with_lock_wait(
        pool.clone(),
        Duration::from_millis(config.merge.lock_wait_ms),
    );
    let queue = JobQueue::new(
        pool.clone(),
        RetryPolicy {
            base_delay_secs: config.worker.base_retry_delay_secs,
            max_delay_secs: config.worker.max_retry_delay_secs,
            max_attempts: config.worker.max_attempts,
        },
    );

    let scope = Scope {
        project_id: cli.project.clone(),
        branch_id: cli.branch.clone(),
    };
    let format = cli.format;

    match cli.command {
        Commands::Branches { action } => match action {
            BranchAction::Create { name, parent } => {
                let branch = versioning
                    .create_branch(&name, Some(&scope.project_id), parent.as_deref())
                    .await?;
                emit(format, &branch, |b| {
                    format!("Created branch {} ({})", b.name, b.id)
                })?;
            }
            BranchAction::List => {
                let branches = versioning.list_branches(Some(&scope.project_id)).await?;
                emit(format, &branches, |branches| {
                    branches
                        .iter()
                        .map(|b| format!("{}  {}", b.id, b.name))
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            }
            BranchAction::Show { id } => {
                let branch = versioning
                    .get_branch(&id)
                    .await?
                    .with_context(|| format!("branch '{id}' not found"))?;
                let lineage = versioning.branch_lineage(&id).await?;
                emit(format, &(branch, lineage), |(b, lineage)| {
                    let chain = lineage
                        .iter()
                        .map(|l| format!("  depth {}: {}", l.depth, l.ancestor_branch_id))
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!("{} ({})\nlineage:\n{}", b.name, b.id, chain)
                })?;
            }
            BranchAction::Rename { id, name } => {
                let branch = versioning.rename_branch(&id, &name).await?;
                emit(format, &branch, |b| format!("Renamed branch to {}", b.name))?;
            }
            BranchAction::Delete { id } => {
                versioning.delete_branch(&id).await?;
                println!("Deleted branch {id}");
            }
        },

        Commands::Objects { action } => match action {
            ObjectAction::Create {
                object_type,
                key,
                status,
                properties,
                labels,
                embed,
            } => {
                let mut draft = ObjectDraft::new(object_type);
                draft.key = key;
                draft.status = status;
                draft.properties = parse_properties(properties.as_deref())?;
                draft.labels = parse_labels(labels.as_deref());

                let object = versioning.create_object(draft, &scope).await?;
                if embed {
                    queue
                        .enqueue(EnqueueOptions::for_object(object.id.clone()))
                        .await?;
                    info!(object_id = %object.id, "Embedding job enqueued");
                }
                emit(format, &object, |o| {
                    format!("Created {} {} (version {})", o.object_type, o.id, o.version)
                })?;
            }
            ObjectAction::Get { canonical_id } => {
                let object = versioning
                    .resolve_head(&canonical_id, &scope)
                    .await?
                    .with_context(|| format!("object '{canonical_id}' has no visible head"))?;
                emit(format, &object, render_object)?;
            }
            ObjectAction::Patch {
                canonical_id,
                status,
                properties,
                labels,
            } => {
                let patch = ObjectPatch {
                    status,
                    properties: match properties.as_deref() {
                        Some(raw) => Some(parse_properties(Some(raw))?),
                        None => None,
                    },
                    labels: labels.as_deref().map(|raw| parse_labels(Some(raw))),
                    ..Default::default()
                };
                let object = versioning.patch_object(&canonical_id, patch, &scope).await?;
                emit(format, &object, |o| {
                    format!("Patched {} to version {}", o.canonical_id, o.version)
                })?;
            }
            ObjectAction::Delete { canonical_id } => {
                let deleted = versioning.delete_object(&canonical_id, &scope).await?;
                emit(format, &deleted, |o| format!("Deleted {} ({})", o.canonical_id, o.id))?;
            }
            ObjectAction::Restore { row_id } => {
                let restored = versioning.restore_object(&row_id, &scope).await?;
                emit(format, &restored, |o| format!("Restored {}", o.canonical_id))?;
            }
            ObjectAction::History { canonical_id } => {
                let versions = versioning.object_history(&canonical_id, &scope).await?;
                emit(format, &versions, |versions| {
                    versions
                        .iter()
                        .map(|v| {
                            let state = if v.deleted_at.is_some() { "deleted" } else { "live" };
                            format!("v{}  {}  {}", v.version, v.id, state)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            }
            ObjectAction::List {
                types,
                key_prefix,
                label,
                limit,
                cursor,
                include_deleted,
            } => {
                let mut filter = ObjectFilter::default()
                    .with_types(types)
                    .with_labels_all(label);
                if let Some(prefix) = key_prefix {
                    filter = filter.with_key_prefix(prefix);
                }
                if include_deleted {
                    filter = filter.include_deleted();
                }
                let page = query
                    .search(
                        SearchQuery {
                            filter,
                            limit,
                            cursor,
                            deadline: None,
                        },
                        &scope,
                    )
                    .await?;
                emit(format, &page, |page| {
                    let mut out: Vec<String> = page.items.iter().map(render_object).collect();
                    out.push(format!("total: {}", page.total));
                    if let Some(next) = &page.next_cursor {
                        out.push(format!("next cursor: {next}"));
                    }
                    out.join("\n")
                })?;
            }
            ObjectAction::Edges { canonical_id } => {
                let edges = query.object_edges(&canonical_id, &scope).await?;
                emit(format, &edges, |edges| {
                    let mut out = Vec::new();
                    for rel in &edges.outgoing {
                        out.push(format!("-[{}]-> {}", rel.rel_type, rel.dst_id));
                    }
                    for rel in &edges.incoming {
                        out.push(format!("<-[{}]- {}", rel.rel_type, rel.src_id));
                    }
                    out.join("\n")
                })?;
            }
            ObjectAction::Tags => {
                let tags = query.get_all_tags(&ObjectFilter::default(), &scope).await?;
                emit(format, &tags, |tags| {
                    tags.iter()
                        .map(|t| format!("{}  {}", t.label, t.count))
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            }
        },

        Commands::Relationships { action } => match action {
            RelationshipAction::Create {
                rel_type,
                src,
                dst,
                properties,
                weight,
            } => {
                let mut draft = RelationshipDraft::new(rel_type, src, dst);
                draft.properties = parse_properties(properties.as_deref())?;
                draft.weight = weight;
                let relationship = versioning.create_relationship(draft, &scope).await?;
                emit(format, &relationship, |r| {
                    format!("Created {} {} -> {} ({})", r.rel_type, r.src_id, r.dst_id, r.id)
                })?;
            }
            RelationshipAction::Delete { canonical_id } => {
                let deleted = versioning.delete_relationship(&canonical_id, &scope).await?;
                emit(format, &deleted, |r| format!("Deleted relationship {}", r.canonical_id))?;
            }
            RelationshipAction::History { canonical_id } => {
                let versions = versioning.relationship_history(&canonical_id, &scope).await?;
                emit(format, &versions, |versions| {
                    versions
                        .iter()
                        .map(|v| {
                            let state = if v.deleted_at.is_some() { "deleted" } else { "live" };
                            format!("v{}  {} -> {}  {}", v.version, v.src_id, v.dst_id, state)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })?;
            }
        },

        Commands::Merge {
            source,
            target,
            strategy,
            no_provenance,
            user,
        } => {
            let strategy = MergeStrategy::parse(&strategy)
                .with_context(|| format!("unknown merge strategy '{strategy}'"))?;
            let outcome = merge
                .merge_objects(
                    &source,
                    &target,
                    MergeOptions {
                        strategy,
                        track_provenance: !no_provenance,
                        merged_by: user,
                    },
                    &scope,
                )
                .await?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "source_object_id": outcome.source_object_id,
                        "target_object_id": outcome.target_object_id,
                        "deleted_source_id": outcome.deleted_source_id,
                        "redirected_relationships": outcome.redirected_relationships,
                        "merged_properties": outcome.merged_properties,
                    })
                ),
                OutputFormat::Text => println!(
                    "Merged {} into {} ({} relationships redirected)",
                    outcome.source_object_id, outcome.target_object_id,
                    outcome.redirected_relationships
                ),
            }
        }

        Commands::Traverse {
            roots,
            depth,
            phased,
        } => {
            if roots.is_empty() {
                bail!("at least one root id is required");
            }
            let snapshot = query
                .traverse(
                    &roots,
                    TraverseOptions {
                        max_depth: depth,
                        phased,
                        deadline: None,
                    },
                    &scope,
                )
                .await?;
            emit(format, &snapshot, |snapshot| {
                let mut out: Vec<String> = snapshot
                    .nodes
                    .iter()
                    .map(|n| format!("[depth {}] {}", n.depth, render_object(&n.object)))
                    .collect();
                for rel in &snapshot.edges {
                    out.push(format!("{} -[{}]-> {}", rel.src_id, rel.rel_type, rel.dst_id));
                }
                out.join("\n")
            })?;
        }

        Commands::Search {
            query: text,
            types,
            limit,
            semantic,
        } => {
            let vector = if semantic {
                let embedder = HashEmbedder::default();
                Some(lattice_core::jobs::Embedder::embed(&embedder, &text).await?)
            } else {
                None
            };
            let hits = query
                .hybrid_search(
                    HybridSearchRequest {
                        query: Some(text),
                        vector,
                        filter: ObjectFilter::default().with_types(types),
                        limit,
                        ..Default::default()
                    },
                    &scope,
                )
                .await?;
            emit(format, &hits, |hits| {
                hits.iter()
                    .map(|h| format!("{:.4}  {}", h.score, render_object(&h.object)))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }

        Commands::Jobs { action } => match action {
            JobAction::Enqueue {
                object_id,
                priority,
            } => {
                let job = queue
                    .enqueue(EnqueueOptions::for_object(object_id).with_priority(priority))
                    .await?;
                println!("Enqueued job {} ({})", job.id, job.status);
            }
            JobAction::Stats => {
                let stats = queue.stats().await?;
                println!(
                    "pending: {}  processing: {}  completed: {}  failed: {}",
                    stats.pending, stats.processing, stats.completed, stats.failed
                );
            }
            JobAction::Recover { threshold_minutes } => {
                let recovered = queue.recover_stale(threshold_minutes).await?;
                println!("Recovered {recovered} stale jobs");
            }
        },

        Commands::Worker { drain } => {
            let worker = EmbeddingWorker::new(
                queue.clone(),
                Arc::new(HashEmbedder::default()),
                pool.clone(),
                config.worker.clone(),
            );
            if drain {
                let metrics = worker.drain_once().await?;
                println!(
                    "processed: {}  succeeded: {}  failed: {}",
                    metrics.processed, metrics.succeeded, metrics.failed
                );
            } else {
                worker.start().await?;
                info!("Worker running, press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                worker.stop().await?;
                let metrics = worker.metrics();
                println!(
                    "processed: {}  succeeded: {}  failed: {}",
                    metrics.processed, metrics.succeeded, metrics.failed
                );
            }
        }

        Commands::Doctor => {
            db.health_check().await?;
            let status = db.migration_status().await?;
            println!(
                "database ok (schema v{}/{})",
                status.current_version, status.target_version
            );
            let stats = queue.stats().await?;
            println!(
                "jobs: {} pending, {} processing, {} failed",
                stats.pending, stats.processing, stats.failed
            );
        }
    }

    Ok(())
}

fn emit<T: serde::Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl Fn(&T) -> String,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}

fn render_object(object: &lattice_core::prelude::GraphObject) -> String {
    let key = object.key.as_deref().unwrap_or("-");
    format!(
        "{} {} key={} v{} {}",
        object.object_type,
        object.canonical_id,
        key,
        object.version,
        object
            .labels
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    )
}

fn parse_properties(raw: Option<&str>) -> anyhow::Result<Properties> {
    match raw {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("properties must be a JSON object")?;
            match value {
                serde_json::Value::Object(map) => Ok(map),
                _ => bail!("properties must be a JSON object"),
            }
        }
        None => Ok(Properties::new()),
    }
}

fn parse_labels(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}
