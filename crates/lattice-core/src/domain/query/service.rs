//! Graph query service
//!
//! Traversal, paged listing, and the three search modalities (lexical,
//! vector, hybrid). Every query applies the same visibility filter: head
//! versions only, not tombstoned (unless asked), branch-visible through
//! the precomputed lineage.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::debug;

use crate::domain::graph::{GraphObject, GraphRelationship, ObjectEdges, Scope};
use crate::domain::rows::{ObjectRow, RelationshipRow};
use crate::domain::visibility::{self, SqlFragment};
use crate::error::{Error, Result};

use super::filter::{
    decode_cursor, encode_cursor, CursorPos, FullTextSearchOptions, GraphSnapshot,
    HybridSearchRequest, ObjectFilter, Page, SearchHit, SearchQuery, SnapshotNode, TagCount,
    TraverseOptions, VectorSearchOptions,
};

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 200;
const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;
const MAX_TRAVERSE_DEPTH: u32 = 16;

/// Read-side service over the versioned graph
#[derive(Clone)]
pub struct GraphQueryService {
    pool: SqlitePool,
}

impl GraphQueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========== Paged listing ==========

    /// List visible head objects matching the structured filter.
    ///
    /// Ordering is `created_at ASC, id ASC`; the cursor encodes the last
    /// row's sort key rather than an offset, so pages are stable under
    /// concurrent writes.
    pub async fn search(&self, query: SearchQuery, scope: &Scope) -> Result<Page<GraphObject>> {
        with_deadline(query.deadline, self.search_inner(&query, scope)).await
    }

    async fn search_inner(&self, query: &SearchQuery, scope: &Scope) -> Result<Page<GraphObject>> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;

        let head = object_head_fragment(scope, query.filter.include_deleted);
        let filter = query.filter.to_sql("a");

        // Total ignores pagination
        let count_sql = format!(
            "SELECT COUNT(*) FROM graph_objects a WHERE {} AND {}",
            head.clause, filter.clause
        );
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        for bind in head.binds.iter().chain(filter.binds.iter()) {
            count_query = count_query.bind(bind);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let mut sql = format!(
            "SELECT a.* FROM graph_objects a WHERE {} AND {}",
            head.clause, filter.clause
        );
        if cursor.is_some() {
            sql.push_str(" AND (a.created_at > ? OR (a.created_at = ? AND a.id > ?))");
        }
        sql.push_str(" ORDER BY a.created_at ASC, a.id ASC LIMIT ?");

        let mut page_query = sqlx::query_as::<_, ObjectRow>(&sql);
        for bind in head.binds.iter().chain(filter.binds.iter()) {
            page_query = page_query.bind(bind);
        }
        if let Some(pos) = &cursor {
            page_query = page_query
                .bind(&pos.created_at)
                .bind(&pos.created_at)
                .bind(&pos.id);
        }
        // Fetch one extra row to detect whether another page exists
        page_query = page_query.bind((limit + 1) as i64);

        let mut rows = page_query.fetch_all(&self.pool).await?;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = if has_more {
            rows.last().map(|row| {
                encode_cursor(&CursorPos {
                    created_at: row.created_at.clone(),
                    id: row.id.clone(),
                })
            })
        } else {
            None
        };

        let items = rows
            .into_iter()
            .map(|r| r.into_object())
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total,
            next_cursor,
        })
    }

    // ========== Lexical search ==========

    /// Full-text search over the derived lexical index, ranked by bm25
    pub async fn full_text_search(
        &self,
        text: &str,
        opts: FullTextSearchOptions,
        scope: &Scope,
    ) -> Result<Vec<SearchHit>> {
        with_deadline(opts.deadline, self.full_text_inner(text, &opts, scope)).await
    }

    async fn full_text_inner(
        &self,
        text: &str,
        opts: &FullTextSearchOptions,
        scope: &Scope,
    ) -> Result<Vec<SearchHit>> {
        let match_expr = fts_match_expr(text);
        if match_expr.is_empty() {
            return Err(Error::InvalidInput("search text is required".into()));
        }
        let limit = opts.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);

        let head = object_head_fragment(scope, opts.filter.include_deleted);
        let filter = opts.filter.to_sql("a");

        let sql = format!(
            "SELECT a.*, bm25(graph_objects_fts) AS rank \
             FROM graph_objects_fts \
             JOIN graph_objects a ON a.rowid = graph_objects_fts.rowid \
             WHERE graph_objects_fts MATCH ? AND {} AND {} \
             ORDER BY rank ASC, a.id ASC LIMIT ?",
            head.clause, filter.clause
        );

        let mut query = sqlx::query_as::<_, FtsRow>(&sql).bind(&match_expr);
        for bind in head.binds.iter().chain(filter.binds.iter()) {
            query = query.bind(bind);
        }
        query = query.bind(limit as i64);

        let rows = query.fetch_all(&self.pool).await?;
        let best = rows
            .iter()
            .map(|r| -r.rank)
            .fold(f64::NEG_INFINITY, f64::max);

        rows.into_iter()
            .map(|row| {
                // bm25 is smaller-is-better (negative); normalize against
                // the best hit so fusion weights act on [0, 1]
                let lexical = if best > 0.0 { (-row.rank) / best } else { 1.0 };
                Ok(SearchHit {
                    object: row.object.into_object()?,
                    score: lexical,
                    vector_distance: None,
                    lexical_score: Some(lexical),
                })
            })
            .collect()
    }

    // ========== Vector search ==========

    /// Nearest-neighbor search over stored embeddings, cosine distance.
    ///
    /// Ties are broken by distance ascending then id.
    pub async fn vector_search(
        &self,
        query_vector: &[f32],
        opts: VectorSearchOptions,
        scope: &Scope,
    ) -> Result<Vec<SearchHit>> {
        with_deadline(opts.deadline, self.vector_inner(query_vector, &opts, scope)).await
    }

    async fn vector_inner(
        &self,
        query_vector: &[f32],
        opts: &VectorSearchOptions,
        scope: &Scope,
    ) -> Result<Vec<SearchHit>> {
        if query_vector.is_empty() {
            return Err(Error::InvalidInput("query vector is required".into()));
        }
        if let Some(max) = opts.max_distance {
            if !(0.0..=2.0).contains(&max) {
                return Err(Error::InvalidInput(format!(
                    "max_distance must lie in [0, 2], got {max}"
                )));
            }
        }
        let limit = opts.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);

        let head = object_head_fragment(scope, opts.filter.include_deleted);
        let filter = opts.filter.to_sql("a");

        let sql = format!(
            "SELECT a.* FROM graph_objects a \
             WHERE a.embedding IS NOT NULL AND {} AND {}",
            head.clause, filter.clause
        );
        let mut query = sqlx::query_as::<_, ObjectRow>(&sql);
        for bind in head.binds.iter().chain(filter.binds.iter()) {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut scored: Vec<(f64, GraphObject)> = Vec::new();
        for row in rows {
            let object = row.into_object()?;
            let Some(embedding) = object.embedding.as_deref() else {
                continue;
            };
            if embedding.len() != query_vector.len() {
                debug!(
                    object_id = %object.id,
                    stored = embedding.len(),
                    queried = query_vector.len(),
                    "Skipping embedding with mismatched dimensions"
                );
                continue;
            }
            let distance = 1.0 - f64::from(cosine_similarity(query_vector, embedding));
            if opts.max_distance.is_some_and(|max| distance > max) {
                continue;
            }
            scored.push((distance, object));
        }

        scored.sort_by(|(da, a), (db, b)| {
            da.partial_cmp(db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(distance, object)| SearchHit {
                object,
                score: 1.0 - distance / 2.0,
                vector_distance: Some(distance),
                lexical_score: None,
            })
            .collect())
    }

    // ========== Hybrid search ==========

    /// Run lexical and vector search over the same filter set and fuse by
    /// weighted score.
    ///
    /// When one modality returns nothing (or was not requested), the
    /// other's results are returned as-is rather than an empty merge.
    pub async fn hybrid_search(
        &self,
        request: HybridSearchRequest,
        scope: &Scope,
    ) -> Result<Vec<SearchHit>> {
        with_deadline(request.deadline, self.hybrid_inner(&request, scope)).await
    }

    async fn hybrid_inner(
        &self,
        request: &HybridSearchRequest,
        scope: &Scope,
    ) -> Result<Vec<SearchHit>> {
        if request.query.is_none() && request.vector.is_none() {
            return Err(Error::InvalidInput(
                "hybrid search requires a query or a vector".into(),
            ));
        }
        let limit = request
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        let lexical_weight = request.lexical_weight.unwrap_or(0.5);
        let vector_weight = request.vector_weight.unwrap_or(0.5);
        if lexical_weight < 0.0 || vector_weight < 0.0 {
            return Err(Error::InvalidInput("search weights must be >= 0".into()));
        }

        // Over-fetch per modality so fusion has candidates to reorder
        let modality_limit = (limit * 2).min(MAX_SEARCH_LIMIT);

        let lexical_hits = match &request.query {
            Some(text) => {
                self.full_text_inner(
                    text,
                    &FullTextSearchOptions {
                        filter: request.filter.clone(),
                        limit: Some(modality_limit),
                        deadline: None,
                    },
                    scope,
                )
                .await?
            }
            None => Vec::new(),
        };

        let vector_hits = match &request.vector {
            Some(vector) => {
                self.vector_inner(
                    vector,
                    &VectorSearchOptions {
                        filter: request.filter.clone(),
                        limit: Some(modality_limit),
                        max_distance: request.max_distance,
                        deadline: None,
                    },
                    scope,
                )
                .await?
            }
            None => Vec::new(),
        };

        // Fallback: a single non-empty modality stands alone
        if lexical_hits.is_empty() {
            let mut hits = vector_hits;
            hits.truncate(limit);
            return Ok(hits);
        }
        if vector_hits.is_empty() {
            let mut hits = lexical_hits;
            hits.truncate(limit);
            return Ok(hits);
        }

        let mut fused: HashMap<String, SearchHit> = HashMap::new();
        for hit in lexical_hits {
            let lexical = hit.lexical_score.unwrap_or(0.0);
            fused.insert(
                hit.object.canonical_id.clone(),
                SearchHit {
                    score: lexical_weight * lexical,
                    ..hit
                },
            );
        }
        for hit in vector_hits {
            let vector_score = hit.score;
            match fused.entry(hit.object.canonical_id.clone()) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let merged = entry.get_mut();
                    merged.score += vector_weight * vector_score;
                    merged.vector_distance = hit.vector_distance;
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(SearchHit {
                        score: vector_weight * vector_score,
                        ..hit
                    });
                }
            }
        }

        let mut hits: Vec<SearchHit> = fused.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.object.id.cmp(&b.object.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    // ========== Traversal ==========

    /// Expand relationships breadth-first from the root canonical ids.
    ///
    /// Roots that resolve to nothing are silently omitted. Nodes and
    /// edges are deduplicated by canonical id; every node carries its
    /// discovery depth.
    pub async fn traverse(
        &self,
        root_ids: &[String],
        opts: TraverseOptions,
        scope: &Scope,
    ) -> Result<GraphSnapshot> {
        let deadline = opts.deadline;
        with_deadline(deadline, self.traverse_inner(root_ids, &opts, scope)).await
    }

    async fn traverse_inner(
        &self,
        root_ids: &[String],
        opts: &TraverseOptions,
        scope: &Scope,
    ) -> Result<GraphSnapshot> {
        let max_depth = opts.max_depth.clamp(1, MAX_TRAVERSE_DEPTH);

        // Resolve roots; unresolvable roots are omitted, not an error
        let roots = self.resolve_heads(root_ids, scope).await?;
        if roots.is_empty() {
            return Ok(GraphSnapshot::default());
        }

        let mut nodes: HashMap<String, SnapshotNode> = roots
            .into_iter()
            .map(|object| {
                (
                    object.canonical_id.clone(),
                    SnapshotNode { object, depth: 0 },
                )
            })
            .collect();

        let discovered = if opts.phased {
            self.discover_phased(&nodes, max_depth, scope).await?
        } else {
            self.discover_recursive(&nodes, max_depth, scope).await?
        };

        // Resolve discovered ids to head objects; ids whose head is gone
        // (deleted endpoints) drop out here
        let pending: Vec<String> = discovered
            .iter()
            .filter(|(id, _)| !nodes.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for object in self.resolve_heads(&pending, scope).await? {
            let depth = discovered
                .get(&object.canonical_id)
                .copied()
                .unwrap_or(max_depth);
            nodes.insert(
                object.canonical_id.clone(),
                SnapshotNode { object, depth },
            );
        }

        let edges = self.edges_within(&nodes, scope).await?;

        let mut nodes: Vec<SnapshotNode> = nodes.into_values().collect();
        nodes.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.object.canonical_id.cmp(&b.object.canonical_id))
        });

        Ok(GraphSnapshot { nodes, edges })
    }

    /// Single recursive query expanding all depths in one pass
    async fn discover_recursive(
        &self,
        roots: &HashMap<String, SnapshotNode>,
        max_depth: u32,
        scope: &Scope,
    ) -> Result<HashMap<String, u32>> {
        let head = relationship_head_fragment(scope);
        let root_ids: Vec<&str> = roots.keys().map(String::as_str).collect();
        let roots_json = serde_json::to_string(&root_ids)?;

        let sql = format!(
            r#"
            WITH RECURSIVE live_rel AS (
                SELECT a.src_id, a.dst_id FROM graph_relationships a WHERE {}
            ),
            reach(node_id, depth) AS (
                SELECT value, 0 FROM json_each(?)
                UNION
                SELECT
                    CASE WHEN lr.src_id = reach.node_id THEN lr.dst_id ELSE lr.src_id END,
                    reach.depth + 1
                FROM reach
                JOIN live_rel lr ON lr.src_id = reach.node_id OR lr.dst_id = reach.node_id
                WHERE reach.depth < ?
            )
            SELECT node_id, MIN(depth) AS depth FROM reach GROUP BY node_id
            "#,
            head.clause
        );

        let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
        for bind in &head.binds {
            query = query.bind(bind);
        }
        query = query.bind(&roots_json).bind(max_depth as i64);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, depth)| (id, depth as u32))
            .collect())
    }

    /// Depth-by-depth frontier queries; bounded per-query complexity on
    /// dense graphs at the cost of round-trips
    async fn discover_phased(
        &self,
        roots: &HashMap<String, SnapshotNode>,
        max_depth: u32,
        scope: &Scope,
    ) -> Result<HashMap<String, u32>> {
        let mut discovered: HashMap<String, u32> =
            roots.keys().map(|id| (id.clone(), 0)).collect();
        let mut frontier: HashSet<String> = roots.keys().cloned().collect();

        for depth in 1..=max_depth {
            if frontier.is_empty() {
                break;
            }
            let frontier_ids: Vec<&str> = frontier.iter().map(String::as_str).collect();
            let frontier_json = serde_json::to_string(&frontier_ids)?;

            let head = relationship_head_fragment(scope);
            let sql = format!(
                "SELECT a.src_id, a.dst_id FROM graph_relationships a \
                 WHERE {} AND (a.src_id IN (SELECT value FROM json_each(?)) \
                 OR a.dst_id IN (SELECT value FROM json_each(?)))",
                head.clause
            );
            let mut query = sqlx::query_as::<_, (String, String)>(&sql);
            for bind in &head.binds {
                query = query.bind(bind);
            }
            query = query.bind(&frontier_json).bind(&frontier_json);
            let rows = query.fetch_all(&self.pool).await?;

            let mut next_frontier = HashSet::new();
            for (src_id, dst_id) in rows {
                for node_id in [src_id, dst_id] {
                    if !discovered.contains_key(&node_id) {
                        discovered.insert(node_id.clone(), depth);
                        next_frontier.insert(node_id);
                    }
                }
            }
            frontier = next_frontier;
        }

        Ok(discovered)
    }

    /// Live relationship heads whose endpoints both lie in the node set
    async fn edges_within(
        &self,
        nodes: &HashMap<String, SnapshotNode>,
        scope: &Scope,
    ) -> Result<Vec<GraphRelationship>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let node_ids: Vec<&str> = nodes.keys().map(String::as_str).collect();
        let nodes_json = serde_json::to_string(&node_ids)?;

        let head = relationship_head_fragment(scope);
        let sql = format!(
            "SELECT a.* FROM graph_relationships a \
             WHERE {} AND a.src_id IN (SELECT value FROM json_each(?)) \
             AND a.dst_id IN (SELECT value FROM json_each(?)) \
             ORDER BY a.created_at ASC, a.id ASC",
            head.clause
        );
        let mut query = sqlx::query_as::<_, RelationshipRow>(&sql);
        for bind in &head.binds {
            query = query.bind(bind);
        }
        query = query.bind(&nodes_json).bind(&nodes_json);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_relationship()).collect()
    }

    /// Resolve many canonical ids to their visible live heads in one query
    async fn resolve_heads(&self, ids: &[String], scope: &Scope) -> Result<Vec<GraphObject>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids_json = serde_json::to_string(&ids)?;

        let head = object_head_fragment(scope, false);
        let sql = format!(
            "SELECT a.* FROM graph_objects a \
             WHERE {} AND a.canonical_id IN (SELECT value FROM json_each(?))",
            head.clause
        );
        let mut query = sqlx::query_as::<_, ObjectRow>(&sql);
        for bind in &head.binds {
            query = query.bind(bind);
        }
        query = query.bind(&ids_json);

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_object()).collect()
    }

    // ========== Edges & tags ==========

    /// The live relationship heads attached to one object, by direction
    pub async fn object_edges(&self, canonical_id: &str, scope: &Scope) -> Result<ObjectEdges> {
        let head = relationship_head_fragment(scope);
        let sql = format!(
            "SELECT a.* FROM graph_relationships a \
             WHERE {} AND (a.src_id = ? OR a.dst_id = ?) \
             ORDER BY a.created_at ASC, a.id ASC",
            head.clause
        );
        let mut query = sqlx::query_as::<_, RelationshipRow>(&sql);
        for bind in &head.binds {
            query = query.bind(bind);
        }
        query = query.bind(canonical_id).bind(canonical_id);
        let rows = query.fetch_all(&self.pool).await?;

        let mut edges = ObjectEdges::default();
        for row in rows {
            let relationship = row.into_relationship()?;
            if relationship.dst_id == canonical_id {
                edges.incoming.push(relationship);
            } else {
                edges.outgoing.push(relationship);
            }
        }
        Ok(edges)
    }

    /// Distinct label strings with usage counts over visible heads,
    /// sorted by label
    pub async fn get_all_tags(&self, filter: &ObjectFilter, scope: &Scope) -> Result<Vec<TagCount>> {
        let head = object_head_fragment(scope, filter.include_deleted);
        let extra = filter.to_sql("a");
        let sql = format!(
            "SELECT je.value AS label, COUNT(*) AS count \
             FROM graph_objects a, json_each(a.labels) je \
             WHERE {} AND {} \
             GROUP BY je.value ORDER BY je.value",
            head.clause, extra.clause
        );
        let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
        for bind in head.binds.iter().chain(extra.binds.iter()) {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(label, count)| TagCount { label, count })
            .collect())
    }
}

/// Head fragment for objects, honoring include_deleted
fn object_head_fragment(scope: &Scope, include_deleted: bool) -> SqlFragment {
    if include_deleted {
        let vis = visibility::visible("a", scope);
        let newest = visibility::is_newest("graph_objects", "a", scope);
        let mut binds = vis.binds;
        binds.extend(newest.binds);
        SqlFragment {
            clause: format!("{} AND {}", vis.clause, newest.clause),
            binds,
        }
    } else {
        visibility::live_head("graph_objects", "a", scope)
    }
}

/// Head fragment for relationships (live heads only)
fn relationship_head_fragment(scope: &Scope) -> SqlFragment {
    visibility::live_head("graph_relationships", "a", scope)
}

/// Sanitize free text into an FTS5 MATCH expression: each token becomes a
/// quoted phrase so user input cannot inject FTS syntax
fn fts_match_expr(text: &str) -> String {
    text.split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|quoted| quoted.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute cosine similarity between two vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Run a query future under an optional deadline
async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}

#[derive(sqlx::FromRow)]
struct FtsRow {
    #[sqlx(flatten)]
    object: ObjectRow,
    rank: f64,
}
