//! Object merge service
//!
//! Consolidates two canonical identities into one: merges properties,
//! appends provenance, redirects relationships, and tombstones the
//! source — all inside a single transaction serialized by the pair-keyed
//! advisory lock. Any step failure rolls the whole transaction back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::domain::graph::{
    GraphObject, GraphRelationship, ObjectPatch, Properties, RelationshipPatch, Scope,
    MERGED_INTO_KEY, MERGE_HISTORY_KEY,
};
use crate::domain::rows::RelationshipRow;
use crate::domain::versioning::service::{
    find_live_relationship, insert_object, insert_relationship, resolve_object_head,
    successor_object, successor_relationship, supersede_object, supersede_relationship,
};
use crate::domain::visibility;
use crate::error::{Error, Result};
use crate::storage::format_ts;

use super::lock::MergeLockRegistry;

/// Which side wins when both objects define the same top-level field.
///
/// Fields present on only one side always survive (union semantics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeStrategy {
    #[default]
    SourceWins,
    TargetWins,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceWins => "source-wins",
            Self::TargetWins => "target-wins",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "source-wins" | "source_wins" | "source" => Some(Self::SourceWins),
            "target-wins" | "target_wins" | "target" => Some(Self::TargetWins),
            _ => None,
        }
    }
}

/// Merge options
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    /// Append a provenance entry to the target's merge history
    pub track_provenance: bool,
    /// Acting user recorded in the provenance entry
    pub merged_by: Option<String>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::SourceWins,
            track_provenance: true,
            merged_by: None,
        }
    }
}

/// What a successful merge did, for caller-side auditing
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Canonical id of the merged-away source
    pub source_object_id: String,
    /// Physical id of the new target head version
    pub target_object_id: String,
    /// Physical id of the source's terminal tombstone version
    pub deleted_source_id: String,
    /// The merged property document written to the target
    pub merged_properties: Properties,
    /// Relationships repointed at the target (self-loop and duplicate
    /// skips are not counted)
    pub redirected_relationships: u64,
}

/// Transactional identity-merge over the versioned graph
#[derive(Clone)]
pub struct MergeService {
    pool: SqlitePool,
    locks: Arc<MergeLockRegistry>,
}

impl MergeService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(MergeLockRegistry::with_defaults()),
        }
    }

    /// Override how long a merge waits on a contended pair lock
    pub fn with_lock_wait(pool: SqlitePool, wait: Duration) -> Self {
        Self {
            pool,
            locks: Arc::new(MergeLockRegistry::new(wait)),
        }
    }

    /// Merge the source canonical identity into the target.
    ///
    /// All-or-nothing: on any failure the transaction rolls back and no
    /// partial state (half-redirected relationships, orphaned tombstones)
    /// survives.
    pub async fn merge_objects(
        &self,
        source_id: &str,
        target_id: &str,
        options: MergeOptions,
        scope: &Scope,
    ) -> Result<MergeOutcome> {
        if source_id == target_id {
            return Err(Error::InvalidInput(
                "cannot merge an object into itself".into(),
            ));
        }

        // Step 1: serialize merges touching the same pair
        let _lock = self.locks.acquire(source_id, target_id).await?;

        let mut tx = self.pool.begin().await?;

        // Step 2: resolve both heads
        let source = resolve_object_head(&mut tx, source_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(format!("merge source '{source_id}'")))?;
        let target = resolve_object_head(&mut tx, target_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(format!("merge target '{target_id}'")))?;

        let now = Utc::now();

        // Step 3: merge properties per strategy
        let mut merged = merge_properties(&source.properties, &target.properties, options.strategy);

        // Step 4: append provenance
        if options.track_provenance {
            append_provenance(&mut merged, &source, options.merged_by.as_deref(), now);
        }

        // Step 5: write the merged target version through the patch path
        if target.branch_id == scope.branch_id {
            supersede_object(&mut tx, &target.id, now).await?;
        }
        let patch = ObjectPatch {
            properties: Some(merged.clone()),
            updated_by: options.merged_by.clone(),
            ..Default::default()
        };
        let new_target = successor_object(&target, &patch, scope, now);
        insert_object(&mut tx, &new_target).await?;

        // Step 6: redirect relationships from the source to the target
        let touching = relationships_touching(&mut tx, &source.canonical_id, scope).await?;
        let mut redirected: u64 = 0;
        for relationship in touching {
            let new_src = if relationship.src_id == source.canonical_id {
                target.canonical_id.clone()
            } else {
                relationship.src_id.clone()
            };
            let new_dst = if relationship.dst_id == source.canonical_id {
                target.canonical_id.clone()
            } else {
                relationship.dst_id.clone()
            };

            // Self-referential skip: never create a target self-loop
            let self_loop = new_src == new_dst;
            let duplicate = !self_loop
                && find_live_relationship(&mut tx, &relationship.rel_type, &new_src, &new_dst, scope)
                    .await?
                    .is_some();

            if relationship.branch_id == scope.branch_id {
                supersede_relationship(&mut tx, &relationship.id, now).await?;
                if !self_loop && !duplicate {
                    let mut successor =
                        successor_relationship(&relationship, &RelationshipPatch::default(), scope, now);
                    successor.src_id = new_src;
                    successor.dst_id = new_dst;
                    insert_relationship(&mut tx, &successor).await?;
                    redirected += 1;
                }
            } else {
                // Head lives on an ancestor branch: shadow it with one new
                // version on this branch (redirected or tombstoned)
                let mut successor =
                    successor_relationship(&relationship, &RelationshipPatch::default(), scope, now);
                if self_loop || duplicate {
                    successor.deleted_at = Some(now);
                } else {
                    successor.src_id = new_src;
                    successor.dst_id = new_dst;
                    redirected += 1;
                }
                insert_relationship(&mut tx, &successor).await?;
            }

            debug!(
                relationship_id = %relationship.canonical_id,
                self_loop,
                duplicate,
                "Merge processed relationship"
            );
        }

        // Step 7: tombstone the source with a merged-away marker
        if source.branch_id == scope.branch_id {
            supersede_object(&mut tx, &source.id, now).await?;
        }
        let mut marker = Properties::new();
        marker.insert(
            MERGED_INTO_KEY.into(),
            Value::String(target.canonical_id.clone()),
        );
        let mut tombstone = successor_object(
            &source,
            &ObjectPatch {
                properties: Some(marker),
                updated_by: options.merged_by.clone(),
                ..Default::default()
            },
            scope,
            now,
        );
        tombstone.deleted_at = Some(now);
        insert_object(&mut tx, &tombstone).await?;

        // Step 8: commit; the lock releases when the guard drops
        tx.commit().await?;

        info!(
            source = %source.canonical_id,
            target = %target.canonical_id,
            redirected_relationships = redirected,
            strategy = options.strategy.as_str(),
            "Objects merged"
        );

        Ok(MergeOutcome {
            source_object_id: source.canonical_id,
            target_object_id: new_target.id,
            deleted_source_id: tombstone.id,
            merged_properties: merged,
            redirected_relationships: redirected,
        })
    }
}

/// Merge two property documents per strategy, per top-level field.
///
/// Bookkeeping keys on the source never clobber the target's: the
/// target's merge history is preserved and appended to, never replaced.
fn merge_properties(
    source: &Properties,
    target: &Properties,
    strategy: MergeStrategy,
) -> Properties {
    let mut source = source.clone();
    source.remove(MERGE_HISTORY_KEY);
    source.remove(MERGED_INTO_KEY);

    match strategy {
        MergeStrategy::SourceWins => {
            let mut merged = target.clone();
            for (key, value) in source {
                merged.insert(key, value);
            }
            merged
        }
        MergeStrategy::TargetWins => {
            let mut merged = source;
            for (key, value) in target {
                merged.insert(key.clone(), value.clone());
            }
            merged
        }
    }
}

/// Append one provenance entry to the merge history array, creating the
/// array if absent. History is append-only and never rewritten.
fn append_provenance(
    merged: &mut Properties,
    source: &GraphObject,
    merged_by: Option<&str>,
    now: chrono::DateTime<Utc>,
) {
    let entry = json!({
        "merged_from": source.canonical_id,
        "merged_from_key": source.key,
        "merged_by": merged_by,
        "merged_at": format_ts(now),
    });

    match merged.get_mut(MERGE_HISTORY_KEY) {
        Some(Value::Array(history)) => history.push(entry),
        _ => {
            merged.insert(MERGE_HISTORY_KEY.into(), Value::Array(vec![entry]));
        }
    }
}

/// Live relationship heads with the given canonical object id as either
/// endpoint
async fn relationships_touching(
    conn: &mut SqliteConnection,
    canonical_object_id: &str,
    scope: &Scope,
) -> Result<Vec<GraphRelationship>> {
    let head = visibility::live_head("graph_relationships", "a", scope);
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
    query = query.bind(canonical_object_id).bind(canonical_object_id);

    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(|r| r.into_relationship()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_strategy_parse() {
        assert_eq!(MergeStrategy::parse("source-wins"), Some(MergeStrategy::SourceWins));
        assert_eq!(MergeStrategy::parse("TARGET_WINS"), Some(MergeStrategy::TargetWins));
        assert_eq!(MergeStrategy::parse("unknown"), None);
    }

    #[test]
    fn test_merge_properties_source_wins_union() {
        let source = props(&[("name", json!("S")), ("x", json!(1))]);
        let target = props(&[("name", json!("T")), ("y", json!(2))]);

        let merged = merge_properties(&source, &target, MergeStrategy::SourceWins);
        assert_eq!(merged["name"], json!("S"));
        assert_eq!(merged["x"], json!(1));
        assert_eq!(merged["y"], json!(2));
    }

    #[test]
    fn test_merge_properties_target_wins_union() {
        let source = props(&[("name", json!("S")), ("x", json!(1))]);
        let target = props(&[("name", json!("T")), ("y", json!(2))]);

        let merged = merge_properties(&source, &target, MergeStrategy::TargetWins);
        assert_eq!(merged["name"], json!("T"));
        assert_eq!(merged["x"], json!(1));
        assert_eq!(merged["y"], json!(2));
    }

    #[test]
    fn test_source_history_never_clobbers_target() {
        let source = props(&[(MERGE_HISTORY_KEY, json!([{"merged_from": "old"}]))]);
        let target = props(&[(MERGE_HISTORY_KEY, json!([{"merged_from": "kept"}]))]);

        let merged = merge_properties(&source, &target, MergeStrategy::SourceWins);
        assert_eq!(merged[MERGE_HISTORY_KEY], json!([{"merged_from": "kept"}]));
    }

    #[test]
    fn test_append_provenance_creates_and_appends() {
        let now = Utc::now();
        let source = GraphObject {
            id: "s1".into(),
            canonical_id: "s1".into(),
            version: 1,
            project_id: "p1".into(),
            branch_id: None,
            object_type: "Person".into(),
            key: Some("jane".into()),
            status: None,
            properties: Properties::new(),
            labels: vec![],
            supersedes_id: None,
            deleted_at: None,
            embedding: None,
            embedding_updated_at: None,
            created_by: None,
            created_at: now,
            updated_at: now,
        };

        let mut merged = Properties::new();
        append_provenance(&mut merged, &source, Some("user-1"), now);
        append_provenance(&mut merged, &source, Some("user-2"), now);

        let history = merged[MERGE_HISTORY_KEY].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["merged_from"], json!("s1"));
        assert_eq!(history[0]["merged_from_key"], json!("jane"));
        assert_eq!(history[0]["merged_by"], json!("user-1"));
        assert_eq!(history[1]["merged_by"], json!("user-2"));
    }
}
