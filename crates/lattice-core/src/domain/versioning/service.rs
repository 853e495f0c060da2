//! Versioning service: head resolution and supersede-style writes
//!
//! Every write inserts a new version row and tombstones the superseded
//! head inside one transaction. History rows are never removed. Patch
//! races are detected by the `UNIQUE (canonical_id, version)` constraint
//! and the single-live-head partial index; both surface as `Conflict` so
//! the caller re-resolves and retries.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::graph::object::object_search_text;
use crate::domain::graph::{
    Branch, BranchLineage, GraphObject, GraphRelationship, ObjectDraft, ObjectPatch, Properties,
    RelationshipDraft, RelationshipPatch, Scope,
};
use crate::domain::rows::{encode_embedding, BranchRow, ObjectRow, RelationshipRow};
use crate::domain::visibility;
use crate::error::{map_constraint_err, Error, Result};
use crate::storage::format_ts;

/// Versioning and branching operations over the graph store
#[derive(Clone)]
pub struct VersioningService {
    pool: SqlitePool,
}

impl VersioningService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========== Object Operations ==========

    /// Resolve a canonical id to its head version visible from the scope.
    ///
    /// Returns `None` when the object never existed on this lineage or its
    /// newest visible version is tombstoned (deleted or merged away).
    pub async fn resolve_head(
        &self,
        canonical_id: &str,
        scope: &Scope,
    ) -> Result<Option<GraphObject>> {
        let mut conn = self.pool.acquire().await?;
        resolve_object_head(&mut conn, canonical_id, scope).await
    }

    /// Create a new object: version 1, canonical id equal to the row id
    pub async fn create_object(&self, draft: ObjectDraft, scope: &Scope) -> Result<GraphObject> {
        if draft.object_type.trim().is_empty() {
            return Err(Error::InvalidInput("object type is required".into()));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let object = GraphObject {
            id: id.clone(),
            canonical_id: id,
            version: 1,
            project_id: scope.project_id.clone(),
            branch_id: scope.branch_id.clone(),
            object_type: draft.object_type,
            key: draft.key,
            status: draft.status,
            properties: draft.properties,
            labels: draft.labels,
            supersedes_id: None,
            deleted_at: None,
            embedding: None,
            embedding_updated_at: None,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.pool.acquire().await?;
        insert_object(&mut conn, &object).await?;

        debug!(
            object_id = %object.id,
            object_type = %object.object_type,
            project_id = %scope.project_id,
            "Object created"
        );
        Ok(object)
    }

    /// Fetch a specific version row by its physical id
    pub async fn get_object(&self, row_id: &str, scope: &Scope) -> Result<Option<GraphObject>> {
        let row: Option<ObjectRow> =
            sqlx::query_as("SELECT * FROM graph_objects WHERE id = ? AND project_id = ?")
                .bind(row_id)
                .bind(&scope.project_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| r.into_object()).transpose()
    }

    /// Apply a partial update, producing a new head version.
    ///
    /// The superseded head is tombstoned when it lives on the caller's
    /// branch. A head inherited from an ancestor branch stays live there;
    /// the new version wins on the caller's branch by version ordering.
    pub async fn patch_object(
        &self,
        canonical_id: &str,
        patch: ObjectPatch,
        scope: &Scope,
    ) -> Result<GraphObject> {
        let mut tx = self.pool.begin().await?;

        let head = resolve_object_head(&mut tx, canonical_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(canonical_id.to_string()))?;

        let now = Utc::now();
        if head.branch_id == scope.branch_id {
            supersede_object(&mut tx, &head.id, now).await?;
        }

        let successor = successor_object(&head, &patch, scope, now);
        insert_object(&mut tx, &successor).await?;
        tx.commit().await?;

        debug!(
            canonical_id = %canonical_id,
            version = successor.version,
            "Object patched"
        );
        Ok(successor)
    }

    /// Soft-delete an object's head version.
    ///
    /// On the head's own branch the row is tombstoned in place; a head
    /// inherited from an ancestor branch is shadowed by a tombstoned
    /// successor on the caller's branch instead.
    pub async fn delete_object(&self, canonical_id: &str, scope: &Scope) -> Result<GraphObject> {
        let mut tx = self.pool.begin().await?;

        let head = resolve_object_head(&mut tx, canonical_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(canonical_id.to_string()))?;

        let now = Utc::now();
        let deleted = if head.branch_id == scope.branch_id {
            supersede_object(&mut tx, &head.id, now).await?;
            let mut tombstoned = head;
            tombstoned.deleted_at = Some(now);
            tombstoned.updated_at = now;
            tombstoned
        } else {
            let mut tombstone = successor_object(&head, &ObjectPatch::default(), scope, now);
            tombstone.deleted_at = Some(now);
            insert_object(&mut tx, &tombstone).await?;
            tombstone
        };
        tx.commit().await?;

        info!(canonical_id = %canonical_id, "Object deleted");
        Ok(deleted)
    }

    /// Clear the tombstone on a deleted version row, reviving it as head.
    ///
    /// Fails with `Conflict` when the row is not deleted or a live head
    /// already exists for the canonical id on the row's branch.
    pub async fn restore_object(&self, row_id: &str, scope: &Scope) -> Result<GraphObject> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ObjectRow> =
            sqlx::query_as("SELECT * FROM graph_objects WHERE id = ? AND project_id = ?")
                .bind(row_id)
                .bind(&scope.project_id)
                .fetch_optional(&mut *tx)
                .await?;
        let row = row
            .map(|r| r.into_object())
            .transpose()?
            .ok_or_else(|| Error::ObjectNotFound(row_id.to_string()))?;
        if row.deleted_at.is_none() {
            return Err(Error::Conflict(format!(
                "object version '{row_id}' is not deleted"
            )));
        }

        let now = format_ts(Utc::now());
        sqlx::query("UPDATE graph_objects SET deleted_at = NULL, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_constraint_err(e, "object restore"))?;
        tx.commit().await?;

        info!(object_id = %row_id, "Object restored");
        self.get_object(row_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(row_id.to_string()))
    }

    /// All versions of a canonical id visible from the scope, newest first
    pub async fn object_history(
        &self,
        canonical_id: &str,
        scope: &Scope,
    ) -> Result<Vec<GraphObject>> {
        let vis = visibility::visible("a", scope);
        let sql = format!(
            "SELECT a.* FROM graph_objects a WHERE a.canonical_id = ? AND {} \
             ORDER BY a.version DESC",
            vis.clause
        );

        let mut query = sqlx::query_as::<_, ObjectRow>(&sql).bind(canonical_id);
        for bind in &vis.binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_object()).collect()
    }

    /// Overwrite an object's embedding vector (idempotent by design)
    pub async fn write_embedding(&self, row_id: &str, embedding: &[f32]) -> Result<bool> {
        let now = format_ts(Utc::now());
        let result = sqlx::query(
            "UPDATE graph_objects SET embedding = ?, embedding_updated_at = ? WHERE id = ?",
        )
        .bind(encode_embedding(embedding))
        .bind(&now)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========== Relationship Operations ==========

    /// Resolve a relationship canonical id to its visible head version
    pub async fn resolve_relationship_head(
        &self,
        canonical_id: &str,
        scope: &Scope,
    ) -> Result<Option<GraphRelationship>> {
        let mut conn = self.pool.acquire().await?;
        resolve_relationship_head(&mut conn, canonical_id, scope).await
    }

    /// Create a relationship between two canonical object ids.
    ///
    /// Self-loops are rejected; both endpoints must have visible heads.
    /// Creating a relationship whose `(type, src, dst)` already has a live
    /// head is idempotent and returns the existing one.
    pub async fn create_relationship(
        &self,
        draft: RelationshipDraft,
        scope: &Scope,
    ) -> Result<GraphRelationship> {
        if draft.rel_type.trim().is_empty() {
            return Err(Error::InvalidInput("relationship type is required".into()));
        }
        if draft.src_id == draft.dst_id {
            return Err(Error::InvalidInput(
                "self-referential relationships are not allowed".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        resolve_object_head(&mut tx, &draft.src_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(draft.src_id.clone()))?;
        resolve_object_head(&mut tx, &draft.dst_id, scope)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(draft.dst_id.clone()))?;

        if let Some(existing) =
            find_live_relationship(&mut tx, &draft.rel_type, &draft.src_id, &draft.dst_id, scope)
                .await?
        {
            debug!(
                relationship_id = %existing.id,
                "Relationship already exists, returning existing head"
            );
            return Ok(existing);
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let relationship = GraphRelationship {
            id: id.clone(),
            canonical_id: id,
            version: 1,
            project_id: scope.project_id.clone(),
            branch_id: scope.branch_id.clone(),
            rel_type: draft.rel_type,
            src_id: draft.src_id,
            dst_id: draft.dst_id,
            properties: draft.properties,
            weight: draft.weight,
            supersedes_id: None,
            deleted_at: None,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        };
        insert_relationship(&mut tx, &relationship).await?;
        tx.commit().await?;

        debug!(
            relationship_id = %relationship.id,
            rel_type = %relationship.rel_type,
            src = %relationship.src_id,
            dst = %relationship.dst_id,
            "Relationship created"
        );
        Ok(relationship)
    }

    /// Fetch a specific relationship version row by its physical id
    pub async fn get_relationship(
        &self,
        row_id: &str,
        scope: &Scope,
    ) -> Result<Option<GraphRelationship>> {
        let row: Option<RelationshipRow> =
            sqlx::query_as("SELECT * FROM graph_relationships WHERE id = ? AND project_id = ?")
                .bind(row_id)
                .bind(&scope.project_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| r.into_relationship()).transpose()
    }

    /// Apply a partial update to a relationship, producing a new version
    pub async fn patch_relationship(
        &self,
        canonical_id: &str,
        patch: RelationshipPatch,
        scope: &Scope,
    ) -> Result<GraphRelationship> {
        let mut tx = self.pool.begin().await?;

        let head = resolve_relationship_head(&mut tx, canonical_id, scope)
            .await?
            .ok_or_else(|| Error::RelationshipNotFound(canonical_id.to_string()))?;

        let now = Utc::now();
        if head.branch_id == scope.branch_id {
            supersede_relationship(&mut tx, &head.id, now).await?;
        }

        let successor = successor_relationship(&head, &patch, scope, now);
        insert_relationship(&mut tx, &successor).await?;
        tx.commit().await?;

        debug!(
            canonical_id = %canonical_id,
            version = successor.version,
            "Relationship patched"
        );
        Ok(successor)
    }

    /// Soft-delete a relationship's head version, returning the tombstone
    pub async fn delete_relationship(
        &self,
        canonical_id: &str,
        scope: &Scope,
    ) -> Result<GraphRelationship> {
        let mut tx = self.pool.begin().await?;

        let head = resolve_relationship_head(&mut tx, canonical_id, scope)
            .await?
            .ok_or_else(|| Error::RelationshipNotFound(canonical_id.to_string()))?;

        let now = Utc::now();
        let deleted = if head.branch_id == scope.branch_id {
            supersede_relationship(&mut tx, &head.id, now).await?;
            let mut tombstoned = head;
            tombstoned.deleted_at = Some(now);
            tombstoned.updated_at = now;
            tombstoned
        } else {
            let mut tombstone =
                successor_relationship(&head, &RelationshipPatch::default(), scope, now);
            tombstone.deleted_at = Some(now);
            insert_relationship(&mut tx, &tombstone).await?;
            tombstone
        };
        tx.commit().await?;

        info!(canonical_id = %canonical_id, "Relationship deleted");
        Ok(deleted)
    }

    /// Clear the tombstone on a deleted relationship version row
    pub async fn restore_relationship(
        &self,
        row_id: &str,
        scope: &Scope,
    ) -> Result<GraphRelationship> {
        let mut tx = self.pool.begin().await?;

        let row: Option<RelationshipRow> =
            sqlx::query_as("SELECT * FROM graph_relationships WHERE id = ? AND project_id = ?")
                .bind(row_id)
                .bind(&scope.project_id)
                .fetch_optional(&mut *tx)
                .await?;
        let row = row
            .map(|r| r.into_relationship())
            .transpose()?
            .ok_or_else(|| Error::RelationshipNotFound(row_id.to_string()))?;
        if row.deleted_at.is_none() {
            return Err(Error::Conflict(format!(
                "relationship version '{row_id}' is not deleted"
            )));
        }

        let now = format_ts(Utc::now());
        sqlx::query("UPDATE graph_relationships SET deleted_at = NULL, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_constraint_err(e, "relationship restore"))?;
        tx.commit().await?;

        info!(relationship_id = %row_id, "Relationship restored");
        self.get_relationship(row_id, scope)
            .await?
            .ok_or_else(|| Error::RelationshipNotFound(row_id.to_string()))
    }

    /// All versions of a relationship canonical id, newest first
    pub async fn relationship_history(
        &self,
        canonical_id: &str,
        scope: &Scope,
    ) -> Result<Vec<GraphRelationship>> {
        let vis = visibility::visible("a", scope);
        let sql = format!(
            "SELECT a.* FROM graph_relationships a WHERE a.canonical_id = ? AND {} \
             ORDER BY a.version DESC",
            vis.clause
        );

        let mut query = sqlx::query_as::<_, RelationshipRow>(&sql).bind(canonical_id);
        for bind in &vis.binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_relationship()).collect()
    }

    // ========== Branch Operations ==========

    /// Create a branch and precompute its full lineage.
    ///
    /// Object rows are never copied; isolation comes from lineage-based
    /// visibility filtering at read time.
    pub async fn create_branch(
        &self,
        name: &str,
        project_id: Option<&str>,
        parent_branch_id: Option<&str>,
    ) -> Result<Branch> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("branch name is required".into()));
        }

        let mut tx = self.pool.begin().await?;

        if let Some(parent_id) = parent_branch_id {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT id FROM graph_branches WHERE id = ?")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_none() {
                return Err(Error::BranchNotFound(parent_id.to_string()));
            }
        }

        let now = Utc::now();
        let now_str = format_ts(now);
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO graph_branches (id, project_id, name, parent_branch_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(project_id)
        .bind(name)
        .bind(parent_branch_id)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Error::Conflict(format!(
                        "branch '{name}' already exists in this scope"
                    ));
                }
            }
            Error::DatabaseError(e)
        })?;

        // Lineage: self at depth 0, then the parent's full chain shifted by one
        sqlx::query(
            "INSERT INTO graph_branch_lineage (branch_id, ancestor_branch_id, depth) VALUES (?, ?, 0)",
        )
        .bind(&id)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        if let Some(parent_id) = parent_branch_id {
            sqlx::query(
                r#"
                INSERT INTO graph_branch_lineage (branch_id, ancestor_branch_id, depth)
                SELECT ?, ancestor_branch_id, depth + 1
                FROM graph_branch_lineage
                WHERE branch_id = ?
                "#,
            )
            .bind(&id)
            .bind(parent_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(branch_id = %id, branch_name = %name, "Branch created");
        Ok(Branch {
            id,
            project_id: project_id.map(String::from),
            name: name.to_string(),
            parent_branch_id: parent_branch_id.map(String::from),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a branch by id
    pub async fn get_branch(&self, branch_id: &str) -> Result<Option<Branch>> {
        let row: Option<BranchRow> = sqlx::query_as("SELECT * FROM graph_branches WHERE id = ?")
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_branch()).transpose()
    }

    /// List branches, optionally filtered by project
    pub async fn list_branches(&self, project_id: Option<&str>) -> Result<Vec<Branch>> {
        let rows: Vec<BranchRow> = match project_id {
            Some(pid) => {
                sqlx::query_as(
                    "SELECT * FROM graph_branches WHERE project_id = ? ORDER BY created_at, name",
                )
                .bind(pid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM graph_branches ORDER BY created_at, name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(|r| r.into_branch()).collect()
    }

    /// Rename a branch
    pub async fn rename_branch(&self, branch_id: &str, name: &str) -> Result<Branch> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("branch name is required".into()));
        }

        let now = format_ts(Utc::now());
        let result = sqlx::query("UPDATE graph_branches SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(&now)
            .bind(branch_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e {
                    if db.is_unique_violation() {
                        return Error::Conflict(format!(
                            "branch '{name}' already exists in this scope"
                        ));
                    }
                }
                Error::DatabaseError(e)
            })?;
        if result.rows_affected() == 0 {
            return Err(Error::BranchNotFound(branch_id.to_string()));
        }

        self.get_branch(branch_id)
            .await?
            .ok_or_else(|| Error::BranchNotFound(branch_id.to_string()))
    }

    /// Delete a branch and its lineage rows.
    ///
    /// Object rows written on the branch are retained as history. Branches
    /// with children cannot be deleted.
    pub async fn delete_branch(&self, branch_id: &str) -> Result<()> {
        let (children,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM graph_branches WHERE parent_branch_id = ?")
                .bind(branch_id)
                .fetch_one(&self.pool)
                .await?;
        if children > 0 {
            return Err(Error::Conflict(format!(
                "branch '{branch_id}' has {children} child branches"
            )));
        }

        let result = sqlx::query("DELETE FROM graph_branches WHERE id = ?")
            .bind(branch_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::BranchNotFound(branch_id.to_string()));
        }

        info!(branch_id = %branch_id, "Branch deleted");
        Ok(())
    }

    /// A branch's precomputed ancestor chain, nearest first
    pub async fn branch_lineage(&self, branch_id: &str) -> Result<Vec<BranchLineage>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT branch_id, ancestor_branch_id, depth FROM graph_branch_lineage \
             WHERE branch_id = ? ORDER BY depth",
        )
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(branch_id, ancestor_branch_id, depth)| BranchLineage {
                branch_id,
                ancestor_branch_id,
                depth,
            })
            .collect())
    }
}

// ========== Connection-level helpers (shared with the merge service) ==========

/// Resolve the newest visible version of an object; tombstoned heads
/// resolve to `None`.
pub(crate) async fn resolve_object_head(
    conn: &mut SqliteConnection,
    canonical_id: &str,
    scope: &Scope,
) -> Result<Option<GraphObject>> {
    let vis = visibility::visible("a", scope);
    let sql = format!(
        "SELECT a.* FROM graph_objects a WHERE a.canonical_id = ? AND {} \
         ORDER BY a.version DESC LIMIT 1",
        vis.clause
    );

    let mut query = sqlx::query_as::<_, ObjectRow>(&sql).bind(canonical_id);
    for bind in &vis.binds {
        query = query.bind(bind);
    }
    let row = query.fetch_optional(&mut *conn).await?;

    match row {
        Some(row) if row.deleted_at.is_none() => Ok(Some(row.into_object()?)),
        _ => Ok(None),
    }
}

/// Resolve the newest visible version of a relationship
pub(crate) async fn resolve_relationship_head(
    conn: &mut SqliteConnection,
    canonical_id: &str,
    scope: &Scope,
) -> Result<Option<GraphRelationship>> {
    let vis = visibility::visible("a", scope);
    let sql = format!(
        "SELECT a.* FROM graph_relationships a WHERE a.canonical_id = ? AND {} \
         ORDER BY a.version DESC LIMIT 1",
        vis.clause
    );

    let mut query = sqlx::query_as::<_, RelationshipRow>(&sql).bind(canonical_id);
    for bind in &vis.binds {
        query = query.bind(bind);
    }
    let row = query.fetch_optional(&mut *conn).await?;

    match row {
        Some(row) if row.deleted_at.is_none() => Ok(Some(row.into_relationship()?)),
        _ => Ok(None),
    }
}

/// Find the visible live relationship head with the given endpoints
pub(crate) async fn find_live_relationship(
    conn: &mut SqliteConnection,
    rel_type: &str,
    src_id: &str,
    dst_id: &str,
    scope: &Scope,
) -> Result<Option<GraphRelationship>> {
    let head = visibility::live_head("graph_relationships", "a", scope);
    let sql = format!(
        "SELECT a.* FROM graph_relationships a \
         WHERE a.type = ? AND a.src_id = ? AND a.dst_id = ? AND {} \
         ORDER BY a.version DESC LIMIT 1",
        head.clause
    );

    let mut query = sqlx::query_as::<_, RelationshipRow>(&sql)
        .bind(rel_type)
        .bind(src_id)
        .bind(dst_id);
    for bind in &head.binds {
        query = query.bind(bind);
    }
    let row = query.fetch_optional(&mut *conn).await?;
    row.map(|r| r.into_relationship()).transpose()
}

/// Insert one object version row
pub(crate) async fn insert_object(
    conn: &mut SqliteConnection,
    object: &GraphObject,
) -> Result<()> {
    let search_text = object_search_text(
        &object.object_type,
        object.key.as_deref(),
        &object.labels,
        &object.properties,
    );
    let properties = serde_json::to_string(&object.properties)?;
    let labels = serde_json::to_string(&object.labels)?;

    sqlx::query(
        r#"
        INSERT INTO graph_objects (
            id, canonical_id, version, project_id, branch_id, type, key, status,
            properties, labels, search_text, supersedes_id, deleted_at,
            embedding, embedding_updated_at, created_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&object.id)
    .bind(&object.canonical_id)
    .bind(object.version)
    .bind(&object.project_id)
    .bind(&object.branch_id)
    .bind(&object.object_type)
    .bind(&object.key)
    .bind(&object.status)
    .bind(&properties)
    .bind(&labels)
    .bind(&search_text)
    .bind(&object.supersedes_id)
    .bind(object.deleted_at.map(format_ts))
    .bind(object.embedding.as_deref().map(encode_embedding))
    .bind(object.embedding_updated_at.map(format_ts))
    .bind(&object.created_by)
    .bind(format_ts(object.created_at))
    .bind(format_ts(object.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_constraint_err(e, "object version"))?;

    Ok(())
}

/// Insert one relationship version row
pub(crate) async fn insert_relationship(
    conn: &mut SqliteConnection,
    relationship: &GraphRelationship,
) -> Result<()> {
    let properties = serde_json::to_string(&relationship.properties)?;

    sqlx::query(
        r#"
        INSERT INTO graph_relationships (
            id, canonical_id, version, project_id, branch_id, type, src_id, dst_id,
            properties, weight, supersedes_id, deleted_at, created_by, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&relationship.id)
    .bind(&relationship.canonical_id)
    .bind(relationship.version)
    .bind(&relationship.project_id)
    .bind(&relationship.branch_id)
    .bind(&relationship.rel_type)
    .bind(&relationship.src_id)
    .bind(&relationship.dst_id)
    .bind(&properties)
    .bind(relationship.weight)
    .bind(&relationship.supersedes_id)
    .bind(relationship.deleted_at.map(format_ts))
    .bind(&relationship.created_by)
    .bind(format_ts(relationship.created_at))
    .bind(format_ts(relationship.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_constraint_err(e, "relationship version"))?;

    Ok(())
}

/// Tombstone a superseded object head; `Conflict` when the row changed
/// under us (a concurrent writer got there first).
pub(crate) async fn supersede_object(
    conn: &mut SqliteConnection,
    row_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let now_str = format_ts(now);
    let result = sqlx::query(
        "UPDATE graph_objects SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(&now_str)
    .bind(&now_str)
    .bind(row_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        return Err(Error::Conflict(format!(
            "object head '{row_id}' was superseded concurrently"
        )));
    }
    Ok(())
}

/// Tombstone a superseded relationship head
pub(crate) async fn supersede_relationship(
    conn: &mut SqliteConnection,
    row_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let now_str = format_ts(now);
    let result = sqlx::query(
        "UPDATE graph_relationships SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(&now_str)
    .bind(&now_str)
    .bind(row_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        return Err(Error::Conflict(format!(
            "relationship head '{row_id}' was superseded concurrently"
        )));
    }
    Ok(())
}

/// Build the successor version of an object head under a patch
pub(crate) fn successor_object(
    head: &GraphObject,
    patch: &ObjectPatch,
    scope: &Scope,
    now: DateTime<Utc>,
) -> GraphObject {
    let properties = match &patch.properties {
        Some(overlay) => merge_property_patch(&head.properties, overlay),
        None => head.properties.clone(),
    };

    GraphObject {
        id: Uuid::new_v4().to_string(),
        canonical_id: head.canonical_id.clone(),
        version: head.version + 1,
        project_id: scope.project_id.clone(),
        branch_id: scope.branch_id.clone(),
        object_type: head.object_type.clone(),
        key: patch.key.clone().or_else(|| head.key.clone()),
        status: patch.status.clone().or_else(|| head.status.clone()),
        properties,
        labels: patch.labels.clone().unwrap_or_else(|| head.labels.clone()),
        supersedes_id: Some(head.id.clone()),
        deleted_at: None,
        // Embeddings are recomputed asynchronously for new versions
        embedding: None,
        embedding_updated_at: None,
        created_by: patch.updated_by.clone().or_else(|| head.created_by.clone()),
        created_at: now,
        updated_at: now,
    }
}

/// Build the successor version of a relationship head under a patch
pub(crate) fn successor_relationship(
    head: &GraphRelationship,
    patch: &RelationshipPatch,
    scope: &Scope,
    now: DateTime<Utc>,
) -> GraphRelationship {
    let properties = match &patch.properties {
        Some(overlay) => merge_property_patch(&head.properties, overlay),
        None => head.properties.clone(),
    };

    GraphRelationship {
        id: Uuid::new_v4().to_string(),
        canonical_id: head.canonical_id.clone(),
        version: head.version + 1,
        project_id: scope.project_id.clone(),
        branch_id: scope.branch_id.clone(),
        rel_type: head.rel_type.clone(),
        src_id: head.src_id.clone(),
        dst_id: head.dst_id.clone(),
        properties,
        weight: patch.weight.or(head.weight),
        supersedes_id: Some(head.id.clone()),
        deleted_at: None,
        created_by: patch.updated_by.clone().or_else(|| head.created_by.clone()),
        created_at: now,
        updated_at: now,
    }
}

/// Shallow-merge a property patch over a base document: patched keys win,
/// untouched keys survive.
pub(crate) fn merge_property_patch(base: &Properties, overlay: &Properties) -> Properties {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use serde_json::json;

    async fn setup() -> (Database, VersioningService) {
        let db = Database::in_memory().await.expect("Failed to create database");
        let service = VersioningService::new(db.pool().clone());
        (db, service)
    }

    fn props(pairs: &[(&str, serde_json::Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_object_is_version_one() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let obj = service
            .create_object(
                ObjectDraft::new("Requirement")
                    .with_status("draft")
                    .with_property("title", json!("User Authentication")),
                &scope,
            )
            .await
            .unwrap();

        assert_eq!(obj.version, 1);
        assert_eq!(obj.canonical_id, obj.id);
        assert!(obj.supersedes_id.is_none());
        assert_eq!(obj.status.as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn test_patch_creates_new_version_and_tombstones_head() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let v1 = service
            .create_object(
                ObjectDraft::new("Requirement").with_property("name", json!("A")),
                &scope,
            )
            .await
            .unwrap();

        let v2 = service
            .patch_object(
                &v1.canonical_id,
                ObjectPatch::properties(props(&[("name", json!("B"))])),
                &scope,
            )
            .await
            .unwrap();

        assert_eq!(v2.version, 2);
        assert_ne!(v2.id, v1.id);
        assert_eq!(v2.canonical_id, v1.canonical_id);
        assert_eq!(v2.supersedes_id.as_deref(), Some(v1.id.as_str()));
        assert_eq!(v2.properties["name"], json!("B"));

        // Old head is tombstoned, new head resolves
        let old = service.get_object(&v1.id, &scope).await.unwrap().unwrap();
        assert!(old.deleted_at.is_some());

        let head = service
            .resolve_head(&v1.canonical_id, &scope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.version, 2);
        assert_eq!(head.properties["name"], json!("B"));
    }

    #[tokio::test]
    async fn test_patch_merges_properties() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let v1 = service
            .create_object(
                ObjectDraft::new("Requirement").with_properties(props(&[
                    ("title", json!("Original")),
                    ("priority", json!("high")),
                ])),
                &scope,
            )
            .await
            .unwrap();

        let v2 = service
            .patch_object(
                &v1.canonical_id,
                ObjectPatch::properties(props(&[("title", json!("Updated"))])),
                &scope,
            )
            .await
            .unwrap();

        assert_eq!(v2.properties["title"], json!("Updated"));
        assert_eq!(v2.properties["priority"], json!("high"));
    }

    #[tokio::test]
    async fn test_patch_missing_object_fails() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let err = service
            .patch_object("no-such-id", ObjectPatch::default(), &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_then_restore() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let obj = service
            .create_object(ObjectDraft::new("Requirement"), &scope)
            .await
            .unwrap();

        let deleted = service
            .delete_object(&obj.canonical_id, &scope)
            .await
            .unwrap();
        assert!(deleted.deleted_at.is_some());
        assert!(service
            .resolve_head(&obj.canonical_id, &scope)
            .await
            .unwrap()
            .is_none());

        let restored = service.restore_object(&deleted.id, &scope).await.unwrap();
        assert!(restored.deleted_at.is_none());
        assert_eq!(restored.canonical_id, obj.canonical_id);
        assert!(service
            .resolve_head(&obj.canonical_id, &scope)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_history_is_descending() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let v1 = service
            .create_object(ObjectDraft::new("Requirement").with_status("draft"), &scope)
            .await
            .unwrap();
        service
            .patch_object(
                &v1.canonical_id,
                ObjectPatch::default().with_status("approved"),
                &scope,
            )
            .await
            .unwrap();

        let history = service
            .object_history(&v1.canonical_id, &scope)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 2);
        assert_eq!(history[1].version, 1);
    }

    #[tokio::test]
    async fn test_relationship_self_loop_rejected() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let obj = service
            .create_object(ObjectDraft::new("Requirement"), &scope)
            .await
            .unwrap();

        let err = service
            .create_relationship(
                RelationshipDraft::new("DEPENDS_ON", &obj.canonical_id, &obj.canonical_id),
                &scope,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_relationship_endpoint_must_exist() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let src = service
            .create_object(ObjectDraft::new("Requirement"), &scope)
            .await
            .unwrap();

        let err = service
            .create_relationship(
                RelationshipDraft::new("DEPENDS_ON", &src.canonical_id, "missing"),
                &scope,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_relationship_create_is_idempotent() {
        let (_db, service) = setup().await;
        let scope = Scope::project("p1");

        let src = service
            .create_object(ObjectDraft::new("Requirement"), &scope)
            .await
            .unwrap();
        let dst = service
            .create_object(ObjectDraft::new("Decision"), &scope)
            .await
            .unwrap();

        let first = service
            .create_relationship(
                RelationshipDraft::new("DEPENDS_ON", &src.canonical_id, &dst.canonical_id),
                &scope,
            )
            .await
            .unwrap();
        let second = service
            .create_relationship(
                RelationshipDraft::new("DEPENDS_ON", &src.canonical_id, &dst.canonical_id),
                &scope,
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_branch_lineage_copy() {
        let (_db, service) = setup().await;

        let root = service.create_branch("main", Some("p1"), None).await.unwrap();
        let child = service
            .create_branch("feature", Some("p1"), Some(&root.id))
            .await
            .unwrap();
        let grandchild = service
            .create_branch("spike", Some("p1"), Some(&child.id))
            .await
            .unwrap();

        let lineage = service.branch_lineage(&grandchild.id).await.unwrap();
        assert_eq!(lineage.len(), 3);
        assert_eq!(lineage[0].ancestor_branch_id, grandchild.id);
        assert_eq!(lineage[0].depth, 0);
        assert_eq!(lineage[1].ancestor_branch_id, child.id);
        assert_eq!(lineage[1].depth, 1);
        assert_eq!(lineage[2].ancestor_branch_id, root.id);
        assert_eq!(lineage[2].depth, 2);
    }

    #[tokio::test]
    async fn test_duplicate_branch_name_conflicts() {
        let (_db, service) = setup().await;

        service.create_branch("main", Some("p1"), None).await.unwrap();
        let err = service
            .create_branch("main", Some("p1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_branch_isolation_between_siblings() {
        let (_db, service) = setup().await;

        let main = service.create_branch("main", Some("p1"), None).await.unwrap();
        let branch_x = service
            .create_branch("x", Some("p1"), Some(&main.id))
            .await
            .unwrap();
        let branch_y = service
            .create_branch("y", Some("p1"), Some(&main.id))
            .await
            .unwrap();

        let main_scope = Scope::branch("p1", &main.id);
        let x_scope = Scope::branch("p1", &branch_x.id);
        let y_scope = Scope::branch("p1", &branch_y.id);

        // Object created on main is visible from both children
        let obj = service
            .create_object(
                ObjectDraft::new("Requirement").with_property("name", json!("base")),
                &main_scope,
            )
            .await
            .unwrap();
        assert!(service.resolve_head(&obj.canonical_id, &x_scope).await.unwrap().is_some());
        assert!(service.resolve_head(&obj.canonical_id, &y_scope).await.unwrap().is_some());

        // Patch on X is not visible from Y, and main keeps its head
        let patched = service
            .patch_object(
                &obj.canonical_id,
                ObjectPatch::properties(props(&[("name", json!("x-edit"))])),
                &x_scope,
            )
            .await
            .unwrap();
        assert_eq!(patched.version, 2);

        let x_head = service.resolve_head(&obj.canonical_id, &x_scope).await.unwrap().unwrap();
        assert_eq!(x_head.properties["name"], json!("x-edit"));

        let y_head = service.resolve_head(&obj.canonical_id, &y_scope).await.unwrap().unwrap();
        assert_eq!(y_head.version, 1);
        assert_eq!(y_head.properties["name"], json!("base"));

        let main_head = service
            .resolve_head(&obj.canonical_id, &main_scope)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(main_head.version, 1);
    }

    #[tokio::test]
    async fn test_delete_on_child_branch_keeps_parent_head() {
        let (_db, service) = setup().await;

        let main = service.create_branch("main", Some("p1"), None).await.unwrap();
        let child = service
            .create_branch("child", Some("p1"), Some(&main.id))
            .await
            .unwrap();

        let main_scope = Scope::branch("p1", &main.id);
        let child_scope = Scope::branch("p1", &child.id);

        let obj = service
            .create_object(ObjectDraft::new("Requirement"), &main_scope)
            .await
            .unwrap();

        service.delete_object(&obj.canonical_id, &child_scope).await.unwrap();

        assert!(service
            .resolve_head(&obj.canonical_id, &child_scope)
            .await
            .unwrap()
            .is_none());
        assert!(service
            .resolve_head(&obj.canonical_id, &main_scope)
            .await
            .unwrap()
            .is_some());
    }
}
