//! Versioned graph relationships
//!
//! A relationship is a typed edge between two canonical object ids. It
//! follows the same append-only version chain and soft-delete discipline
//! as objects. Endpoints reference canonical ids and are resolved to head
//! versions at read time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::object::Properties;

/// A single version row of a graph relationship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelationship {
    /// Unique identifier of this physical version row
    pub id: String,
    /// Logical identity shared by all versions of the same relationship
    pub canonical_id: String,
    /// Monotonically increasing version per canonical id
    pub version: i64,
    /// Owning project
    pub project_id: String,
    /// Branch this version was written on; None is the default branch
    pub branch_id: Option<String>,
    /// Relationship type (e.g. "DEPENDS_ON", "IMPLEMENTS")
    pub rel_type: String,
    /// Canonical id of the source object
    pub src_id: String,
    /// Canonical id of the destination object
    pub dst_id: String,
    /// Schemaless property document
    pub properties: Properties,
    /// Optional edge weight
    pub weight: Option<f64>,
    /// Row this version replaced, if any
    pub supersedes_id: Option<String>,
    /// Soft-delete / supersede marker
    pub deleted_at: Option<DateTime<Utc>>,
    /// User who wrote this version
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphRelationship {
    /// Whether this row is a live head candidate (not tombstoned)
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Whether the given canonical object id is one of the endpoints
    pub fn touches(&self, canonical_object_id: &str) -> bool {
        self.src_id == canonical_object_id || self.dst_id == canonical_object_id
    }
}

/// Input for creating a new relationship (version 1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipDraft {
    pub rel_type: String,
    pub src_id: String,
    pub dst_id: String,
    #[serde(default)]
    pub properties: Properties,
    pub weight: Option<f64>,
    pub created_by: Option<String>,
}

impl RelationshipDraft {
    pub fn new(
        rel_type: impl Into<String>,
        src_id: impl Into<String>,
        dst_id: impl Into<String>,
    ) -> Self {
        Self {
            rel_type: rel_type.into(),
            src_id: src_id.into(),
            dst_id: dst_id.into(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Partial update applied to a relationship's head version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipPatch {
    pub properties: Option<Properties>,
    pub weight: Option<f64>,
    pub updated_by: Option<String>,
}

/// The head relationships attached to one object, split by direction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectEdges {
    /// Relationships whose destination is the object
    pub incoming: Vec<GraphRelationship>,
    /// Relationships whose source is the object
    pub outgoing: Vec<GraphRelationship>,
}
