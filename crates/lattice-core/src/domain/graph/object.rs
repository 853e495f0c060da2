//! Versioned graph objects
//!
//! An object is a typed node in the knowledge graph. Its logical identity
//! is the canonical id; each write produces a new physical row with an
//! incremented version, and the previous head is tombstoned rather than
//! removed. The newest non-deleted version visible from a branch is the
//! HEAD.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schemaless property document: string keys over the closed JSON value set
pub type Properties = Map<String, Value>;

/// Key under which merge provenance accumulates inside properties
pub const MERGE_HISTORY_KEY: &str = "_merge_history";

/// Key recording where a merged-away source was consolidated into
pub const MERGED_INTO_KEY: &str = "_merged_into";

/// A single version row of a graph object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphObject {
    /// Unique identifier of this physical version row
    pub id: String,
    /// Logical identity shared by all versions of the same object
    pub canonical_id: String,
    /// Monotonically increasing version per canonical id
    pub version: i64,
    /// Owning project
    pub project_id: String,
    /// Branch this version was written on; None is the default branch
    pub branch_id: Option<String>,
    /// Object type (e.g. "Requirement", "Decision")
    pub object_type: String,
    /// Optional human-readable identifier
    pub key: Option<String>,
    /// Optional workflow status
    pub status: Option<String>,
    /// Schemaless property document
    pub properties: Properties,
    /// Label set
    pub labels: Vec<String>,
    /// Row this version replaced, if any
    pub supersedes_id: Option<String>,
    /// Soft-delete / supersede marker
    pub deleted_at: Option<DateTime<Utc>>,
    /// Embedding vector, if computed
    pub embedding: Option<Vec<f32>>,
    /// When the embedding was last written
    pub embedding_updated_at: Option<DateTime<Utc>>,
    /// User who wrote this version
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphObject {
    /// Whether this row is a live head candidate (not tombstoned)
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Whether this row was consolidated into another object by a merge
    pub fn merged_into(&self) -> Option<&str> {
        self.properties.get(MERGED_INTO_KEY).and_then(Value::as_str)
    }

    /// The merge provenance entries recorded on this version
    pub fn merge_history(&self) -> &[Value] {
        self.properties
            .get(MERGE_HISTORY_KEY)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Input for creating a new object (version 1)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectDraft {
    pub object_type: String,
    pub key: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub labels: Vec<String>,
    pub created_by: Option<String>,
}

impl ObjectDraft {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Partial update applied to an object's head version.
///
/// Properties are shallow-merged over the head's document: patched keys
/// win, untouched keys survive. Labels and status replace wholesale when
/// provided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub key: Option<String>,
    pub status: Option<String>,
    pub properties: Option<Properties>,
    pub labels: Option<Vec<String>>,
    pub updated_by: Option<String>,
}

impl ObjectPatch {
    pub fn properties(properties: Properties) -> Self {
        Self {
            properties: Some(properties),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// Flatten an object's identity and property values into the text that
/// feeds the lexical index and embedding generation.
pub fn object_search_text(
    object_type: &str,
    key: Option<&str>,
    labels: &[String],
    properties: &Properties,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    parts.push(object_type.to_string());
    if let Some(key) = key {
        parts.push(key.to_string());
    }
    parts.extend(labels.iter().cloned());
    for value in properties.values() {
        collect_text(value, &mut parts);
    }
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                collect_text(item, out);
            }
        }
        Value::Object(map) => {
            for nested in map.values() {
                collect_text(nested, out);
            }
        }
        Value::Null => {}
    }
}
