//! Structured filters, pagination, and search result types

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::domain::graph::GraphObject;
use crate::domain::visibility::SqlFragment;
use crate::error::{Error, Result};

/// Combinable structured filters applied by every search modality
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectFilter {
    /// Match any of these exact types
    #[serde(default)]
    pub types: Vec<String>,
    /// Match keys starting with this prefix
    pub key_prefix: Option<String>,
    /// Object must carry every one of these labels (array containment)
    #[serde(default)]
    pub labels_all: Vec<String>,
    /// Object must carry at least one of these labels (array overlap)
    #[serde(default)]
    pub labels_any: Vec<String>,
    /// Match any of these statuses
    #[serde(default)]
    pub statuses: Vec<String>,
    /// Include tombstoned newest versions in results
    #[serde(default)]
    pub include_deleted: bool,
}

impl ObjectFilter {
    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_labels_all(mut self, labels: Vec<String>) -> Self {
        self.labels_all = labels;
        self
    }

    pub fn with_labels_any(mut self, labels: Vec<String>) -> Self {
        self.labels_any = labels;
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<String>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Render the filter as SQL clauses over `alias`
    pub(crate) fn to_sql(&self, alias: &str) -> SqlFragment {
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if !self.types.is_empty() {
            clauses.push(format!(
                "{alias}.type IN ({})",
                placeholders(self.types.len())
            ));
            binds.extend(self.types.iter().cloned());
        }

        if let Some(prefix) = &self.key_prefix {
            clauses.push(format!("{alias}.key LIKE ? ESCAPE '\\'"));
            binds.push(format!("{}%", escape_like(prefix)));
        }

        for label in &self.labels_all {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each({alias}.labels) je WHERE je.value = ?)"
            ));
            binds.push(label.clone());
        }

        if !self.labels_any.is_empty() {
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each({alias}.labels) je WHERE je.value IN ({}))",
                placeholders(self.labels_any.len())
            ));
            binds.extend(self.labels_any.iter().cloned());
        }

        if !self.statuses.is_empty() {
            clauses.push(format!(
                "{alias}.status IN ({})",
                placeholders(self.statuses.len())
            ));
            binds.extend(self.statuses.iter().cloned());
        }

        let clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        SqlFragment { clause, binds }
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Paged listing query over visible head objects
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub filter: ObjectFilter,
    /// Page size; clamped to 1..=200, default 50
    pub limit: Option<usize>,
    /// Opaque cursor from a previous page
    pub cursor: Option<String>,
    /// Abort the query after this long
    pub deadline: Option<Duration>,
}

/// One page of results.
///
/// Ordering is the documented composite key `created_at ASC, id ASC`;
/// `next_cursor` encodes the last row's sort key, so pages stay stable
/// under concurrent writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total rows matching the filter (ignoring pagination)
    pub total: i64,
    /// Cursor for the next page; None when exhausted
    pub next_cursor: Option<String>,
}

/// Cursor position: the composite sort key of the last-seen row
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CursorPos {
    pub created_at: String,
    pub id: String,
}

pub(crate) fn encode_cursor(pos: &CursorPos) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}|{}", pos.created_at, pos.id))
}

pub(crate) fn decode_cursor(cursor: &str) -> Result<CursorPos> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::InvalidInput("malformed pagination cursor".into()))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|_| Error::InvalidInput("malformed pagination cursor".into()))?;
    let (created_at, id) = decoded
        .split_once('|')
        .ok_or_else(|| Error::InvalidInput("malformed pagination cursor".into()))?;
    Ok(CursorPos {
        created_at: created_at.to_string(),
        id: id.to_string(),
    })
}

/// Vector nearest-neighbor search options
#[derive(Debug, Clone, Default)]
pub struct VectorSearchOptions {
    pub filter: ObjectFilter,
    /// Result count; clamped to 1..=100, default 20
    pub limit: Option<usize>,
    /// Hard cosine-distance cutoff; must lie in [0, 2]
    pub max_distance: Option<f64>,
    pub deadline: Option<Duration>,
}

/// Lexical full-text search options
#[derive(Debug, Clone, Default)]
pub struct FullTextSearchOptions {
    pub filter: ObjectFilter,
    /// Result count; clamped to 1..=100, default 20
    pub limit: Option<usize>,
    pub deadline: Option<Duration>,
}

/// Hybrid search request: at least one of `query` / `vector` is required
#[derive(Debug, Clone, Default)]
pub struct HybridSearchRequest {
    pub query: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub filter: ObjectFilter,
    /// Result count; clamped to 1..=100, default 20
    pub limit: Option<usize>,
    /// Weight of the lexical modality in the fused score (default 0.5)
    pub lexical_weight: Option<f64>,
    /// Weight of the vector modality in the fused score (default 0.5)
    pub vector_weight: Option<f64>,
    pub max_distance: Option<f64>,
    pub deadline: Option<Duration>,
}

/// A ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub object: GraphObject,
    /// Fused relevance score, higher is better
    pub score: f64,
    /// Cosine distance when the vector modality contributed
    pub vector_distance: Option<f64>,
    /// Normalized lexical relevance when the lexical modality contributed
    pub lexical_score: Option<f64>,
}

/// Traversal options
#[derive(Debug, Clone)]
pub struct TraverseOptions {
    /// Maximum hop count from the roots; clamped to 1..=16
    pub max_depth: u32,
    /// Depth-by-depth frontier queries instead of one recursive query
    pub phased: bool,
    pub deadline: Option<Duration>,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        Self {
            max_depth: 1,
            phased: false,
            deadline: None,
        }
    }
}

/// A node discovered by traversal, with its hop distance from the roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub object: GraphObject,
    pub depth: u32,
}

/// Deduplicated nodes and edges discovered by a traversal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<crate::domain::graph::GraphRelationship>,
}

/// A distinct label with its usage count over visible heads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCount {
    pub label: String,
    pub count: i64,
}
