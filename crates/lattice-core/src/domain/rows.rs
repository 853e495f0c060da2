//! Row structs mapping SQLite rows onto domain types

use sqlx::FromRow;

use crate::domain::graph::{Branch, GraphObject, GraphRelationship, Properties};
use crate::error::Result;
use crate::storage::parse_ts;

#[derive(Debug, FromRow)]
pub(crate) struct ObjectRow {
    pub id: String,
    pub canonical_id: String,
    pub version: i64,
    pub project_id: String,
    pub branch_id: Option<String>,
    #[sqlx(rename = "type")]
    pub object_type: String,
    pub key: Option<String>,
    pub status: Option<String>,
    pub properties: String,
    pub labels: String,
    #[allow(dead_code)]
    pub search_text: String,
    pub supersedes_id: Option<String>,
    pub deleted_at: Option<String>,
    pub embedding: Option<Vec<u8>>,
    pub embedding_updated_at: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ObjectRow {
    pub fn into_object(self) -> Result<GraphObject> {
        Ok(GraphObject {
            id: self.id,
            canonical_id: self.canonical_id,
            version: self.version,
            project_id: self.project_id,
            branch_id: self.branch_id,
            object_type: self.object_type,
            key: self.key,
            status: self.status,
            properties: parse_properties(&self.properties)?,
            labels: parse_labels(&self.labels)?,
            supersedes_id: self.supersedes_id,
            deleted_at: self.deleted_at.as_deref().map(parse_ts).transpose()?,
            embedding: self.embedding.as_deref().map(decode_embedding),
            embedding_updated_at: self
                .embedding_updated_at
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RelationshipRow {
    pub id: String,
    pub canonical_id: String,
    pub version: i64,
    pub project_id: String,
    pub branch_id: Option<String>,
    #[sqlx(rename = "type")]
    pub rel_type: String,
    pub src_id: String,
    pub dst_id: String,
    pub properties: String,
    pub weight: Option<f64>,
    pub supersedes_id: Option<String>,
    pub deleted_at: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RelationshipRow {
    pub fn into_relationship(self) -> Result<GraphRelationship> {
        Ok(GraphRelationship {
            id: self.id,
            canonical_id: self.canonical_id,
            version: self.version,
            project_id: self.project_id,
            branch_id: self.branch_id,
            rel_type: self.rel_type,
            src_id: self.src_id,
            dst_id: self.dst_id,
            properties: parse_properties(&self.properties)?,
            weight: self.weight,
            supersedes_id: self.supersedes_id,
            deleted_at: self.deleted_at.as_deref().map(parse_ts).transpose()?,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct BranchRow {
    pub id: String,
    pub project_id: Option<String>,
    pub name: String,
    pub parent_branch_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BranchRow {
    pub fn into_branch(self) -> Result<Branch> {
        Ok(Branch {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            parent_branch_id: self.parent_branch_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn parse_properties(raw: &str) -> Result<Properties> {
    if raw.is_empty() {
        return Ok(Properties::new());
    }
    Ok(serde_json::from_str(raw)?)
}

fn parse_labels(raw: &str) -> Result<Vec<String>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Encode an embedding as a little-endian f32 byte blob
pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian f32 byte blob back into a vector
pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_roundtrip() {
        let embedding = vec![0.1_f32, -0.5, 1.25, 0.0];
        let decoded = decode_embedding(&encode_embedding(&embedding));
        assert_eq!(embedding, decoded);
    }

    #[test]
    fn test_parse_empty_documents() {
        assert!(parse_properties("").unwrap().is_empty());
        assert!(parse_labels("").unwrap().is_empty());
        assert_eq!(parse_labels(r#"["a","b"]"#).unwrap(), vec!["a", "b"]);
    }
}
