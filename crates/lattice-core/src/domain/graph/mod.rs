//! Graph domain types: objects, relationships, branches, scope

pub mod branch;
pub mod object;
pub mod relationship;
pub mod scope;

pub use branch::{Branch, BranchLineage};
pub use object::{
    GraphObject, ObjectDraft, ObjectPatch, Properties, MERGED_INTO_KEY, MERGE_HISTORY_KEY,
};
pub use relationship::{GraphRelationship, ObjectEdges, RelationshipDraft, RelationshipPatch};
pub use scope::Scope;
