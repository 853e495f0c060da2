//! Graph query service: traversal, structured listing, and hybrid search

pub mod filter;
pub mod service;

pub use filter::{
    FullTextSearchOptions, GraphSnapshot, HybridSearchRequest, ObjectFilter, Page, SearchHit,
    SearchQuery, SnapshotNode, TagCount, TraverseOptions, VectorSearchOptions,
};
pub use service::GraphQueryService;
