//! End-to-end tests for the graph engine: versioning, branching, search,
//! merges, and the embedding pipeline, all against an in-memory database.

use std::sync::Arc;

use serde_json::{json, Value};

use lattice_core::domain::merge::{MergeOptions, MergeService, MergeStrategy};
use lattice_core::domain::query::{
    GraphQueryService, HybridSearchRequest, ObjectFilter, SearchQuery, TraverseOptions,
    VectorSearchOptions,
};
use lattice_core::domain::versioning::VersioningService;
use lattice_core::jobs::{
    EmbeddingWorker, Embedder, EnqueueOptions, HashEmbedder, JobQueue, RetryPolicy, WorkerConfig,
};
use lattice_core::prelude::*;
use lattice_core::storage::Database;

struct Engine {
    db: Database,
    versioning: VersioningService,
    query: GraphQueryService,
    merge: MergeService,
}

async fn engine() -> Engine {
    let db = Database::in_memory().await.expect("Failed to create database");
    let pool = db.pool().clone();
    Engine {
        versioning: VersioningService::new(pool.clone()),
        query: GraphQueryService::new(pool.clone()),
        merge: MergeService::new(pool),
        db,
    }
}

fn props(pairs: &[(&str, Value)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ========== Versioning scenarios ==========

#[tokio::test]
async fn patch_produces_version_two_and_single_head() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let v1 = e
        .versioning
        .create_object(
            ObjectDraft::new("Requirement").with_property("name", json!("A")),
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(v1.version, 1);

    let v2 = e
        .versioning
        .patch_object(
            &v1.canonical_id,
            ObjectPatch::properties(props(&[("name", json!("B"))])),
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(v2.version, 2);
    let old = e.versioning.get_object(&v1.id, &scope).await.unwrap().unwrap();
    assert!(old.deleted_at.is_some(), "superseded version must be tombstoned");

    let head = e
        .versioning
        .resolve_head(&v1.canonical_id, &scope)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.version, 2);
    assert_eq!(head.properties["name"], json!("B"));

    // Exactly one live row for the canonical id
    let history = e
        .versioning
        .object_history(&v1.canonical_id, &scope)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|v| v.deleted_at.is_none()).count(), 1);
}

#[tokio::test]
async fn versions_increase_strictly_over_repeated_patches() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let created = e
        .versioning
        .create_object(ObjectDraft::new("Task"), &scope)
        .await
        .unwrap();

    let mut last_version = created.version;
    for i in 0..5 {
        let patched = e
            .versioning
            .patch_object(
                &created.canonical_id,
                ObjectPatch::properties(props(&[("round", json!(i))])),
                &scope,
            )
            .await
            .unwrap();
        assert!(patched.version > last_version);
        last_version = patched.version;
    }
    assert_eq!(last_version, 6);
}

#[tokio::test]
async fn deleted_object_disappears_until_restored() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let obj = e
        .versioning
        .create_object(ObjectDraft::new("Requirement"), &scope)
        .await
        .unwrap();

    let tombstone = e
        .versioning
        .delete_object(&obj.canonical_id, &scope)
        .await
        .unwrap();

    // Invisible to plain search, visible with include_deleted
    let page = e
        .query
        .search(SearchQuery::default(), &scope)
        .await
        .unwrap();
    assert!(page.items.is_empty());

    let page = e
        .query
        .search(
            SearchQuery {
                filter: ObjectFilter::default().include_deleted(),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);

    let restored = e
        .versioning
        .restore_object(&tombstone.id, &scope)
        .await
        .unwrap();
    assert!(restored.deleted_at.is_none());
    assert!(e
        .versioning
        .resolve_head(&obj.canonical_id, &scope)
        .await
        .unwrap()
        .is_some());
}

// ========== Branch isolation ==========

#[tokio::test]
async fn sibling_branches_do_not_see_each_others_patches() {
    let e = engine().await;

    let main = e.versioning.create_branch("main", Some("p1"), None).await.unwrap();
    let x = e
        .versioning
        .create_branch("x", Some("p1"), Some(&main.id))
        .await
        .unwrap();
    let y = e
        .versioning
        .create_branch("y", Some("p1"), Some(&main.id))
        .await
        .unwrap();

    let main_scope = Scope::branch("p1", &main.id);
    let x_scope = Scope::branch("p1", &x.id);
    let y_scope = Scope::branch("p1", &y.id);

    let obj = e
        .versioning
        .create_object(
            ObjectDraft::new("Requirement").with_property("name", json!("base")),
            &main_scope,
        )
        .await
        .unwrap();

    e.versioning
        .patch_object(
            &obj.canonical_id,
            ObjectPatch::properties(props(&[("name", json!("x-edit"))])),
            &x_scope,
        )
        .await
        .unwrap();

    let y_head = e
        .versioning
        .resolve_head(&obj.canonical_id, &y_scope)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(y_head.version, 1);
    assert_eq!(y_head.properties["name"], json!("base"));

    // Search on Y also sees the unpatched head
    let page = e.query.search(SearchQuery::default(), &y_scope).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].properties["name"], json!("base"));

    // And X sees its own edit as the single head
    let page = e.query.search(SearchQuery::default(), &x_scope).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].properties["name"], json!("x-edit"));
}

// ========== Paged search ==========

#[tokio::test]
async fn cursor_pagination_covers_all_rows_without_duplicates() {
    let e = engine().await;
    let scope = Scope::project("p1");

    for i in 0..5 {
        e.versioning
            .create_object(
                ObjectDraft::new("Requirement").with_property("index", json!(i)),
                &scope,
            )
            .await
            .unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = e
            .query
            .search(
                SearchQuery {
                    limit: Some(2),
                    cursor: cursor.clone(),
                    ..Default::default()
                },
                &scope,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        for item in &page.items {
            assert!(seen.insert(item.id.clone()), "duplicate row across pages");
        }
        pages += 1;
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    assert_eq!(seen.len(), 5);
    assert_eq!(pages, 3);
}

#[tokio::test]
async fn malformed_cursor_is_invalid_input() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let err = e
        .query
        .search(
            SearchQuery {
                cursor: Some("invalid-cursor-format!!!".into()),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn structured_filters_combine() {
    let e = engine().await;
    let scope = Scope::project("p1");

    e.versioning
        .create_object(
            ObjectDraft::new("Requirement")
                .with_key("auth-login")
                .with_status("draft")
                .with_labels(vec!["security".into(), "mvp".into()]),
            &scope,
        )
        .await
        .unwrap();
    e.versioning
        .create_object(
            ObjectDraft::new("Requirement")
                .with_key("auth-logout")
                .with_status("approved")
                .with_labels(vec!["security".into()]),
            &scope,
        )
        .await
        .unwrap();
    e.versioning
        .create_object(
            ObjectDraft::new("Decision")
                .with_key("db-choice")
                .with_labels(vec!["infra".into()]),
            &scope,
        )
        .await
        .unwrap();

    let page = e
        .query
        .search(
            SearchQuery {
                filter: ObjectFilter::default().with_types(vec!["Requirement".into()]),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);

    let page = e
        .query
        .search(
            SearchQuery {
                filter: ObjectFilter::default().with_key_prefix("auth-log"),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);

    let page = e
        .query
        .search(
            SearchQuery {
                filter: ObjectFilter::default()
                    .with_labels_all(vec!["security".into(), "mvp".into()]),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);

    let page = e
        .query
        .search(
            SearchQuery {
                filter: ObjectFilter::default()
                    .with_labels_any(vec!["mvp".into(), "infra".into()]),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);

    let page = e
        .query
        .search(
            SearchQuery {
                filter: ObjectFilter::default().with_statuses(vec!["approved".into()]),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn tags_are_counted_and_sorted() {
    let e = engine().await;
    let scope = Scope::project("p1");

    for labels in [
        vec!["security".to_string(), "mvp".to_string()],
        vec!["security".to_string()],
        vec!["infra".to_string()],
    ] {
        e.versioning
            .create_object(ObjectDraft::new("Requirement").with_labels(labels), &scope)
            .await
            .unwrap();
    }

    let tags = e
        .query
        .get_all_tags(&ObjectFilter::default(), &scope)
        .await
        .unwrap();

    let rendered: Vec<(String, i64)> = tags.into_iter().map(|t| (t.label, t.count)).collect();
    assert_eq!(
        rendered,
        vec![
            ("infra".to_string(), 1),
            ("mvp".to_string(), 1),
            ("security".to_string(), 2),
        ]
    );
}

// ========== Traversal ==========

async fn chain(e: &Engine, scope: &Scope, len: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..len {
        let obj = e
            .versioning
            .create_object(
                ObjectDraft::new("Node").with_key(format!("node-{i}")),
                scope,
            )
            .await
            .unwrap();
        ids.push(obj.canonical_id);
    }
    for pair in ids.windows(2) {
        e.versioning
            .create_relationship(RelationshipDraft::new("LINKS_TO", &pair[0], &pair[1]), scope)
            .await
            .unwrap();
    }
    ids
}

#[tokio::test]
async fn traversal_expands_to_max_depth() {
    let e = engine().await;
    let scope = Scope::project("p1");
    let ids = chain(&e, &scope, 4).await;

    let snapshot = e
        .query
        .traverse(
            &[ids[0].clone()],
            TraverseOptions {
                max_depth: 2,
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(snapshot.nodes.len(), 3);
    let depths: Vec<(String, u32)> = snapshot
        .nodes
        .iter()
        .map(|n| (n.object.key.clone().unwrap(), n.depth))
        .collect();
    assert!(depths.contains(&("node-0".into(), 0)));
    assert!(depths.contains(&("node-1".into(), 1)));
    assert!(depths.contains(&("node-2".into(), 2)));

    // Only edges between discovered nodes are reported
    assert_eq!(snapshot.edges.len(), 2);
}

#[tokio::test]
async fn phased_and_recursive_traversal_agree() {
    let e = engine().await;
    let scope = Scope::project("p1");
    let ids = chain(&e, &scope, 5).await;

    // Extra fan-out from the middle of the chain
    let side = e
        .versioning
        .create_object(ObjectDraft::new("Node").with_key("side"), &scope)
        .await
        .unwrap();
    e.versioning
        .create_relationship(
            RelationshipDraft::new("LINKS_TO", &ids[2], &side.canonical_id),
            &scope,
        )
        .await
        .unwrap();

    let collect = |snapshot: lattice_core::domain::query::GraphSnapshot| {
        let mut nodes: Vec<(String, u32)> = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.object.canonical_id, n.depth))
            .collect();
        nodes.sort();
        let mut edges: Vec<String> = snapshot.edges.into_iter().map(|e| e.canonical_id).collect();
        edges.sort();
        (nodes, edges)
    };

    let recursive = e
        .query
        .traverse(
            &[ids[0].clone()],
            TraverseOptions {
                max_depth: 3,
                phased: false,
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();
    let phased = e
        .query
        .traverse(
            &[ids[0].clone()],
            TraverseOptions {
                max_depth: 3,
                phased: true,
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(collect(recursive), collect(phased));
}

#[tokio::test]
async fn unresolvable_roots_are_silently_omitted() {
    let e = engine().await;
    let scope = Scope::project("p1");
    let ids = chain(&e, &scope, 2).await;

    let snapshot = e
        .query
        .traverse(
            &[ids[0].clone(), "does-not-exist".to_string()],
            TraverseOptions::default(),
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(snapshot.nodes.len(), 2);

    let empty = e
        .query
        .traverse(
            &["does-not-exist".to_string()],
            TraverseOptions::default(),
            &scope,
        )
        .await
        .unwrap();
    assert!(empty.nodes.is_empty());
    assert!(empty.edges.is_empty());
}

#[tokio::test]
async fn object_edges_split_directions() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let src = e
        .versioning
        .create_object(ObjectDraft::new("Requirement"), &scope)
        .await
        .unwrap();
    let dst = e
        .versioning
        .create_object(ObjectDraft::new("Decision"), &scope)
        .await
        .unwrap();
    e.versioning
        .create_relationship(
            RelationshipDraft::new("DEPENDS_ON", &src.canonical_id, &dst.canonical_id),
            &scope,
        )
        .await
        .unwrap();

    let src_edges = e.query.object_edges(&src.canonical_id, &scope).await.unwrap();
    assert_eq!(src_edges.outgoing.len(), 1);
    assert!(src_edges.incoming.is_empty());

    let dst_edges = e.query.object_edges(&dst.canonical_id, &scope).await.unwrap();
    assert!(dst_edges.outgoing.is_empty());
    assert_eq!(dst_edges.incoming.len(), 1);
    assert_eq!(dst_edges.incoming[0].rel_type, "DEPENDS_ON");
}

// ========== Search modalities ==========

#[tokio::test]
async fn full_text_search_finds_property_text() {
    let e = engine().await;
    let scope = Scope::project("p1");

    e.versioning
        .create_object(
            ObjectDraft::new("Requirement")
                .with_key("auth")
                .with_property("description", json!("implement user authentication flow")),
            &scope,
        )
        .await
        .unwrap();
    e.versioning
        .create_object(
            ObjectDraft::new("Requirement")
                .with_key("billing")
                .with_property("description", json!("monthly invoice generation")),
            &scope,
        )
        .await
        .unwrap();

    let hits = e
        .query
        .full_text_search("authentication", Default::default(), &scope)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].object.key.as_deref(), Some("auth"));
    assert!(hits[0].lexical_score.is_some());
}

#[tokio::test]
async fn vector_search_ranks_by_distance() {
    let e = engine().await;
    let scope = Scope::project("p1");
    let embedder = HashEmbedder::new(64);

    let mut ids = Vec::new();
    for (key, text) in [
        ("auth", "user authentication and login sessions"),
        ("billing", "invoices payments and billing cycles"),
        ("search", "full text search and ranking"),
    ] {
        let obj = e
            .versioning
            .create_object(
                ObjectDraft::new("Requirement")
                    .with_key(key)
                    .with_property("description", json!(text)),
                &scope,
            )
            .await
            .unwrap();
        ids.push(obj.id);
    }

    // Embed all heads through the worker pipeline
    let queue = JobQueue::new(e.db.pool().clone(), RetryPolicy::default());
    for id in &ids {
        queue.enqueue(EnqueueOptions::for_object(id.clone())).await.unwrap();
    }
    let worker = EmbeddingWorker::new(
        queue,
        Arc::new(embedder.clone()),
        e.db.pool().clone(),
        WorkerConfig::default(),
    );
    let metrics = worker.drain_once().await.unwrap();
    assert_eq!(metrics.succeeded, 3);

    let query_vector = embedder
        .embed("Requirement auth user authentication and login sessions")
        .await
        .unwrap();
    let hits = e
        .query
        .vector_search(
            &query_vector,
            VectorSearchOptions {
                limit: Some(3),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].object.key.as_deref(), Some("auth"));
    let d0 = hits[0].vector_distance.unwrap();
    let d1 = hits[1].vector_distance.unwrap();
    assert!(d0 <= d1, "results must be ordered by distance");
}

#[tokio::test]
async fn vector_search_validates_max_distance() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let err = e
        .query
        .vector_search(
            &[0.1, 0.2],
            VectorSearchOptions {
                max_distance: Some(3.0),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn hybrid_search_falls_back_to_lexical_when_vector_is_empty() {
    let e = engine().await;
    let scope = Scope::project("p1");

    // Lexical match exists but no object has an embedding
    e.versioning
        .create_object(
            ObjectDraft::new("Requirement")
                .with_key("auth")
                .with_property("description", json!("user authentication flow")),
            &scope,
        )
        .await
        .unwrap();

    let hits = e
        .query
        .hybrid_search(
            HybridSearchRequest {
                query: Some("authentication".into()),
                vector: Some(vec![0.5; 64]),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 1, "lexical results must survive an empty vector side");
    assert_eq!(hits[0].object.key.as_deref(), Some("auth"));
}

#[tokio::test]
async fn hybrid_search_requires_query_or_vector() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let err = e
        .query
        .hybrid_search(HybridSearchRequest::default(), &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn hybrid_search_fuses_both_modalities() {
    let e = engine().await;
    let scope = Scope::project("p1");
    let embedder = HashEmbedder::new(64);

    let mut row_ids = Vec::new();
    for (key, text) in [
        ("auth", "user authentication flow"),
        ("billing", "authentication for billing systems"),
    ] {
        let obj = e
            .versioning
            .create_object(
                ObjectDraft::new("Requirement")
                    .with_key(key)
                    .with_property("description", json!(text)),
                &scope,
            )
            .await
            .unwrap();
        row_ids.push(obj.id);
    }

    let queue = JobQueue::new(e.db.pool().clone(), RetryPolicy::default());
    queue.enqueue_batch(&row_ids, 0).await.unwrap();
    let worker = EmbeddingWorker::new(
        queue,
        Arc::new(embedder.clone()),
        e.db.pool().clone(),
        WorkerConfig::default(),
    );
    worker.drain_once().await.unwrap();

    let vector = embedder
        .embed("Requirement auth user authentication flow")
        .await
        .unwrap();
    let hits = e
        .query
        .hybrid_search(
            HybridSearchRequest {
                query: Some("authentication".into()),
                vector: Some(vector),
                lexical_weight: Some(0.5),
                vector_weight: Some(0.5),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 2);
    // Both modalities contributed to the top hit
    assert!(hits[0].lexical_score.is_some());
    assert!(hits[0].vector_distance.is_some());
    assert_eq!(hits[0].object.key.as_deref(), Some("auth"));
}

// ========== Merge scenarios ==========

#[tokio::test]
async fn source_wins_merge_unions_properties_and_records_history() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let source = e
        .versioning
        .create_object(
            ObjectDraft::new("Person")
                .with_key("s")
                .with_properties(props(&[("name", json!("S")), ("x", json!(1))])),
            &scope,
        )
        .await
        .unwrap();
    let target = e
        .versioning
        .create_object(
            ObjectDraft::new("Person")
                .with_key("t")
                .with_properties(props(&[("name", json!("T")), ("y", json!(2))])),
            &scope,
        )
        .await
        .unwrap();

    let outcome = e
        .merge
        .merge_objects(
            &source.canonical_id,
            &target.canonical_id,
            MergeOptions {
                merged_by: Some("user-1".into()),
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(outcome.merged_properties["name"], json!("S"));
    assert_eq!(outcome.merged_properties["x"], json!(1));
    assert_eq!(outcome.merged_properties["y"], json!(2));

    let head = e
        .versioning
        .resolve_head(&target.canonical_id, &scope)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.id, outcome.target_object_id);
    assert_eq!(head.version, 2);
    assert_eq!(head.merge_history().len(), 1);
    assert_eq!(head.merge_history()[0]["merged_from"], json!(source.canonical_id));
    assert_eq!(head.merge_history()[0]["merged_by"], json!("user-1"));

    // The source reads as merged away, not vanished
    assert!(e
        .versioning
        .resolve_head(&source.canonical_id, &scope)
        .await
        .unwrap()
        .is_none());
    let source_versions = e
        .versioning
        .object_history(&source.canonical_id, &scope)
        .await
        .unwrap();
    assert_eq!(source_versions[0].id, outcome.deleted_source_id);
    assert_eq!(
        source_versions[0].merged_into(),
        Some(target.canonical_id.as_str())
    );
}

#[tokio::test]
async fn target_wins_merge_keeps_target_conflicting_fields() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let source = e
        .versioning
        .create_object(
            ObjectDraft::new("Person").with_properties(props(&[
                ("name", json!("S")),
                ("x", json!(1)),
            ])),
            &scope,
        )
        .await
        .unwrap();
    let target = e
        .versioning
        .create_object(
            ObjectDraft::new("Person").with_properties(props(&[
                ("name", json!("T")),
                ("y", json!(2)),
            ])),
            &scope,
        )
        .await
        .unwrap();

    let outcome = e
        .merge
        .merge_objects(
            &source.canonical_id,
            &target.canonical_id,
            MergeOptions {
                strategy: MergeStrategy::TargetWins,
                ..Default::default()
            },
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(outcome.merged_properties["name"], json!("T"));
    assert_eq!(outcome.merged_properties["x"], json!(1));
    assert_eq!(outcome.merged_properties["y"], json!(2));
}

#[tokio::test]
async fn repeated_merges_append_history_without_rewriting() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let target = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("t"), &scope)
        .await
        .unwrap();

    for key in ["a", "b"] {
        let source = e
            .versioning
            .create_object(ObjectDraft::new("Person").with_key(key), &scope)
            .await
            .unwrap();
        e.merge
            .merge_objects(
                &source.canonical_id,
                &target.canonical_id,
                MergeOptions::default(),
                &scope,
            )
            .await
            .unwrap();
    }

    let head = e
        .versioning
        .resolve_head(&target.canonical_id, &scope)
        .await
        .unwrap()
        .unwrap();
    let history = head.merge_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["merged_from_key"], json!("a"));
    assert_eq!(history[1]["merged_from_key"], json!("b"));
}

#[tokio::test]
async fn merge_redirects_relationships_to_target() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let source = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("s"), &scope)
        .await
        .unwrap();
    let target = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("t"), &scope)
        .await
        .unwrap();
    let other = e
        .versioning
        .create_object(ObjectDraft::new("Company").with_key("acme"), &scope)
        .await
        .unwrap();

    e.versioning
        .create_relationship(
            RelationshipDraft::new("WORKS_AT", &source.canonical_id, &other.canonical_id),
            &scope,
        )
        .await
        .unwrap();

    let outcome = e
        .merge
        .merge_objects(
            &source.canonical_id,
            &target.canonical_id,
            MergeOptions::default(),
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(outcome.redirected_relationships, 1);

    let target_edges = e.query.object_edges(&target.canonical_id, &scope).await.unwrap();
    assert_eq!(target_edges.outgoing.len(), 1);
    assert_eq!(target_edges.outgoing[0].dst_id, other.canonical_id);
    assert_eq!(target_edges.outgoing[0].version, 2);

    let source_edges = e.query.object_edges(&source.canonical_id, &scope).await.unwrap();
    assert!(source_edges.outgoing.is_empty());
    assert!(source_edges.incoming.is_empty());
}

#[tokio::test]
async fn merge_skips_self_referential_redirect() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let source = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("s"), &scope)
        .await
        .unwrap();
    let target = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("t"), &scope)
        .await
        .unwrap();

    // target -> source would become target -> target
    e.versioning
        .create_relationship(
            RelationshipDraft::new("KNOWS", &target.canonical_id, &source.canonical_id),
            &scope,
        )
        .await
        .unwrap();

    let outcome = e
        .merge
        .merge_objects(
            &source.canonical_id,
            &target.canonical_id,
            MergeOptions::default(),
            &scope,
        )
        .await
        .unwrap();

    assert_eq!(outcome.redirected_relationships, 0);
    let edges = e.query.object_edges(&target.canonical_id, &scope).await.unwrap();
    assert!(edges.outgoing.is_empty(), "no self-loop may be created");
    assert!(edges.incoming.is_empty());
}

#[tokio::test]
async fn merge_skips_duplicate_relationships() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let source = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("s"), &scope)
        .await
        .unwrap();
    let target = e
        .versioning
        .create_object(ObjectDraft::new("Person").with_key("t"), &scope)
        .await
        .unwrap();
    let other = e
        .versioning
        .create_object(ObjectDraft::new("Company").with_key("acme"), &scope)
        .await
        .unwrap();

    // Both sides already point at the company with the same type
    e.versioning
        .create_relationship(
            RelationshipDraft::new("WORKS_AT", &source.canonical_id, &other.canonical_id),
            &scope,
        )
        .await
        .unwrap();
    e.versioning
        .create_relationship(
            RelationshipDraft::new("WORKS_AT", &target.canonical_id, &other.canonical_id),
            &scope,
        )
        .await
        .unwrap();

    let outcome = e
        .merge
        .merge_objects(
            &source.canonical_id,
            &target.canonical_id,
            MergeOptions::default(),
            &scope,
        )
        .await
        .unwrap();
    assert_eq!(outcome.redirected_relationships, 0);

    let edges = e.query.object_edges(&target.canonical_id, &scope).await.unwrap();
    assert_eq!(edges.outgoing.len(), 1, "no duplicate edge may be created");
}

#[tokio::test]
async fn merge_into_self_is_rejected() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let obj = e
        .versioning
        .create_object(ObjectDraft::new("Person"), &scope)
        .await
        .unwrap();

    let err = e
        .merge
        .merge_objects(
            &obj.canonical_id,
            &obj.canonical_id,
            MergeOptions::default(),
            &scope,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn merge_reports_missing_sides() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let target = e
        .versioning
        .create_object(ObjectDraft::new("Person"), &scope)
        .await
        .unwrap();

    let err = e
        .merge
        .merge_objects("ghost", &target.canonical_id, MergeOptions::default(), &scope)
        .await
        .unwrap_err();
    match err {
        Error::ObjectNotFound(message) => assert!(message.contains("source")),
        other => panic!("expected ObjectNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_merge_rolls_back_completely() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let source = e
        .versioning
        .create_object(
            ObjectDraft::new("Person").with_properties(props(&[("name", json!("S"))])),
            &scope,
        )
        .await
        .unwrap();
    let target = e
        .versioning
        .create_object(
            ObjectDraft::new("Person").with_properties(props(&[("name", json!("T"))])),
            &scope,
        )
        .await
        .unwrap();
    let other = e
        .versioning
        .create_object(ObjectDraft::new("Company"), &scope)
        .await
        .unwrap();
    let rel = e
        .versioning
        .create_relationship(
            RelationshipDraft::new("WORKS_AT", &source.canonical_id, &other.canonical_id),
            &scope,
        )
        .await
        .unwrap();

    // Occupy (canonical_id, version 2) of the relationship from another
    // project so the redirect insert inside the merge hits the unique
    // constraint after properties were merged and the target rewritten
    sqlx::query(
        "INSERT INTO graph_relationships \
         (id, canonical_id, version, project_id, type, src_id, dst_id, created_at, updated_at) \
         VALUES ('spoof-rel', ?, 2, 'other-project', 'WORKS_AT', 'a', 'b', \
                 '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
    )
    .bind(&rel.canonical_id)
    .execute(e.db.pool())
    .await
    .unwrap();

    let err = e
        .merge
        .merge_objects(
            &source.canonical_id,
            &target.canonical_id,
            MergeOptions::default(),
            &scope,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Nothing happened: target head unchanged, no provenance, source
    // alive, relationship still attached to the source
    let target_head = e
        .versioning
        .resolve_head(&target.canonical_id, &scope)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(target_head.version, 1);
    assert_eq!(target_head.properties["name"], json!("T"));
    assert!(target_head.merge_history().is_empty());

    let source_head = e
        .versioning
        .resolve_head(&source.canonical_id, &scope)
        .await
        .unwrap()
        .expect("source must survive a failed merge");
    assert_eq!(source_head.version, 1);

    let edges = e.query.object_edges(&source.canonical_id, &scope).await.unwrap();
    assert_eq!(edges.outgoing.len(), 1);
}

// ========== Embedding pipeline ==========

#[tokio::test]
async fn worker_lifecycle_processes_queued_objects() {
    let e = engine().await;
    let scope = Scope::project("p1");

    let object = e
        .versioning
        .create_object(
            ObjectDraft::new("Person")
                .with_key("jane")
                .with_property("bio", json!("engineer and writer")),
            &scope,
        )
        .await
        .unwrap();

    let config = WorkerConfig {
        interval_ms: 20,
        ..Default::default()
    };
    let queue = JobQueue::new(
        e.db.pool().clone(),
        RetryPolicy {
            base_delay_secs: config.base_retry_delay_secs,
            max_delay_secs: config.max_retry_delay_secs,
            max_attempts: config.max_attempts,
        },
    );
    queue
        .enqueue(EnqueueOptions::for_object(object.id.clone()))
        .await
        .unwrap();

    let worker = EmbeddingWorker::new(
        queue.clone(),
        Arc::new(HashEmbedder::new(48)),
        e.db.pool().clone(),
        config,
    );
    worker.start().await.unwrap();

    // Wait for the polling loop to drain the queue
    for _ in 0..100 {
        if queue
            .get_active_job_for_object(&object.id)
            .await
            .unwrap()
            .is_none()
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    worker.stop().await.unwrap();

    let refreshed = e
        .versioning
        .get_object(&object.id, &scope)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.embedding.unwrap().len(), 48);

    let metrics = worker.metrics();
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.failed, 0);
}
