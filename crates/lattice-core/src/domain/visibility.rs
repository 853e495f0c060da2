//! SQL fragments for branch visibility and head resolution
//!
//! All reads share the same two filters:
//!
//! * **visible** — the row belongs to the scope's project and was written
//!   on the default branch or on a branch in the scope's ancestor set
//!   (precomputed lineage, no recursion at read time);
//! * **head** — no visible row of the same canonical id has a higher
//!   version.
//!
//! The fragments are rendered with an alias so they compose into larger
//! queries; bind values are returned alongside and must be bound in order.

use crate::domain::graph::Scope;

/// A rendered SQL fragment plus its positional bind values
pub(crate) struct SqlFragment {
    pub clause: String,
    pub binds: Vec<String>,
}

/// Rows of `alias` visible from the scope's branch
pub(crate) fn visible(alias: &str, scope: &Scope) -> SqlFragment {
    match &scope.branch_id {
        None => SqlFragment {
            clause: format!("{alias}.project_id = ? AND {alias}.branch_id IS NULL"),
            binds: vec![scope.project_id.clone()],
        },
        Some(branch_id) => SqlFragment {
            clause: format!(
                "{alias}.project_id = ? AND ({alias}.branch_id IS NULL OR {alias}.branch_id IN \
                 (SELECT ancestor_branch_id FROM graph_branch_lineage WHERE branch_id = ?))"
            ),
            binds: vec![scope.project_id.clone(), branch_id.clone()],
        },
    }
}

/// No visible row of the same canonical id supersedes `alias`
pub(crate) fn is_newest(table: &str, alias: &str, scope: &Scope) -> SqlFragment {
    let newer = visible("newer", scope);
    SqlFragment {
        clause: format!(
            "NOT EXISTS (SELECT 1 FROM {table} newer WHERE newer.canonical_id = {alias}.canonical_id \
             AND {} AND newer.version > {alias}.version)",
            newer.clause
        ),
        binds: newer.binds,
    }
}

/// Visible live head rows of `alias`: visible, newest, and not tombstoned
pub(crate) fn live_head(table: &str, alias: &str, scope: &Scope) -> SqlFragment {
    let vis = visible(alias, scope);
    let newest = is_newest(table, alias, scope);
    let mut binds = vis.binds;
    binds.extend(newest.binds);
    SqlFragment {
        clause: format!(
            "{} AND {alias}.deleted_at IS NULL AND {}",
            vis.clause, newest.clause
        ),
        binds,
    }
}
