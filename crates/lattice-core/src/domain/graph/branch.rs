//! Branches and precomputed lineage
//!
//! A branch is a named, isolated view of a project's graph. Isolation is
//! achieved by lineage-based visibility filtering at read time: no object
//! rows are copied when a branch is created. The lineage table records the
//! full ancestor chain (depth 0 = the branch itself) exactly once, at
//! creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named branch of a project's graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    /// Owning project; None for project-less scratch branches
    pub project_id: Option<String>,
    pub name: String,
    /// Parent branch this one forked from; None for root branches
    pub parent_branch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of a branch's precomputed ancestor chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchLineage {
    pub branch_id: String,
    pub ancestor_branch_id: String,
    /// 0 = self, 1 = parent, 2 = grandparent, ...
    pub depth: i64,
}
