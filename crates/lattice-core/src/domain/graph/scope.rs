//! Tenancy scope
//!
//! Every engine operation receives its tenant context from the caller;
//! the engine never derives tenancy itself.

use serde::{Deserialize, Serialize};

/// Project and branch context for an operation.
///
/// `branch_id: None` addresses the project's default branch. Rows written
/// on the default branch are visible from every branch of the project;
/// rows written on a branch are visible from that branch and its
/// descendants (via the precomputed lineage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub project_id: String,
    pub branch_id: Option<String>,
}

impl Scope {
    /// Scope addressing a project's default branch
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            branch_id: None,
        }
    }

    /// Scope addressing a specific branch of a project
    pub fn branch(project_id: impl Into<String>, branch_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            branch_id: Some(branch_id.into()),
        }
    }
}
