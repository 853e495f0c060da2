//! Object merge service: transactional identity consolidation

pub mod lock;
pub mod service;

pub use lock::{MergeLockGuard, MergeLockRegistry};
pub use service::{MergeOptions, MergeOutcome, MergeService, MergeStrategy};
