//! Task-executor seam.
//!
//! The scheduler dispatches per-group migration work onto a shared
//! priority queue and observes completion through progress reports; the
//! byte-level data mover behind the queue is out of scope here.

use cairn_types::{FamilyId, GlobalVirtualGroup, GvgId, StorageProvider};

use crate::error::Result;

/// A unit of migration work handed to the executor.
///
/// Priority, timeout, and retry policy are drawn from the executor's own
/// task-framework defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrateGvgTask {
    /// The group being migrated.
    pub src_gvg: GlobalVirtualGroup,

    /// −1 for a primary-role migration, otherwise the source SP's position
    /// in the group's secondary list.
    pub redundancy_index: i32,

    /// The SP the data is leaving.
    pub src_sp: StorageProvider,

    /// Resume point for a task restarted after a crash.
    pub last_migrated_object_id: u64,
}

/// Progress reported back by the executor as a task advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateProgressReport {
    pub gvg_id: GvgId,
    pub family_id: FamilyId,
    pub redundancy_index: i32,
    pub last_migrated_object_id: u64,

    /// True once the final object of the group has been migrated.
    pub finished: bool,
}

/// The executor's migrate-GVG queue.
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task. A push may be rejected on capacity; the caller
    /// treats that as back-pressure and retries later.
    fn push(&self, task: MigrateGvgTask) -> Result<()>;
}
