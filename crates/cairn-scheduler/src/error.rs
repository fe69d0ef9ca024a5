//! Scheduler error types.

use cairn_store::StoreError;
use cairn_types::{GvgId, SpId};
use thiserror::Error;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the exit workflow.
#[derive(Debug, Error)]
pub enum Error {
    /// Chain query or transaction submission failed.
    #[error("chain error: {0}")]
    Chain(String),

    /// Peer SP RPC failed.
    #[error("peer error: {0}")]
    Peer(String),

    /// Durable state error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The picker found no SP passing the supplied filter.
    #[error("no eligible storage provider")]
    NoEligibleSp,

    /// A completion event referenced a swap-out this plan does not own.
    #[error("swap out key not found: {0}")]
    SwapOutNotFound(String),

    /// A progress callback referenced an unknown migrate unit.
    #[error("migrate gvg unit not found: {0}")]
    MigrateUnitNotFound(String),

    /// The SP is not a secondary of the group it was expected in.
    #[error("sp {sp_id} is not a secondary of gvg {gvg_id}")]
    SecondaryNotFound { gvg_id: GvgId, sp_id: SpId },

    /// The executor queue rejected a task.
    #[error("task queue push failed: {0}")]
    QueuePush(String),
}
