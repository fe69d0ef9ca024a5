//! # cairn-scheduler: storage-provider exit and swap-out scheduling
//!
//! This crate drives the graceful departure of a storage provider from a
//! network of replicated virtual groups. The exiting SP builds a swap-out
//! plan (family hand-offs, conflict resolution, secondary departures) and
//! keeps destination SPs notified; absorbing SPs run per-group migration
//! tasks and complete each swap-out on chain; the scheduler ties both
//! sides to the chain's event stream and survives restarts through the
//! `cairn-store` state tables.
//!
//! ```text
//!  chain events ──► SpExitScheduler ──► SrcSpSwapOutPlan ──► peer SPs
//!       ▲                  │                  │
//!       │                  ▼                  ▼
//!  chain txs ◄──── DestSpTaskRunner ◄── task executor
//! ```
//!
//! Collaborators — the chain client, the peer SP client, the
//! virtual-group manager, the task-executor queue, and the store — are
//! trait seams; the scheduler is generic over all of them.

pub mod chain;
mod config;
mod conflict;
mod context;
mod error;
pub mod executor;
pub mod peer;
pub mod picker;
mod plan;
mod runner;
mod scheduler;

pub use chain::{ChainClient, TxHash};
pub use config::SchedulerConfig;
pub use conflict::FamilyConflictChecker;
pub use context::ExitContext;
pub use error::{Error, Result};
pub use executor::{MigrateGvgTask, MigrateProgressReport, TaskQueue};
pub use peer::PeerSpClient;
pub use picker::{PickDestSpFilter, VirtualGroupManager};
pub use plan::{SrcSpSwapOutPlan, SrcSwapOutStatus, SrcSwapOutUnit};
pub use runner::{DestSpTaskRunner, DestSwapOutStatus, GvgTaskStatus, MigrateGvgUnit};
pub use scheduler::{ShutdownHandle, SpExitPlanSnapshot, SpExitScheduler};
