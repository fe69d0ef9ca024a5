//! Shared dependency bundle.

use cairn_store::ExitStore;
use cairn_types::StorageProvider;

use crate::chain::ChainClient;
use crate::executor::TaskQueue;
use crate::peer::PeerSpClient;
use crate::picker::VirtualGroupManager;

/// Everything the exit workflow components need, shared behind one `Arc`.
///
/// The plan, the task runner, and the conflict checker all borrow this
/// bundle instead of pointing back at the scheduler, so no component holds
/// a reference cycle.
pub struct ExitContext<C, P, S, V, Q>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
    V: VirtualGroupManager,
    Q: TaskQueue,
{
    pub chain: C,
    pub peer: P,
    pub store: S,
    pub vg_manager: V,
    pub task_queue: Q,

    /// The SP this process operates as, queried from chain at startup.
    pub self_sp: StorageProvider,
}
