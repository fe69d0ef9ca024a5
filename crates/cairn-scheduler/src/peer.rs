//! Peer SP client seam.

use std::future::Future;

use cairn_types::SwapOutMessage;

use crate::error::Result;

/// RPCs between storage providers, addressed by endpoint.
pub trait PeerSpClient: Send + Sync {
    /// Asks the destination SP to sign `msg`, returning the approved
    /// message (which carries the signature fields chain verification
    /// expects).
    fn get_swap_out_approval(
        &self,
        dest_endpoint: &str,
        msg: &SwapOutMessage,
    ) -> impl Future<Output = Result<SwapOutMessage>> + Send;

    /// Tells the destination SP to start migrating the swap-out's groups.
    ///
    /// Receivers treat repeated notifications for the same swap-out as a
    /// no-op, so senders may re-deliver freely.
    fn notify_dest_sp_migrate_swap_out(
        &self,
        dest_endpoint: &str,
        msg: &SwapOutMessage,
    ) -> impl Future<Output = Result<()>> + Send;
}
