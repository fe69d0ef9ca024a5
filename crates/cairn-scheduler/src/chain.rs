//! Chain client seam.
//!
//! The scheduler never talks to consensus directly; it consumes this trait.
//! Implementations are expected to be latency-unbounded, so callers treat
//! every method as a suspension point and avoid holding locks across them
//! unless the protocol requires it.

use std::future::Future;

use cairn_types::{
    CompleteSpExitMessage, CompleteSwapOutMessage, FamilyId, GlobalVirtualGroup, GvgId,
    SpExitEvents, SpId, StorageProvider, SwapOutEvent, SwapOutMessage, VirtualGroupFamily,
};

use crate::error::Result;

/// Hash of a submitted transaction.
pub type TxHash = String;

/// Queries and transactions against the chain.
pub trait ChainClient: Send + Sync {
    /// Looks up a storage provider by operator address.
    fn query_sp(
        &self,
        operator_address: &str,
    ) -> impl Future<Output = Result<StorageProvider>> + Send;

    fn query_global_virtual_group(
        &self,
        gvg_id: GvgId,
    ) -> impl Future<Output = Result<GlobalVirtualGroup>> + Send;

    /// Lists the groups of a family at the current height.
    fn list_global_virtual_groups_by_family_id(
        &self,
        family_id: FamilyId,
    ) -> impl Future<Output = Result<Vec<GlobalVirtualGroup>>> + Send;

    /// Lists the families whose primary is `sp_id`.
    fn list_virtual_group_families(
        &self,
        sp_id: SpId,
    ) -> impl Future<Output = Result<Vec<VirtualGroupFamily>>> + Send;

    /// Lists the groups in which `sp_id` serves as a secondary.
    fn list_global_virtual_groups_by_secondary_sp(
        &self,
        sp_id: SpId,
    ) -> impl Future<Output = Result<Vec<GlobalVirtualGroup>>> + Send;

    /// Exit events recorded for `operator_address` at `from_height`.
    fn list_sp_exit_events(
        &self,
        from_height: u64,
        operator_address: &str,
    ) -> impl Future<Output = Result<SpExitEvents>> + Send;

    /// Swap-out events recorded for `sp_id` at `from_height`.
    fn list_swap_out_events(
        &self,
        from_height: u64,
        sp_id: SpId,
    ) -> impl Future<Output = Result<Vec<SwapOutEvent>>> + Send;

    /// Submits an approved swap-out.
    fn swap_out(&self, msg: &SwapOutMessage) -> impl Future<Output = Result<TxHash>> + Send;

    /// Submits a swap-out completion.
    fn complete_swap_out(
        &self,
        msg: &CompleteSwapOutMessage,
    ) -> impl Future<Output = Result<TxHash>> + Send;

    /// Submits the final exit transaction.
    fn complete_sp_exit(
        &self,
        msg: &CompleteSpExitMessage,
    ) -> impl Future<Output = Result<TxHash>> + Send;
}
