//! # cairn-types: Core types for the Cairn control plane
//!
//! This crate contains the shared data model of the storage-provider exit
//! workflow:
//! - Entity IDs ([`SpId`], [`GvgId`], [`FamilyId`])
//! - Network records ([`StorageProvider`], [`GlobalVirtualGroup`], [`VirtualGroupFamily`])
//! - Chain messages ([`SwapOutMessage`], [`CompleteSwapOutMessage`], [`CompleteSpExitMessage`])
//! - Chain events ([`SpExitEvents`], [`SwapOutEvent`], [`EventCompleteSwapOut`])
//! - Migration progress ([`MigrateStatus`], [`make_gvg_migrate_key`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 4-byte values)
// ============================================================================

/// Unique identifier for a storage provider.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SpId(u32);

impl SpId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl Display for SpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SpId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SpId> for u32 {
    fn from(id: SpId) -> Self {
        id.0
    }
}

/// Unique identifier for a global virtual group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GvgId(u32);

impl GvgId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl Display for GvgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for GvgId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<GvgId> for u32 {
    fn from(id: GvgId) -> Self {
        id.0
    }
}

/// Unique identifier for a virtual group family.
///
/// Family ID 0 is the standalone sentinel: a group with family 0 exists
/// outside any family and is replicated secondary-only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FamilyId(u32);

impl FamilyId {
    /// The standalone (no-family) sentinel.
    pub const STANDALONE: FamilyId = FamilyId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns true when this is the standalone sentinel.
    pub fn is_standalone(self) -> bool {
        self.0 == 0
    }
}

impl Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for FamilyId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<FamilyId> for u32 {
    fn from(id: FamilyId) -> Self {
        id.0
    }
}

// ============================================================================
// Network records
// ============================================================================

/// A storage provider node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProvider {
    /// Numeric provider ID assigned on chain.
    pub id: SpId,

    /// Chain operator address, the identity used in messages and events.
    pub operator_address: String,

    /// HTTP endpoint used by source SPs to push notifications.
    pub endpoint: String,
}

/// A replication group: one primary plus an ordered list of secondaries.
///
/// An SP participates either as the primary or as a secondary at a specific
/// redundancy index (its 0-based position in `secondary_sp_ids`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVirtualGroup {
    pub id: GvgId,

    /// Owning family, [`FamilyId::STANDALONE`] when secondary-only.
    pub family_id: FamilyId,

    pub primary_sp_id: SpId,

    /// Ordered secondaries; position is the redundancy index.
    pub secondary_sp_ids: Vec<SpId>,
}

impl GlobalVirtualGroup {
    /// Returns the redundancy index of `sp_id` within this group, or `None`
    /// when the SP is not one of its secondaries.
    pub fn secondary_index(&self, sp_id: SpId) -> Option<usize> {
        self.secondary_sp_ids.iter().position(|s| *s == sp_id)
    }
}

/// An ordered bag of virtual groups sharing a single primary SP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualGroupFamily {
    pub id: FamilyId,
    pub primary_sp_id: SpId,
    pub global_virtual_group_ids: Vec<GvgId>,
}

// ============================================================================
// Swap-out keys
// ============================================================================

/// Key prefix for family-level swap-outs.
pub const SWAP_OUT_FAMILY_KEY_PREFIX: &str = "familyID-";

/// Key prefix for GVG-list swap-outs.
pub const SWAP_OUT_GVG_LIST_KEY_PREFIX: &str = "gvgIDList-";

/// Canonical deduplication key of a swap-out target.
///
/// The two forms partition the key space: a non-standalone family ID yields
/// the family form, anything else the GVG-list form (IDs comma-joined in
/// list order).
pub fn swap_out_key(family_id: FamilyId, gvg_ids: &[GvgId]) -> String {
    if !family_id.is_standalone() {
        format!("{SWAP_OUT_FAMILY_KEY_PREFIX}{family_id}")
    } else {
        let joined = gvg_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{SWAP_OUT_GVG_LIST_KEY_PREFIX}{joined}")
    }
}

/// Key of a per-group migration unit: `(gvg, family, redundancy index)`.
///
/// Redundancy index −1 marks a primary-role migration.
pub fn make_gvg_migrate_key(gvg_id: GvgId, family_id: FamilyId, redundancy_index: i32) -> String {
    format!("gvg-{gvg_id}-vgf-{family_id}-ridx-{redundancy_index}")
}

// ============================================================================
// Chain messages
// ============================================================================

/// On-chain record of swap-out intent.
///
/// Exactly one of the two target forms applies: `family_id` non-standalone
/// (family-level) or a non-empty `gvg_ids` list (per-GVG).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOutMessage {
    /// Operator address of the source (exiting) SP.
    pub storage_provider: String,

    /// Family being handed off, [`FamilyId::STANDALONE`] for the list form.
    pub family_id: FamilyId,

    /// Groups being handed off, empty for the family form.
    pub gvg_ids: Vec<GvgId>,

    /// The SP taking over.
    pub successor_sp_id: SpId,

    /// Approval envelope signature granted by the successor; present only
    /// after the destination SP has signed the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_signature: Option<String>,
}

impl SwapOutMessage {
    /// Builds an unapproved family-level swap-out.
    pub fn family(storage_provider: impl Into<String>, family_id: FamilyId, successor: SpId) -> Self {
        Self {
            storage_provider: storage_provider.into(),
            family_id,
            gvg_ids: Vec::new(),
            successor_sp_id: successor,
            approval_signature: None,
        }
    }

    /// Builds an unapproved GVG-list swap-out.
    pub fn gvg_list(
        storage_provider: impl Into<String>,
        gvg_ids: Vec<GvgId>,
        successor: SpId,
    ) -> Self {
        Self {
            storage_provider: storage_provider.into(),
            family_id: FamilyId::STANDALONE,
            gvg_ids,
            successor_sp_id: successor,
            approval_signature: None,
        }
    }

    /// Canonical deduplication key of this message.
    pub fn swap_out_key(&self) -> String {
        swap_out_key(self.family_id, &self.gvg_ids)
    }

    /// Returns true for the family-level form.
    pub fn is_family(&self) -> bool {
        !self.family_id.is_standalone()
    }
}

/// Transaction completing a swap-out on the destination side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteSwapOutMessage {
    /// Operator address of the destination SP submitting the completion.
    pub storage_provider: String,
    pub family_id: FamilyId,
    pub gvg_ids: Vec<GvgId>,
}

/// Transaction finalizing a storage-provider exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteSpExitMessage {
    /// Operator address of the exiting SP.
    pub storage_provider: String,
}

// ============================================================================
// Chain events
// ============================================================================

/// Event recording the start of a storage-provider exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpExit {
    pub storage_provider: String,
}

/// Event recording the finalization of a storage-provider exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCompleteSpExit {
    pub storage_provider: String,
}

/// Exit events observed for one operator address at one block height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpExitEvents {
    pub event: Option<EventSpExit>,
    pub complete_event: Option<EventCompleteSpExit>,
}

/// Event recording the completion of a swap-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCompleteSwapOut {
    /// Operator address of the SP that was swapped out.
    pub storage_provider: String,
    pub family_id: FamilyId,
    pub gvg_ids: Vec<GvgId>,
    pub successor_sp_id: SpId,
}

impl EventCompleteSwapOut {
    /// Canonical deduplication key of the swap-out this event completes.
    pub fn swap_out_key(&self) -> String {
        swap_out_key(self.family_id, &self.gvg_ids)
    }
}

/// A swap-out event observed for one SP at one block height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOutEvent {
    pub complete_event: Option<EventCompleteSwapOut>,
}

// ============================================================================
// Migration progress
// ============================================================================

/// Lifecycle of a per-group migration unit on the destination SP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrateStatus {
    /// Queued but not yet dispatched to the executor.
    WaitForMigrate,
    /// Dispatched; the executor is moving pieces.
    Migrating,
    /// Every object in the group has been migrated.
    Migrated,
}

impl Display for MigrateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrateStatus::WaitForMigrate => "wait_for_migrate",
            MigrateStatus::Migrating => "migrating",
            MigrateStatus::Migrated => "migrated",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_key_uses_family_prefix() {
        let key = swap_out_key(FamilyId::new(7), &[]);
        assert_eq!(key, "familyID-7");
    }

    #[test]
    fn gvg_list_key_joins_ids_in_list_order() {
        let key = swap_out_key(
            FamilyId::STANDALONE,
            &[GvgId::new(3), GvgId::new(1), GvgId::new(2)],
        );
        assert_eq!(key, "gvgIDList-3,1,2");
    }

    #[test]
    fn key_forms_never_collide() {
        let family = swap_out_key(FamilyId::new(1), &[]);
        let list = swap_out_key(FamilyId::STANDALONE, &[GvgId::new(1)]);
        assert_ne!(family, list);
        assert!(family.starts_with(SWAP_OUT_FAMILY_KEY_PREFIX));
        assert!(list.starts_with(SWAP_OUT_GVG_LIST_KEY_PREFIX));
    }

    #[test]
    fn message_and_event_derive_the_same_key() {
        let msg = SwapOutMessage::family("0xsrc", FamilyId::new(4), SpId::new(9));
        let event = EventCompleteSwapOut {
            storage_provider: "0xsrc".to_string(),
            family_id: FamilyId::new(4),
            gvg_ids: Vec::new(),
            successor_sp_id: SpId::new(9),
        };
        assert_eq!(msg.swap_out_key(), event.swap_out_key());
    }

    #[test]
    fn secondary_index_is_position_in_list() {
        let gvg = GlobalVirtualGroup {
            id: GvgId::new(1),
            family_id: FamilyId::new(1),
            primary_sp_id: SpId::new(1),
            secondary_sp_ids: vec![SpId::new(2), SpId::new(3), SpId::new(4)],
        };
        assert_eq!(gvg.secondary_index(SpId::new(2)), Some(0));
        assert_eq!(gvg.secondary_index(SpId::new(4)), Some(2));
        assert_eq!(gvg.secondary_index(SpId::new(9)), None);
    }

    #[test]
    fn migrate_key_carries_all_three_parts() {
        let key = make_gvg_migrate_key(GvgId::new(5), FamilyId::new(2), -1);
        assert_eq!(key, "gvg-5-vgf-2-ridx--1");
    }
}
