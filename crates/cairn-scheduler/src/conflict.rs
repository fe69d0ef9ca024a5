//! Family conflict detection and resolution.
//!
//! A family hand-off in one shot fails iff every viable primary successor
//! is already a secondary in at least one of the family's groups. Swapping
//! the least-represented secondary out of its groups restores the
//! possibility of a clean hand-off while touching the fewest groups.

use std::collections::BTreeMap;

use tracing::info;

use cairn_store::ExitStore;
use cairn_types::{GlobalVirtualGroup, SpId, SwapOutMessage, VirtualGroupFamily};

use crate::chain::ChainClient;
use crate::context::ExitContext;
use crate::error::{Error, Result};
use crate::executor::TaskQueue;
use crate::peer::PeerSpClient;
use crate::picker::{PickDestSpFilter, VirtualGroupManager};
use crate::plan::{approve_and_send_if_new, SrcSwapOutUnit};

/// Histogram of secondary occurrences across a family's groups.
pub(crate) fn secondary_multiplicity(gvgs: &[GlobalVirtualGroup]) -> BTreeMap<SpId, usize> {
    let mut histogram = BTreeMap::new();
    for gvg in gvgs {
        for sp_id in &gvg.secondary_sp_ids {
            *histogram.entry(*sp_id).or_insert(0) += 1;
        }
    }
    histogram
}

/// The secondary bound to the fewest groups; ties break toward the
/// smallest SP ID so the choice is independent of map iteration order.
pub(crate) fn least_multiplicity_secondary(histogram: &BTreeMap<SpId, usize>) -> Option<SpId> {
    histogram
        .iter()
        .min_by_key(|(sp_id, count)| (**count, **sp_id))
        .map(|(sp_id, _)| *sp_id)
}

/// Decides whether a family can be handed off cleanly and emits the
/// swap-out units that either perform the hand-off or break the conflict.
pub struct FamilyConflictChecker<'a, C, P, S, V, Q>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
    V: VirtualGroupManager,
    Q: TaskQueue,
{
    ctx: &'a ExitContext<C, P, S, V, Q>,
    vgf: &'a VirtualGroupFamily,
}

impl<'a, C, P, S, V, Q> FamilyConflictChecker<'a, C, P, S, V, Q>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
    V: VirtualGroupManager,
    Q: TaskQueue,
{
    pub fn new(ctx: &'a ExitContext<C, P, S, V, Q>, vgf: &'a VirtualGroupFamily) -> Self {
        Self { ctx, vgf }
    }

    /// Generates the family's swap-out units.
    ///
    /// A clean hand-off yields a single family-level unit. A conflicted
    /// family yields one GVG-level unit per group the chosen secondary
    /// must vacate; the family-level unit is synthesized later, once those
    /// complete.
    pub async fn generate_swap_out_units(
        &self,
        build_meta_by_db: bool,
    ) -> Result<Vec<SrcSwapOutUnit>> {
        let family_gvgs = self
            .ctx
            .chain
            .list_global_virtual_groups_by_family_id(self.vgf.id)
            .await?;
        if family_gvgs.is_empty() {
            return Ok(Vec::new());
        }

        let histogram = secondary_multiplicity(&family_gvgs);
        let family_filter =
            PickDestSpFilter::from_multiplicity_map(&histogram).also_exclude(self.ctx.self_sp.id);

        let dest_family_sp = match self.ctx.vg_manager.pick_sp_by_filter(&family_filter) {
            Ok(sp) => sp,
            Err(Error::NoEligibleSp) => {
                return self.resolve_conflict(&family_gvgs, &histogram, build_meta_by_db).await;
            }
            Err(error) => return Err(error),
        };

        let msg = SwapOutMessage::family(
            self.ctx.self_sp.operator_address.clone(),
            self.vgf.id,
            dest_family_sp.id,
        );
        let approved = approve_and_send_if_new(
            &self.ctx.chain,
            &self.ctx.peer,
            &self.ctx.store,
            &dest_family_sp,
            msg,
            build_meta_by_db,
        )
        .await?;

        Ok(vec![SrcSwapOutUnit {
            is_family: true,
            is_conflicted: false,
            conflicted_family_id: None,
            is_secondary: false,
            swap_out_msg: approved,
        }])
    }

    /// Emits one GVG-level unit per group the least-represented secondary
    /// occupies, freeing it to become the family successor later.
    async fn resolve_conflict(
        &self,
        family_gvgs: &[GlobalVirtualGroup],
        histogram: &BTreeMap<SpId, usize>,
        build_meta_by_db: bool,
    ) -> Result<Vec<SrcSwapOutUnit>> {
        let Some(chosen) = least_multiplicity_secondary(histogram) else {
            // no secondaries to vacate, so the conflict cannot be broken
            return Err(Error::NoEligibleSp);
        };
        info!(
            family_id = %self.vgf.id,
            conflicted_sp_id = %chosen,
            "family swap out has conflicts, vacating least bound secondary"
        );

        let mut swap_out_units = Vec::new();
        for gvg in family_gvgs {
            if gvg.secondary_index(chosen).is_none() {
                continue;
            }
            let filter = PickDestSpFilter::from_slice(&gvg.secondary_sp_ids)
                .also_exclude(gvg.primary_sp_id);
            let dest_secondary_sp = self.ctx.vg_manager.pick_sp_by_filter(&filter)?;

            let msg = SwapOutMessage::gvg_list(
                self.ctx.self_sp.operator_address.clone(),
                vec![gvg.id],
                dest_secondary_sp.id,
            );
            let approved = approve_and_send_if_new(
                &self.ctx.chain,
                &self.ctx.peer,
                &self.ctx.store,
                &dest_secondary_sp,
                msg,
                build_meta_by_db,
            )
            .await?;

            swap_out_units.push(SrcSwapOutUnit {
                is_family: false,
                is_conflicted: true,
                conflicted_family_id: Some(self.vgf.id),
                is_secondary: true,
                swap_out_msg: approved,
            });
        }
        Ok(swap_out_units)
    }
}
