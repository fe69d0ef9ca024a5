//! Source-SP swap-out plan.
//!
//! The plan owns every swap-out unit of the exiting SP: family hand-offs,
//! conflict-resolution units, and secondary-role departures. It keeps the
//! destination SPs notified, reacts to completion events, and submits the
//! final exit transaction once every unit (and every family unit
//! synthesized from a resolved conflict) has completed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::info;

use cairn_store::{ExitStore, SwapOutMeta};
use cairn_types::{
    swap_out_key, CompleteSpExitMessage, EventCompleteSwapOut, FamilyId, MigrateStatus, SpId,
    StorageProvider, SwapOutMessage,
};

use crate::chain::ChainClient;
use crate::conflict::secondary_multiplicity;
use crate::context::ExitContext;
use crate::error::{Error, Result};
use crate::executor::TaskQueue;
use crate::peer::PeerSpClient;
use crate::picker::{PickDestSpFilter, VirtualGroupManager};

/// How often uncompleted swap-outs are re-announced to their destinations.
const NOTIFY_DEST_SP_INTERVAL: Duration = Duration::from_secs(10);

/// A source-side swap-out unit.
#[derive(Debug, Clone)]
pub struct SrcSwapOutUnit {
    /// True for a family-level hand-off.
    pub is_family: bool,

    /// True for a unit emitted to break a family conflict.
    pub is_conflicted: bool,

    /// The family whose hand-off is blocked, set on conflict units.
    pub conflicted_family_id: Option<FamilyId>,

    /// True when the unit migrates a secondary role.
    pub is_secondary: bool,

    pub swap_out_msg: SwapOutMessage,
}

/// Snapshot row of a source-side unit for the query surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcSwapOutStatus {
    pub swap_out_key: String,
    pub successor_sp_id: SpId,
    pub status: MigrateStatus,
}

struct PlanUnits {
    units: HashMap<String, SrcSwapOutUnit>,
    completed: HashSet<String>,
}

/// Execution state of the exiting SP's swap-outs.
pub struct SrcSpSwapOutPlan<C, P, S, V, Q>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
    V: VirtualGroupManager,
    Q: TaskQueue,
{
    ctx: Arc<ExitContext<C, P, S, V, Q>>,
    units: RwLock<PlanUnits>,
}

impl<C, P, S, V, Q> SrcSpSwapOutPlan<C, P, S, V, Q>
where
    C: ChainClient + 'static,
    P: PeerSpClient + 'static,
    S: ExitStore + 'static,
    V: VirtualGroupManager + 'static,
    Q: TaskQueue + 'static,
{
    pub(crate) fn with_units(
        ctx: Arc<ExitContext<C, P, S, V, Q>>,
        units: HashMap<String, SrcSwapOutUnit>,
    ) -> Self {
        Self {
            ctx,
            units: RwLock::new(PlanUnits {
                units,
                completed: HashSet::new(),
            }),
        }
    }

    /// Persists every unit of the plan. Re-inserting an existing key is a
    /// no-op in the store, so rebuilding after a restart is safe.
    pub(crate) async fn store_to_db(&self) -> Result<()> {
        let units = self.units.read().await;
        for (key, unit) in &units.units {
            self.ctx.store.insert_swap_out_unit(&SwapOutMeta {
                swap_out_key: key.clone(),
                is_dest_sp: false,
                swap_out_msg: unit.swap_out_msg.clone(),
                completed_gvg_ids: Vec::new(),
                recorded_at: Utc::now(),
            })?;
        }
        info!("succeed to store swap out plan to db");
        Ok(())
    }

    /// Spawns the notification worker.
    pub(crate) fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let plan = Arc::clone(self);
        tokio::spawn(plan.notify_dest_sp_swap_out(shutdown));
    }

    /// Marks the unit named by `event` completed, re-attempts a blocked
    /// family hand-off when the unit was a conflict unit, and submits the
    /// final exit transaction once everything has completed.
    ///
    /// The plan lock is held across the chain submissions on purpose: no
    /// other worker may mutate the plan while completion is accounted.
    pub async fn check_and_send_complete_sp_exit_tx(
        &self,
        event: &EventCompleteSwapOut,
    ) -> Result<()> {
        let key = event.swap_out_key();
        let mut units = self.units.write().await;

        let conflicted_family_id = match units.units.get(&key) {
            None => return Err(Error::SwapOutNotFound(key)),
            Some(unit) if unit.is_conflicted => unit.conflicted_family_id,
            Some(_) => None,
        };

        if let Some(family_id) = conflicted_family_id {
            self.recheck_conflict_and_add_family_swap_out(&mut units, family_id)
                .await?;
        }

        units.completed.insert(key);
        self.check_all_completed_and_send_complete_sp_exit_tx(&units)
            .await
    }

    /// Re-attempts the family-level hand-off after a conflict unit
    /// completed. Still-conflicted families are left alone; a later
    /// completion event will retry.
    async fn recheck_conflict_and_add_family_swap_out(
        &self,
        units: &mut PlanUnits,
        conflicted_family_id: FamilyId,
    ) -> Result<()> {
        let family_gvgs = self
            .ctx
            .chain
            .list_global_virtual_groups_by_family_id(conflicted_family_id)
            .await?;
        let histogram = secondary_multiplicity(&family_gvgs);

        let filter =
            PickDestSpFilter::from_multiplicity_map(&histogram).also_exclude(self.ctx.self_sp.id);
        let dest_family_sp = match self.ctx.vg_manager.pick_sp_by_filter(&filter) {
            Ok(sp) => sp,
            Err(Error::NoEligibleSp) => {
                info!(
                    family_id = %conflicted_family_id,
                    "family swap out still has conflicts"
                );
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let msg = SwapOutMessage::family(
            self.ctx.self_sp.operator_address.clone(),
            conflicted_family_id,
            dest_family_sp.id,
        );
        let approved =
            get_swap_out_approval_and_send_tx(&self.ctx.chain, &self.ctx.peer, &dest_family_sp, msg)
                .await?;

        let key = approved.swap_out_key();
        self.ctx.store.insert_swap_out_unit(&SwapOutMeta {
            swap_out_key: key.clone(),
            is_dest_sp: false,
            swap_out_msg: approved.clone(),
            completed_gvg_ids: Vec::new(),
            recorded_at: Utc::now(),
        })?;
        units.units.insert(
            key,
            SrcSwapOutUnit {
                is_family: true,
                is_conflicted: false,
                conflicted_family_id: None,
                is_secondary: false,
                swap_out_msg: approved,
            },
        );
        Ok(())
    }

    async fn check_all_completed_and_send_complete_sp_exit_tx(
        &self,
        units: &PlanUnits,
    ) -> Result<()> {
        for (key, unit) in &units.units {
            if !units.completed.contains(key) {
                info!(not_completed_swap_out = %key, "swap out list are not all completed");
                return Ok(());
            }
            if unit.is_conflicted {
                if let Some(family_id) = unit.conflicted_family_id {
                    let family_key = swap_out_key(family_id, &[]);
                    if !units.completed.contains(&family_key) {
                        info!(
                            not_completed_swap_out = %family_key,
                            "swap out list are not all completed"
                        );
                        return Ok(());
                    }
                }
            }
        }

        let msg = CompleteSpExitMessage {
            storage_provider: self.ctx.self_sp.operator_address.clone(),
        };
        let tx_hash = self.ctx.chain.complete_sp_exit(&msg).await?;
        info!(%tx_hash, "send complete sp exit tx");
        Ok(())
    }

    /// Messages of every unit that has not completed yet.
    pub(crate) async fn snapshot_uncompleted(&self) -> Vec<SwapOutMessage> {
        let units = self.units.read().await;
        units
            .units
            .iter()
            .filter(|(key, _)| !units.completed.contains(*key))
            .map(|(_, unit)| unit.swap_out_msg.clone())
            .collect()
    }

    pub(crate) async fn list_status(&self) -> Vec<SrcSwapOutStatus> {
        let units = self.units.read().await;
        units
            .units
            .iter()
            .map(|(key, unit)| SrcSwapOutStatus {
                swap_out_key: key.clone(),
                successor_sp_id: unit.swap_out_msg.successor_sp_id,
                status: if units.completed.contains(key) {
                    MigrateStatus::Migrated
                } else {
                    MigrateStatus::Migrating
                },
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn unit(&self, key: &str) -> Option<SrcSwapOutUnit> {
        self.units.read().await.units.get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn unit_count(&self) -> usize {
        self.units.read().await.units.len()
    }

    /// Re-announces every uncompleted swap-out to its destination SP each
    /// tick. Receivers are idempotent, so a lost notification is simply
    /// re-sent on the next pass.
    async fn notify_dest_sp_swap_out(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(NOTIFY_DEST_SP_INTERVAL);
        // interval fires immediately; the first announcement waits a full period
        ticker.tick().await;

        let mut notify_loop_number: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            notify_loop_number += 1;
            let mut notify_unit_number: u64 = 0;
            for msg in self.snapshot_uncompleted().await {
                notify_unit_number += 1;
                let dest_sp = match self.ctx.vg_manager.query_sp_by_id(msg.successor_sp_id) {
                    Ok(sp) => sp,
                    Err(error) => {
                        info!(%error, "failed to notify swap out due to query successor sp");
                        continue;
                    }
                };
                if let Err(error) = self
                    .ctx
                    .peer
                    .notify_dest_sp_migrate_swap_out(&dest_sp.endpoint, &msg)
                    .await
                {
                    info!(
                        dest_sp_endpoint = %dest_sp.endpoint,
                        %error,
                        "failed to notify dest sp swap out"
                    );
                }
            }
            info!(
                loop_number = notify_loop_number,
                notify_number = notify_unit_number,
                "notify swap out to dest sp"
            );
        }
    }
}

/// Obtains the destination SP's signed approval for `msg` and submits the
/// approved swap-out to chain, returning the approved message.
pub(crate) async fn get_swap_out_approval_and_send_tx<C, P>(
    chain: &C,
    peer: &P,
    dest_sp: &StorageProvider,
    msg: SwapOutMessage,
) -> Result<SwapOutMessage>
where
    C: ChainClient,
    P: PeerSpClient,
{
    let approved = peer.get_swap_out_approval(&dest_sp.endpoint, &msg).await?;
    chain.swap_out(&approved).await?;
    info!(
        dest_sp_endpoint = %dest_sp.endpoint,
        swap_out_key = %approved.swap_out_key(),
        "succeed to get approval and send swap out tx"
    );
    Ok(approved)
}

/// Approval + submission with the restart guard: when rebuilding from the
/// DB and a persisted row already names the same successor, the prior
/// submission is trusted and the stored message returned unchanged.
pub(crate) async fn approve_and_send_if_new<C, P, S>(
    chain: &C,
    peer: &P,
    store: &S,
    dest_sp: &StorageProvider,
    msg: SwapOutMessage,
    build_meta_by_db: bool,
) -> Result<SwapOutMessage>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
{
    if build_meta_by_db {
        if let Some(row) = store.query_swap_out_unit_in_src_sp(&msg.swap_out_key())? {
            if row.swap_out_msg.successor_sp_id == msg.successor_sp_id {
                info!(
                    swap_out_key = %msg.swap_out_key(),
                    "skip swap out tx resend, trusting persisted submission"
                );
                return Ok(row.swap_out_msg);
            }
        }
    }
    get_swap_out_approval_and_send_tx(chain, peer, dest_sp, msg).await
}
