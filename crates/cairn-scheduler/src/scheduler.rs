//! SP exit orchestration.
//!
//! The scheduler owns both sides of the exit workflow: the source-side
//! swap-out plan for this SP's own exit, and the destination-side task
//! runner absorbing other SPs' data. Two subscription workers poll the
//! chain for exit events and swap-out completion events; the completion
//! cursor is gated behind the exit cursor so a completion is never
//! processed before the exit event that caused it has been observed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use cairn_store::ExitStore;
use cairn_types::{
    make_gvg_migrate_key, CompleteSpExitMessage, CompleteSwapOutMessage, MigrateStatus, SpId,
    SwapOutMessage,
};

use crate::chain::ChainClient;
use crate::config::SchedulerConfig;
use crate::conflict::FamilyConflictChecker;
use crate::context::ExitContext;
use crate::error::Result;
use crate::executor::{MigrateProgressReport, TaskQueue};
use crate::peer::PeerSpClient;
use crate::picker::{PickDestSpFilter, VirtualGroupManager};
use crate::plan::{approve_and_send_if_new, SrcSpSwapOutPlan, SrcSwapOutStatus, SrcSwapOutUnit};
use crate::runner::{
    migrate_redundancy_index, DestSpTaskRunner, DestSwapOutStatus, MigrateGvgUnit,
};

/// Snapshot of every in-flight swap-out unit on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpExitPlanSnapshot {
    pub self_sp_id: SpId,
    pub swap_out_src: Vec<SrcSwapOutStatus>,
    pub swap_out_dest: Vec<DestSwapOutStatus>,
}

/// Stops every worker spawned by [`SpExitScheduler::start`].
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signals all workers to stop after their current pass.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Orchestrates the storage-provider exit workflow.
pub struct SpExitScheduler<C, P, S, V, Q>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
    V: VirtualGroupManager,
    Q: TaskQueue,
{
    ctx: Arc<ExitContext<C, P, S, V, Q>>,
    config: SchedulerConfig,

    last_subscribed_sp_exit_block_height: AtomicU64,
    last_subscribed_swap_out_block_height: AtomicU64,
    is_exiting: AtomicBool,
    is_exited: AtomicBool,

    swap_out_plan: RwLock<Option<Arc<SrcSpSwapOutPlan<C, P, S, V, Q>>>>,
    task_runner: Arc<DestSpTaskRunner<C, P, S, V, Q>>,
}

impl<C, P, S, V, Q> SpExitScheduler<C, P, S, V, Q>
where
    C: ChainClient + 'static,
    P: PeerSpClient + 'static,
    S: ExitStore + 'static,
    V: VirtualGroupManager + 'static,
    Q: TaskQueue + 'static,
{
    /// Builds the scheduler from persistent state.
    ///
    /// Queries the self-SP record, loads both subscription cursors,
    /// replays exit events at the cursor to restore the exiting/exited
    /// flags, rebuilds the source plan from the DB when an exit is in
    /// flight, and reconstitutes the destination runner.
    pub async fn new(
        config: SchedulerConfig,
        chain: C,
        peer: P,
        store: S,
        vg_manager: V,
        task_queue: Q,
    ) -> Result<Arc<Self>> {
        let self_sp = chain.query_sp(&config.operator_address).await?;
        let ctx = Arc::new(ExitContext {
            chain,
            peer,
            store,
            vg_manager,
            task_queue,
            self_sp,
        });

        let sp_exit_height = ctx.store.query_sp_exit_subscribe_progress()?;
        let swap_out_height = ctx.store.query_swap_out_subscribe_progress()?;

        let exit_events = ctx
            .chain
            .list_sp_exit_events(sp_exit_height, &ctx.self_sp.operator_address)
            .await?;
        let is_exiting = exit_events.event.is_some();
        let is_exited = exit_events.complete_event.is_some();

        let swap_out_plan = if is_exiting {
            Some(produce_swap_out_plan(&ctx, true).await?)
        } else {
            None
        };

        let task_runner = Arc::new(DestSpTaskRunner::new(Arc::clone(&ctx)));
        task_runner.load_from_db().await?;

        info!(
            is_exiting,
            is_exited,
            last_subscribed_sp_exit_block_height = sp_exit_height,
            last_subscribed_swap_out_block_height = swap_out_height,
            "succeed to init sp exit scheduler"
        );

        Ok(Arc::new(Self {
            ctx,
            config,
            last_subscribed_sp_exit_block_height: AtomicU64::new(sp_exit_height),
            last_subscribed_swap_out_block_height: AtomicU64::new(swap_out_height),
            is_exiting: AtomicBool::new(is_exiting),
            is_exited: AtomicBool::new(is_exited),
            swap_out_plan: RwLock::new(swap_out_plan),
            task_runner,
        }))
    }

    /// Launches the notification, dispatch, and subscription workers.
    pub async fn start(self: &Arc<Self>) -> ShutdownHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some(plan) = self.swap_out_plan.read().await.as_ref() {
            plan.start(shutdown_rx.clone());
        }
        self.task_runner.start(shutdown_rx.clone());
        tokio::spawn(Arc::clone(self).run_sp_exit_subscriber(shutdown_rx.clone()));
        tokio::spawn(Arc::clone(self).run_swap_out_subscriber(shutdown_rx));

        info!("succeed to start sp exit scheduler");
        ShutdownHandle { shutdown_tx }
    }

    pub fn is_exiting(&self) -> bool {
        self.is_exiting.load(Ordering::SeqCst)
    }

    pub fn is_exited(&self) -> bool {
        self.is_exited.load(Ordering::SeqCst)
    }

    /// Last block height processed by the SP-exit event loop.
    pub fn sp_exit_cursor(&self) -> u64 {
        self.last_subscribed_sp_exit_block_height.load(Ordering::SeqCst)
    }

    /// Last block height processed by the swap-out completion loop.
    pub fn swap_out_cursor(&self) -> u64 {
        self.last_subscribed_swap_out_block_height.load(Ordering::SeqCst)
    }

    /// Routes an executor progress report to the destination runner.
    pub async fn update_migrate_progress(&self, report: MigrateProgressReport) -> Result<()> {
        info!(
            gvg_id = %report.gvg_id,
            family_id = %report.family_id,
            redundancy_index = report.redundancy_index,
            finished = report.finished,
            "update migrate progress"
        );
        let migrate_key =
            make_gvg_migrate_key(report.gvg_id, report.family_id, report.redundancy_index);
        if report.finished {
            self.task_runner
                .update_migrate_gvg_status(&migrate_key, MigrateStatus::Migrated)
                .await
        } else {
            self.task_runner
                .update_migrate_gvg_last_migrated_object_id(
                    &migrate_key,
                    report.last_migrated_object_id,
                )
                .await
        }
    }

    /// Entry point for a swap-out pushed by a source SP.
    ///
    /// Enumerates the covered groups and registers one migration unit per
    /// group plus the owning swap-out unit, all idempotently. A family
    /// that covers nothing is completed on the spot.
    pub async fn add_swap_out_to_task_runner(&self, swap_out_msg: SwapOutMessage) -> Result<()> {
        let src_sp = self
            .ctx
            .chain
            .query_sp(&swap_out_msg.storage_provider)
            .await?;

        let gvg_list = if swap_out_msg.is_family() {
            let gvg_list = self
                .ctx
                .chain
                .list_global_virtual_groups_by_family_id(swap_out_msg.family_id)
                .await?;
            if gvg_list.is_empty() {
                let msg = CompleteSwapOutMessage {
                    storage_provider: self.ctx.self_sp.operator_address.clone(),
                    family_id: swap_out_msg.family_id,
                    gvg_ids: Vec::new(),
                };
                let tx_hash = self.ctx.chain.complete_swap_out(&msg).await?;
                info!(
                    family_id = %swap_out_msg.family_id,
                    %tx_hash,
                    "family is empty, send complete swap out tx"
                );
                return Ok(());
            }
            gvg_list
        } else {
            let mut list = Vec::new();
            for gvg_id in &swap_out_msg.gvg_ids {
                list.push(self.ctx.chain.query_global_virtual_group(*gvg_id).await?);
            }
            list
        };

        let swap_out_key = swap_out_msg.swap_out_key();
        for gvg in gvg_list {
            let redundancy_index = migrate_redundancy_index(&gvg, src_sp.id)?;
            let unit = MigrateGvgUnit {
                src_gvg: gvg,
                redundancy_index,
                swap_out_key: swap_out_key.clone(),
                src_sp: src_sp.clone(),
                dest_sp_id: self.ctx.self_sp.id,
                last_migrated_object_id: 0,
                migrate_status: MigrateStatus::WaitForMigrate,
            };
            self.task_runner.add_new_migrate_gvg_unit(unit).await?;
        }
        self.task_runner.add_new_swap_out(swap_out_msg).await
    }

    /// Snapshot of all in-flight units for the query surface.
    pub async fn list_sp_exit_plan(&self) -> SpExitPlanSnapshot {
        let swap_out_src = match self.swap_out_plan.read().await.as_ref() {
            Some(plan) => plan.list_status().await,
            None => Vec::new(),
        };
        let swap_out_dest = self.task_runner.list_status().await;
        SpExitPlanSnapshot {
            self_sp_id: self.ctx.self_sp.id,
            swap_out_src,
            swap_out_dest,
        }
    }

    /// One pass of the SP-exit event loop: fetch events at cursor+1 and
    /// advance the cursor unless the fetch or a plan construction failed.
    pub(crate) async fn tick_sp_exit(&self, shutdown: &watch::Receiver<bool>) {
        let next_height = self.sp_exit_cursor() + 1;
        let events = match self
            .ctx
            .chain
            .list_sp_exit_events(next_height, &self.ctx.self_sp.operator_address)
            .await
        {
            Ok(events) => events,
            Err(error) => {
                warn!(%error, block_height = next_height, "failed to subscribe sp exit event");
                return;
            }
        };

        if events.complete_event.is_some() {
            self.is_exited.store(true, Ordering::SeqCst);
            self.advance_sp_exit_cursor();
            return;
        }

        if events.event.is_some() && !self.is_exiting() && !self.is_exited() {
            let plan = match produce_swap_out_plan(&self.ctx, false).await {
                Ok(plan) => plan,
                Err(error) => {
                    warn!(%error, "failed to produce sp exit execute plan");
                    return;
                }
            };
            plan.start(shutdown.clone());
            *self.swap_out_plan.write().await = Some(plan);
            self.is_exiting.store(true, Ordering::SeqCst);
        }
        self.advance_sp_exit_cursor();
    }

    /// One pass of the swap-out completion loop.
    ///
    /// Gated behind the exit cursor: completion events carry state that
    /// depends on exit-event causality, so this cursor never overtakes
    /// the other. A failed dispatch holds the cursor back for the pass.
    pub(crate) async fn tick_swap_out(&self) {
        let swap_out_height = self.swap_out_cursor();
        if swap_out_height >= self.sp_exit_cursor() {
            return;
        }

        let events = match self
            .ctx
            .chain
            .list_swap_out_events(swap_out_height + 1, self.ctx.self_sp.id)
            .await
        {
            Ok(events) => events,
            Err(error) => {
                warn!(%error, block_height = swap_out_height + 1, "failed to subscribe swap out event");
                return;
            }
        };

        if self.is_exited() {
            self.advance_swap_out_cursor();
            return;
        }

        let mut dispatch_failed = false;
        for event in &events {
            let Some(complete_event) = &event.complete_event else {
                continue;
            };
            let plan = self.swap_out_plan.read().await.clone();
            match plan {
                Some(plan) => {
                    if let Err(error) =
                        plan.check_and_send_complete_sp_exit_tx(complete_event).await
                    {
                        warn!(
                            %error,
                            swap_out_key = %complete_event.swap_out_key(),
                            "failed to update sp exit execute plan"
                        );
                        dispatch_failed = true;
                    }
                }
                None => {
                    warn!(
                        swap_out_key = %complete_event.swap_out_key(),
                        "no swap out plan for completion event"
                    );
                    dispatch_failed = true;
                }
            }
        }
        if !dispatch_failed {
            self.advance_swap_out_cursor();
        }
    }

    fn advance_sp_exit_cursor(&self) {
        let next = self.sp_exit_cursor() + 1;
        if let Err(error) = self.ctx.store.update_sp_exit_subscribe_progress(next) {
            warn!(%error, "failed to update sp exit progress");
        }
        self.last_subscribed_sp_exit_block_height
            .store(next, Ordering::SeqCst);
        info!(last_subscribed_block_height = next, "sp exit subscribe progress");
    }

    fn advance_swap_out_cursor(&self) {
        let next = self.swap_out_cursor() + 1;
        if let Err(error) = self.ctx.store.update_swap_out_subscribe_progress(next) {
            warn!(%error, "failed to update swap out progress");
        }
        self.last_subscribed_swap_out_block_height
            .store(next, Ordering::SeqCst);
        info!(last_subscribed_block_height = next, "swap out subscribe progress");
    }

    async fn run_sp_exit_subscriber(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.subscribe_sp_exit_event_interval_ms,
        ));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.tick_sp_exit(&shutdown).await;
        }
    }

    async fn run_swap_out_subscriber(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.config.subscribe_swap_out_event_interval_ms,
        ));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.tick_swap_out().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn runner(&self) -> &Arc<DestSpTaskRunner<C, P, S, V, Q>> {
        &self.task_runner
    }

    #[cfg(test)]
    pub(crate) async fn plan(&self) -> Option<Arc<SrcSpSwapOutPlan<C, P, S, V, Q>>> {
        self.swap_out_plan.read().await.clone()
    }
}

/// Builds the source-side plan: one conflict-checked pass per owned
/// family, one GVG-level unit per secondary role, then persistence. An SP
/// that owns nothing submits the final exit transaction immediately.
pub(crate) async fn produce_swap_out_plan<C, P, S, V, Q>(
    ctx: &Arc<ExitContext<C, P, S, V, Q>>,
    build_meta_by_db: bool,
) -> Result<Arc<SrcSpSwapOutPlan<C, P, S, V, Q>>>
where
    C: ChainClient + 'static,
    P: PeerSpClient + 'static,
    S: ExitStore + 'static,
    V: VirtualGroupManager + 'static,
    Q: TaskQueue + 'static,
{
    let vgf_list = ctx
        .chain
        .list_virtual_group_families(ctx.self_sp.id)
        .await?;
    let mut units: HashMap<String, SrcSwapOutUnit> = HashMap::new();

    for vgf in &vgf_list {
        info!(family_id = %vgf.id, "list sp virtual group family");
        let checker = FamilyConflictChecker::new(ctx, vgf);
        for unit in checker.generate_swap_out_units(build_meta_by_db).await? {
            units.insert(unit.swap_out_msg.swap_out_key(), unit);
        }
    }

    let secondary_gvg_list = ctx
        .chain
        .list_global_virtual_groups_by_secondary_sp(ctx.self_sp.id)
        .await?;
    for gvg in &secondary_gvg_list {
        info!(gvg_id = %gvg.id, "list sp secondary gvg");
        let mut excluded = vec![gvg.primary_sp_id];
        excluded.extend_from_slice(&gvg.secondary_sp_ids);
        let dest_secondary_sp = ctx
            .vg_manager
            .pick_sp_by_filter(&PickDestSpFilter::from_slice(&excluded))?;

        let msg = SwapOutMessage::gvg_list(
            ctx.self_sp.operator_address.clone(),
            vec![gvg.id],
            dest_secondary_sp.id,
        );
        let approved = approve_and_send_if_new(
            &ctx.chain,
            &ctx.peer,
            &ctx.store,
            &dest_secondary_sp,
            msg,
            build_meta_by_db,
        )
        .await?;
        units.insert(
            approved.swap_out_key(),
            SrcSwapOutUnit {
                is_family: false,
                is_conflicted: false,
                conflicted_family_id: None,
                is_secondary: true,
                swap_out_msg: approved,
            },
        );
    }

    if units.is_empty() {
        let msg = CompleteSpExitMessage {
            storage_provider: ctx.self_sp.operator_address.clone(),
        };
        match ctx.chain.complete_sp_exit(&msg).await {
            Ok(tx_hash) => {
                info!(%tx_hash, "sp owns nothing, send complete sp exit tx directly");
            }
            Err(error) => {
                warn!(%error, "failed to send complete sp exit tx for empty plan");
            }
        }
    }

    let plan = Arc::new(SrcSpSwapOutPlan::with_units(Arc::clone(ctx), units));
    plan.store_to_db().await?;
    info!("succeed to produce swap out plan");
    Ok(plan)
}
