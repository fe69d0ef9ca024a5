//! Destination-SP task runner.
//!
//! Receives swap-out notifications from source SPs, enumerates the groups
//! each one covers, feeds per-group migration tasks to the executor one at
//! a time, and submits the swap-out completion transaction once every
//! covered group has been migrated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use cairn_store::{ExitStore, MigrateGvgMeta, SwapOutMeta};
use cairn_types::{
    make_gvg_migrate_key, CompleteSwapOutMessage, GlobalVirtualGroup, GvgId, MigrateStatus, SpId,
    StorageProvider, SwapOutMessage,
};

use crate::chain::ChainClient;
use crate::context::ExitContext;
use crate::error::{Error, Result};
use crate::executor::{MigrateGvgTask, TaskQueue};
use crate::peer::PeerSpClient;
use crate::picker::VirtualGroupManager;

/// Dispatch loop tick; one task is pushed per tick as flow control.
const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Back-off after a failed push or status persist.
const DISPATCH_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Redundancy index of `src_sp_id` when migrating out of `gvg`: −1 for a
/// family-bound group (primary relocation), otherwise its secondary
/// position.
pub(crate) fn migrate_redundancy_index(
    gvg: &GlobalVirtualGroup,
    src_sp_id: SpId,
) -> Result<i32> {
    if gvg.family_id.is_standalone() {
        gvg.secondary_index(src_sp_id)
            .map(|index| index as i32)
            .ok_or(Error::SecondaryNotFound {
                gvg_id: gvg.id,
                sp_id: src_sp_id,
            })
    } else {
        Ok(-1)
    }
}

/// A per-group migration unit tracked by the destination SP.
#[derive(Debug, Clone)]
pub struct MigrateGvgUnit {
    pub src_gvg: GlobalVirtualGroup,
    pub redundancy_index: i32,
    pub swap_out_key: String,
    pub src_sp: StorageProvider,
    pub dest_sp_id: SpId,
    pub last_migrated_object_id: u64,
    pub migrate_status: MigrateStatus,
}

impl MigrateGvgUnit {
    /// Canonical key: `(gvg, family, redundancy index)`.
    pub fn key(&self) -> String {
        make_gvg_migrate_key(self.src_gvg.id, self.src_gvg.family_id, self.redundancy_index)
    }
}

struct CompletionState {
    completed_gvg: HashSet<GvgId>,
    complete_tx_sent: bool,
}

/// A destination-side swap-out unit with its completion accounting.
///
/// The per-unit mutex serializes completion bookkeeping and the
/// `CompleteSwapOut` submission, so the transaction goes out exactly once.
pub struct DestSwapOutUnit {
    swap_out_msg: SwapOutMessage,
    completion: Mutex<CompletionState>,
}

impl DestSwapOutUnit {
    fn new(swap_out_msg: SwapOutMessage) -> Self {
        Self::from_parts(swap_out_msg, HashSet::new())
    }

    fn from_parts(swap_out_msg: SwapOutMessage, completed_gvg: HashSet<GvgId>) -> Self {
        Self {
            swap_out_msg,
            completion: Mutex::new(CompletionState {
                completed_gvg,
                complete_tx_sent: false,
            }),
        }
    }
}

/// Snapshot row of a destination-side group task for the query surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GvgTaskStatus {
    pub src_gvg_id: GvgId,
    pub last_migrated_object_id: u64,
    pub status: MigrateStatus,
}

/// Snapshot row of a destination-side swap-out for the query surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestSwapOutStatus {
    pub swap_out_key: String,
    pub successor_sp_id: SpId,
    pub gvg_tasks: Vec<GvgTaskStatus>,
}

struct RunnerState {
    gvg_units: Vec<MigrateGvgUnit>,
    key_index_map: HashMap<String, usize>,
    swap_out_units: HashMap<String, Arc<DestSwapOutUnit>>,
}

/// Migration progress and swap-out completion on the destination SP.
pub struct DestSpTaskRunner<C, P, S, V, Q>
where
    C: ChainClient,
    P: PeerSpClient,
    S: ExitStore,
    V: VirtualGroupManager,
    Q: TaskQueue,
{
    ctx: Arc<ExitContext<C, P, S, V, Q>>,
    state: RwLock<RunnerState>,
}

impl<C, P, S, V, Q> DestSpTaskRunner<C, P, S, V, Q>
where
    C: ChainClient + 'static,
    P: PeerSpClient + 'static,
    S: ExitStore + 'static,
    V: VirtualGroupManager + 'static,
    Q: TaskQueue + 'static,
{
    pub(crate) fn new(ctx: Arc<ExitContext<C, P, S, V, Q>>) -> Self {
        Self {
            ctx,
            state: RwLock::new(RunnerState {
                gvg_units: Vec::new(),
                key_index_map: HashMap::new(),
                swap_out_units: HashMap::new(),
            }),
        }
    }

    /// Rebuilds swap-out and migration state from the store at startup.
    ///
    /// Units that had been dispatched before the crash are re-queued as
    /// `WaitForMigrate`; the executor resumes them from the persisted
    /// last-migrated object ID.
    pub(crate) async fn load_from_db(&self) -> Result<()> {
        let rows = self.ctx.store.list_dest_sp_swap_out_units()?;
        let mut state = self.state.write().await;

        for row in rows {
            let completed: HashSet<GvgId> = row.completed_gvg_ids.iter().copied().collect();
            let src_sp = self
                .ctx
                .chain
                .query_sp(&row.swap_out_msg.storage_provider)
                .await?;

            let gvg_list = if row.swap_out_msg.is_family() {
                self.ctx
                    .chain
                    .list_global_virtual_groups_by_family_id(row.swap_out_msg.family_id)
                    .await?
            } else {
                let mut list = Vec::new();
                for gvg_id in &row.swap_out_msg.gvg_ids {
                    if !completed.contains(gvg_id) {
                        list.push(self.ctx.chain.query_global_virtual_group(*gvg_id).await?);
                    }
                }
                list
            };

            for gvg in gvg_list {
                if completed.contains(&gvg.id) {
                    continue;
                }
                let redundancy_index = migrate_redundancy_index(&gvg, src_sp.id)?;
                let migrate_key = make_gvg_migrate_key(gvg.id, gvg.family_id, redundancy_index);
                let meta = self.ctx.store.query_migrate_gvg_unit(&migrate_key)?;

                let unit = MigrateGvgUnit {
                    src_gvg: gvg,
                    redundancy_index: meta.redundancy_index,
                    swap_out_key: meta.swap_out_key.clone(),
                    src_sp: src_sp.clone(),
                    dest_sp_id: self.ctx.self_sp.id,
                    last_migrated_object_id: meta.last_migrated_object_id,
                    migrate_status: MigrateStatus::WaitForMigrate,
                };
                let index = state.gvg_units.len();
                state.key_index_map.insert(unit.key(), index);
                state.gvg_units.push(unit);
            }

            state.swap_out_units.insert(
                row.swap_out_key.clone(),
                Arc::new(DestSwapOutUnit::from_parts(row.swap_out_msg, completed)),
            );
        }
        info!("runner succeed to load from db");
        Ok(())
    }

    /// Spawns the dispatch worker.
    pub(crate) fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let runner = Arc::clone(self);
        tokio::spawn(runner.start_dest_sp_schedule(shutdown));
    }

    /// Idempotent insert of a swap-out unit; persisted with the
    /// destination role.
    pub async fn add_new_swap_out(&self, swap_out_msg: SwapOutMessage) -> Result<()> {
        let key = swap_out_msg.swap_out_key();
        {
            let mut state = self.state.write().await;
            if state.swap_out_units.contains_key(&key) {
                return Ok(());
            }
            state
                .swap_out_units
                .insert(key.clone(), Arc::new(DestSwapOutUnit::new(swap_out_msg.clone())));
        }

        self.ctx.store.insert_swap_out_unit(&SwapOutMeta {
            swap_out_key: key,
            is_dest_sp: true,
            swap_out_msg,
            completed_gvg_ids: Vec::new(),
            recorded_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Idempotent append of a migration unit; persisted as
    /// `WaitForMigrate`.
    pub async fn add_new_migrate_gvg_unit(&self, unit: MigrateGvgUnit) -> Result<()> {
        let key = unit.key();
        let meta = MigrateGvgMeta {
            migrate_key: key.clone(),
            swap_out_key: unit.swap_out_key.clone(),
            gvg_id: unit.src_gvg.id,
            family_id: unit.src_gvg.family_id,
            redundancy_index: unit.redundancy_index,
            src_sp_id: unit.src_sp.id,
            dest_sp_id: unit.dest_sp_id,
            last_migrated_object_id: unit.last_migrated_object_id,
            migrate_status: unit.migrate_status,
            recorded_at: Utc::now(),
        };
        {
            let mut state = self.state.write().await;
            if state.key_index_map.contains_key(&key) {
                return Ok(());
            }
            let index = state.gvg_units.len();
            state.key_index_map.insert(key, index);
            state.gvg_units.push(unit);
        }

        self.ctx.store.insert_migrate_gvg_unit(&meta)?;
        Ok(())
    }

    /// Records executor progress for a unit; persisted so a restarted
    /// migration resumes where it left off.
    pub async fn update_migrate_gvg_last_migrated_object_id(
        &self,
        migrate_key: &str,
        last_migrated_object_id: u64,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let index = *state
                .key_index_map
                .get(migrate_key)
                .ok_or_else(|| Error::MigrateUnitNotFound(migrate_key.to_string()))?;
            state.gvg_units[index].last_migrated_object_id = last_migrated_object_id;
        }
        self.ctx
            .store
            .update_migrate_gvg_unit_last_migrate_object_id(migrate_key, last_migrated_object_id)?;
        Ok(())
    }

    /// Updates a unit's status. A transition to `Migrated` also runs the
    /// owning swap-out's completion check.
    pub async fn update_migrate_gvg_status(
        &self,
        migrate_key: &str,
        status: MigrateStatus,
    ) -> Result<()> {
        let (gvg_id, swap_out_key, swap_out_unit) = {
            let mut state = self.state.write().await;
            let index = *state
                .key_index_map
                .get(migrate_key)
                .ok_or_else(|| Error::MigrateUnitNotFound(migrate_key.to_string()))?;
            let unit = &mut state.gvg_units[index];
            unit.migrate_status = status;
            let gvg_id = unit.src_gvg.id;
            let swap_out_key = unit.swap_out_key.clone();
            let swap_out_unit = state.swap_out_units.get(&swap_out_key).cloned();
            (gvg_id, swap_out_key, swap_out_unit)
        };

        if status == MigrateStatus::Migrated {
            if let Some(swap_out_unit) = swap_out_unit {
                self.check_and_send_complete_swap_out_tx(gvg_id, &swap_out_key, &swap_out_unit)
                    .await?;
            }
        }

        self.ctx
            .store
            .update_migrate_gvg_unit_status(migrate_key, status)?;
        Ok(())
    }

    /// Accounts a migrated group and, once the swap-out covers nothing
    /// more, submits `CompleteSwapOut`.
    ///
    /// Family coverage is re-listed from chain at the current height so
    /// membership changes during migration are tolerated.
    async fn check_and_send_complete_swap_out_tx(
        &self,
        gvg_id: GvgId,
        swap_out_key: &str,
        unit: &DestSwapOutUnit,
    ) -> Result<()> {
        let mut completion = unit.completion.lock().await;
        completion.completed_gvg.insert(gvg_id);

        let mut completed: Vec<GvgId> = completion.completed_gvg.iter().copied().collect();
        completed.sort_unstable();
        self.ctx
            .store
            .update_swap_out_unit_completed_gvg_list(swap_out_key, &completed)?;

        let needed: Vec<GvgId> = if unit.swap_out_msg.is_family() {
            self.ctx
                .chain
                .list_global_virtual_groups_by_family_id(unit.swap_out_msg.family_id)
                .await?
                .iter()
                .map(|gvg| gvg.id)
                .collect()
        } else {
            unit.swap_out_msg.gvg_ids.clone()
        };

        for needed_gvg_id in &needed {
            if !completion.completed_gvg.contains(needed_gvg_id) {
                info!(
                    swap_out_key,
                    not_completed_gvg = %needed_gvg_id,
                    "swap out gvgs are not all completed"
                );
                return Ok(());
            }
        }

        if completion.complete_tx_sent {
            return Ok(());
        }
        let msg = CompleteSwapOutMessage {
            storage_provider: self.ctx.self_sp.operator_address.clone(),
            family_id: unit.swap_out_msg.family_id,
            gvg_ids: unit.swap_out_msg.gvg_ids.clone(),
        };
        let tx_hash = self.ctx.chain.complete_swap_out(&msg).await?;
        completion.complete_tx_sent = true;
        info!(swap_out_key, %tx_hash, "send complete swap out tx");
        Ok(())
    }

    /// Pushes the oldest `WaitForMigrate` unit to the executor, returning
    /// its key. The status only flips to `Migrating` after both the push
    /// and the persist succeed, so a failure leaves the unit eligible for
    /// the next attempt.
    pub(crate) async fn dispatch_one(&self) -> Result<Option<String>> {
        let candidate = {
            let state = self.state.read().await;
            state
                .gvg_units
                .iter()
                .find(|unit| unit.migrate_status == MigrateStatus::WaitForMigrate)
                .map(|unit| {
                    (
                        unit.key(),
                        MigrateGvgTask {
                            src_gvg: unit.src_gvg.clone(),
                            redundancy_index: unit.redundancy_index,
                            src_sp: unit.src_sp.clone(),
                            last_migrated_object_id: unit.last_migrated_object_id,
                        },
                    )
                })
        };
        let Some((key, task)) = candidate else {
            return Ok(None);
        };

        self.ctx.task_queue.push(task)?;
        self.ctx
            .store
            .update_migrate_gvg_unit_status(&key, MigrateStatus::Migrating)?;

        let mut state = self.state.write().await;
        if let Some(&index) = state.key_index_map.get(&key) {
            state.gvg_units[index].migrate_status = MigrateStatus::Migrating;
        }
        Ok(Some(key))
    }

    async fn start_dest_sp_schedule(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            match self.dispatch_one().await {
                Ok(Some(migrate_key)) => {
                    info!(%migrate_key, "succeed to push migrate gvg task into task executor");
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "failed to dispatch migrate gvg task");
                    tokio::time::sleep(DISPATCH_RETRY_BACKOFF).await;
                }
            }
        }
    }

    pub(crate) async fn list_status(&self) -> Vec<DestSwapOutStatus> {
        let state = self.state.read().await;

        let mut tasks_by_key: HashMap<String, Vec<GvgTaskStatus>> = HashMap::new();
        for unit in &state.gvg_units {
            tasks_by_key
                .entry(unit.swap_out_key.clone())
                .or_default()
                .push(GvgTaskStatus {
                    src_gvg_id: unit.src_gvg.id,
                    last_migrated_object_id: unit.last_migrated_object_id,
                    status: unit.migrate_status,
                });
        }

        state
            .swap_out_units
            .iter()
            .map(|(key, unit)| DestSwapOutStatus {
                swap_out_key: key.clone(),
                successor_sp_id: unit.swap_out_msg.successor_sp_id,
                gvg_tasks: tasks_by_key.remove(key).unwrap_or_default(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn gvg_unit_count(&self) -> usize {
        self.state.read().await.gvg_units.len()
    }

    #[cfg(test)]
    pub(crate) async fn swap_out_unit_count(&self) -> usize {
        self.state.read().await.swap_out_units.len()
    }

    #[cfg(test)]
    pub(crate) async fn gvg_unit(&self, migrate_key: &str) -> Option<MigrateGvgUnit> {
        let state = self.state.read().await;
        let index = *state.key_index_map.get(migrate_key)?;
        state.gvg_units.get(index).cloned()
    }
}
