//! Persistence for the storage-provider exit workflow.
//!
//! The scheduler survives process restarts through four pieces of durable
//! state: the two event-subscription cursors, the swap-out unit table, and
//! the migrate-GVG unit table. [`ExitStore`] is the interface consumed by
//! the scheduler; [`FileExitStore`] keeps everything in a single TOML state
//! file under a data directory.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::{FamilyId, GvgId, MigrateStatus, SpId, SwapOutMessage};

mod error;

pub use error::{Result, StoreError};

/// A persisted swap-out unit.
///
/// At most one row exists per `(swap_out_key, is_dest_sp)` pair; the
/// source and destination roles of the same key never share a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapOutMeta {
    pub swap_out_key: String,

    /// True when this SP is the destination of the swap-out.
    pub is_dest_sp: bool,

    /// Groups already migrated; meaningful on the destination side only.
    pub completed_gvg_ids: Vec<GvgId>,

    /// When the row was first written.
    pub recorded_at: DateTime<Utc>,

    pub swap_out_msg: SwapOutMessage,
}

/// A persisted per-group migration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateGvgMeta {
    pub migrate_key: String,
    pub swap_out_key: String,
    pub gvg_id: GvgId,
    pub family_id: FamilyId,
    pub redundancy_index: i32,
    pub src_sp_id: SpId,
    pub dest_sp_id: SpId,
    pub last_migrated_object_id: u64,
    pub migrate_status: MigrateStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Durable state consumed by the exit scheduler.
///
/// Inserts are idempotent: re-inserting an existing key leaves the stored
/// row untouched and succeeds, so a crash between the in-memory insert and
/// the restart replay never surfaces a duplicate-key failure.
pub trait ExitStore: Send + Sync {
    /// Last block height processed by the SP-exit event loop.
    fn query_sp_exit_subscribe_progress(&self) -> Result<u64>;

    fn update_sp_exit_subscribe_progress(&self, height: u64) -> Result<()>;

    /// Last block height processed by the swap-out completion loop.
    fn query_swap_out_subscribe_progress(&self) -> Result<u64>;

    fn update_swap_out_subscribe_progress(&self, height: u64) -> Result<()>;

    fn insert_swap_out_unit(&self, meta: &SwapOutMeta) -> Result<()>;

    /// All destination-role swap-out rows.
    fn list_dest_sp_swap_out_units(&self) -> Result<Vec<SwapOutMeta>>;

    /// The source-role row for `swap_out_key`, if any.
    fn query_swap_out_unit_in_src_sp(&self, swap_out_key: &str) -> Result<Option<SwapOutMeta>>;

    /// Replaces the completed-GVG list of the destination-role row.
    fn update_swap_out_unit_completed_gvg_list(
        &self,
        swap_out_key: &str,
        completed_gvg_ids: &[GvgId],
    ) -> Result<()>;

    fn insert_migrate_gvg_unit(&self, meta: &MigrateGvgMeta) -> Result<()>;

    fn query_migrate_gvg_unit(&self, migrate_key: &str) -> Result<MigrateGvgMeta>;

    fn update_migrate_gvg_unit_status(&self, migrate_key: &str, status: MigrateStatus)
        -> Result<()>;

    fn update_migrate_gvg_unit_last_migrate_object_id(
        &self,
        migrate_key: &str,
        object_id: u64,
    ) -> Result<()>;
}

impl<T: ExitStore + ?Sized> ExitStore for std::sync::Arc<T> {
    fn query_sp_exit_subscribe_progress(&self) -> Result<u64> {
        (**self).query_sp_exit_subscribe_progress()
    }

    fn update_sp_exit_subscribe_progress(&self, height: u64) -> Result<()> {
        (**self).update_sp_exit_subscribe_progress(height)
    }

    fn query_swap_out_subscribe_progress(&self) -> Result<u64> {
        (**self).query_swap_out_subscribe_progress()
    }

    fn update_swap_out_subscribe_progress(&self, height: u64) -> Result<()> {
        (**self).update_swap_out_subscribe_progress(height)
    }

    fn insert_swap_out_unit(&self, meta: &SwapOutMeta) -> Result<()> {
        (**self).insert_swap_out_unit(meta)
    }

    fn list_dest_sp_swap_out_units(&self) -> Result<Vec<SwapOutMeta>> {
        (**self).list_dest_sp_swap_out_units()
    }

    fn query_swap_out_unit_in_src_sp(&self, swap_out_key: &str) -> Result<Option<SwapOutMeta>> {
        (**self).query_swap_out_unit_in_src_sp(swap_out_key)
    }

    fn update_swap_out_unit_completed_gvg_list(
        &self,
        swap_out_key: &str,
        completed_gvg_ids: &[GvgId],
    ) -> Result<()> {
        (**self).update_swap_out_unit_completed_gvg_list(swap_out_key, completed_gvg_ids)
    }

    fn insert_migrate_gvg_unit(&self, meta: &MigrateGvgMeta) -> Result<()> {
        (**self).insert_migrate_gvg_unit(meta)
    }

    fn query_migrate_gvg_unit(&self, migrate_key: &str) -> Result<MigrateGvgMeta> {
        (**self).query_migrate_gvg_unit(migrate_key)
    }

    fn update_migrate_gvg_unit_status(
        &self,
        migrate_key: &str,
        status: MigrateStatus,
    ) -> Result<()> {
        (**self).update_migrate_gvg_unit_status(migrate_key, status)
    }

    fn update_migrate_gvg_unit_last_migrate_object_id(
        &self,
        migrate_key: &str,
        object_id: u64,
    ) -> Result<()> {
        (**self).update_migrate_gvg_unit_last_migrate_object_id(migrate_key, object_id)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExitState {
    sp_exit_progress: u64,
    swap_out_progress: u64,
    swap_out_units: Vec<SwapOutMeta>,
    migrate_gvg_units: Vec<MigrateGvgMeta>,
}

/// File-backed [`ExitStore`] keeping all state in `exit_state.toml`.
///
/// Every mutation rewrites the state file, so the on-disk view is always a
/// complete snapshot and a restart can rebuild from it alone.
pub struct FileExitStore {
    state_file: PathBuf,
    state: Mutex<ExitState>,
}

impl FileExitStore {
    /// Opens (or creates) the store under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;

        let state_file = state_dir.join("exit_state.toml");
        let state = Self::load_state(&state_file)?;

        Ok(Self {
            state_file,
            state: Mutex::new(state),
        })
    }

    fn load_state(state_file: &PathBuf) -> Result<ExitState> {
        if !state_file.exists() {
            return Ok(ExitState::default());
        }

        let content = fs::read_to_string(state_file)?;

        if content.trim().is_empty() {
            return Ok(ExitState::default());
        }

        toml::from_str(&content).map_err(|source| StoreError::Parse {
            path: state_file.clone(),
            source,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ExitState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn save_state(&self, state: &ExitState) -> Result<()> {
        let content = toml::to_string_pretty(state)?;
        fs::write(&self.state_file, content)?;
        Ok(())
    }
}

impl ExitStore for FileExitStore {
    fn query_sp_exit_subscribe_progress(&self) -> Result<u64> {
        Ok(self.lock()?.sp_exit_progress)
    }

    fn update_sp_exit_subscribe_progress(&self, height: u64) -> Result<()> {
        let mut state = self.lock()?;
        state.sp_exit_progress = height;
        self.save_state(&state)
    }

    fn query_swap_out_subscribe_progress(&self) -> Result<u64> {
        Ok(self.lock()?.swap_out_progress)
    }

    fn update_swap_out_subscribe_progress(&self, height: u64) -> Result<()> {
        let mut state = self.lock()?;
        state.swap_out_progress = height;
        self.save_state(&state)
    }

    fn insert_swap_out_unit(&self, meta: &SwapOutMeta) -> Result<()> {
        let mut state = self.lock()?;
        let exists = state
            .swap_out_units
            .iter()
            .any(|row| row.swap_out_key == meta.swap_out_key && row.is_dest_sp == meta.is_dest_sp);
        if exists {
            return Ok(());
        }
        state.swap_out_units.push(meta.clone());
        self.save_state(&state)
    }

    fn list_dest_sp_swap_out_units(&self) -> Result<Vec<SwapOutMeta>> {
        let state = self.lock()?;
        Ok(state
            .swap_out_units
            .iter()
            .filter(|row| row.is_dest_sp)
            .cloned()
            .collect())
    }

    fn query_swap_out_unit_in_src_sp(&self, swap_out_key: &str) -> Result<Option<SwapOutMeta>> {
        let state = self.lock()?;
        Ok(state
            .swap_out_units
            .iter()
            .find(|row| row.swap_out_key == swap_out_key && !row.is_dest_sp)
            .cloned())
    }

    fn update_swap_out_unit_completed_gvg_list(
        &self,
        swap_out_key: &str,
        completed_gvg_ids: &[GvgId],
    ) -> Result<()> {
        let mut state = self.lock()?;
        let row = state
            .swap_out_units
            .iter_mut()
            .find(|row| row.swap_out_key == swap_out_key && row.is_dest_sp)
            .ok_or_else(|| StoreError::NotFound(swap_out_key.to_string()))?;
        row.completed_gvg_ids = completed_gvg_ids.to_vec();
        self.save_state(&state)
    }

    fn insert_migrate_gvg_unit(&self, meta: &MigrateGvgMeta) -> Result<()> {
        let mut state = self.lock()?;
        let exists = state
            .migrate_gvg_units
            .iter()
            .any(|row| row.migrate_key == meta.migrate_key);
        if exists {
            return Ok(());
        }
        state.migrate_gvg_units.push(meta.clone());
        self.save_state(&state)
    }

    fn query_migrate_gvg_unit(&self, migrate_key: &str) -> Result<MigrateGvgMeta> {
        let state = self.lock()?;
        state
            .migrate_gvg_units
            .iter()
            .find(|row| row.migrate_key == migrate_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(migrate_key.to_string()))
    }

    fn update_migrate_gvg_unit_status(
        &self,
        migrate_key: &str,
        status: MigrateStatus,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let row = state
            .migrate_gvg_units
            .iter_mut()
            .find(|row| row.migrate_key == migrate_key)
            .ok_or_else(|| StoreError::NotFound(migrate_key.to_string()))?;
        row.migrate_status = status;
        self.save_state(&state)
    }

    fn update_migrate_gvg_unit_last_migrate_object_id(
        &self,
        migrate_key: &str,
        object_id: u64,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let row = state
            .migrate_gvg_units
            .iter_mut()
            .find(|row| row.migrate_key == migrate_key)
            .ok_or_else(|| StoreError::NotFound(migrate_key.to_string()))?;
        row.last_migrated_object_id = object_id;
        self.save_state(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::make_gvg_migrate_key;
    use tempfile::TempDir;

    fn swap_out_row(key: &str, is_dest_sp: bool) -> SwapOutMeta {
        SwapOutMeta {
            swap_out_key: key.to_string(),
            is_dest_sp,
            swap_out_msg: SwapOutMessage::family("0xsrc", FamilyId::new(1), SpId::new(4)),
            completed_gvg_ids: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    fn migrate_row(migrate_key: &str) -> MigrateGvgMeta {
        MigrateGvgMeta {
            migrate_key: migrate_key.to_string(),
            swap_out_key: "familyID-1".to_string(),
            gvg_id: GvgId::new(1),
            family_id: FamilyId::new(1),
            redundancy_index: -1,
            src_sp_id: SpId::new(1),
            dest_sp_id: SpId::new(4),
            last_migrated_object_id: 0,
            migrate_status: MigrateStatus::WaitForMigrate,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn cursors_start_at_zero_and_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FileExitStore::new(temp.path()).unwrap();

        assert_eq!(store.query_sp_exit_subscribe_progress().unwrap(), 0);
        assert_eq!(store.query_swap_out_subscribe_progress().unwrap(), 0);

        store.update_sp_exit_subscribe_progress(12).unwrap();
        store.update_swap_out_subscribe_progress(9).unwrap();

        assert_eq!(store.query_sp_exit_subscribe_progress().unwrap(), 12);
        assert_eq!(store.query_swap_out_subscribe_progress().unwrap(), 9);
    }

    #[test]
    fn insert_swap_out_unit_is_idempotent_per_role() {
        let temp = TempDir::new().unwrap();
        let store = FileExitStore::new(temp.path()).unwrap();

        store.insert_swap_out_unit(&swap_out_row("familyID-1", false)).unwrap();
        store.insert_swap_out_unit(&swap_out_row("familyID-1", false)).unwrap();
        store.insert_swap_out_unit(&swap_out_row("familyID-1", true)).unwrap();

        assert_eq!(store.list_dest_sp_swap_out_units().unwrap().len(), 1);
        assert!(store.query_swap_out_unit_in_src_sp("familyID-1").unwrap().is_some());
    }

    #[test]
    fn src_query_ignores_dest_rows() {
        let temp = TempDir::new().unwrap();
        let store = FileExitStore::new(temp.path()).unwrap();

        store.insert_swap_out_unit(&swap_out_row("familyID-2", true)).unwrap();
        assert!(store.query_swap_out_unit_in_src_sp("familyID-2").unwrap().is_none());
    }

    #[test]
    fn completed_gvg_list_replaces_previous_value() {
        let temp = TempDir::new().unwrap();
        let store = FileExitStore::new(temp.path()).unwrap();

        store.insert_swap_out_unit(&swap_out_row("familyID-1", true)).unwrap();
        store
            .update_swap_out_unit_completed_gvg_list("familyID-1", &[GvgId::new(1)])
            .unwrap();
        store
            .update_swap_out_unit_completed_gvg_list("familyID-1", &[GvgId::new(1), GvgId::new(2)])
            .unwrap();

        let rows = store.list_dest_sp_swap_out_units().unwrap();
        assert_eq!(rows[0].completed_gvg_ids, vec![GvgId::new(1), GvgId::new(2)]);
    }

    #[test]
    fn migrate_unit_progress_round_trips() {
        let temp = TempDir::new().unwrap();
        let store = FileExitStore::new(temp.path()).unwrap();
        let key = make_gvg_migrate_key(GvgId::new(1), FamilyId::new(1), -1);

        store.insert_migrate_gvg_unit(&migrate_row(&key)).unwrap();
        store
            .update_migrate_gvg_unit_last_migrate_object_id(&key, 77)
            .unwrap();
        store
            .update_migrate_gvg_unit_status(&key, MigrateStatus::Migrating)
            .unwrap();

        let row = store.query_migrate_gvg_unit(&key).unwrap();
        assert_eq!(row.last_migrated_object_id, 77);
        assert_eq!(row.migrate_status, MigrateStatus::Migrating);
    }

    #[test]
    fn updates_on_missing_rows_are_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FileExitStore::new(temp.path()).unwrap();

        let err = store
            .update_migrate_gvg_unit_status("gvg-9-vgf-0-ridx-0", MigrateStatus::Migrated)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn state_survives_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let store = FileExitStore::new(temp.path()).unwrap();
            store.update_sp_exit_subscribe_progress(5).unwrap();
            store.insert_swap_out_unit(&swap_out_row("familyID-1", true)).unwrap();
            let key = make_gvg_migrate_key(GvgId::new(1), FamilyId::new(1), -1);
            store.insert_migrate_gvg_unit(&migrate_row(&key)).unwrap();
        }

        let store = FileExitStore::new(temp.path()).unwrap();
        assert_eq!(store.query_sp_exit_subscribe_progress().unwrap(), 5);
        assert_eq!(store.list_dest_sp_swap_out_units().unwrap().len(), 1);
        assert!(store
            .query_migrate_gvg_unit(&make_gvg_migrate_key(GvgId::new(1), FamilyId::new(1), -1))
            .is_ok());
    }
}
