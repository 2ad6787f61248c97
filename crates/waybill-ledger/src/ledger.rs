use crate::config::LedgerConfig;
use crate::paths::WaybillPaths;
use crate::snapshot_log::SnapshotLog;
use crate::sqlite_store::SqliteStore;
use crate::task_tracker::TaskTracker;
use std::path::PathBuf;
use tracing::info;
use waybill_core::{Error, Result};

/// A `.waybill/` workspace: its paths, its configuration and a way to open
/// connections on its database. Each service gets a connection of its own.
pub struct Ledger {
    pub paths: WaybillPaths,
    pub config: LedgerConfig,
}

impl Ledger {
    /// Create `.waybill/`, the database and a default `config.json`.
    /// Re-running on an initialized workspace leaves existing files alone.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = WaybillPaths::discover(root);
        paths.ensure_layout().map_err(Error::store)?;

        if !paths.config_json.exists() {
            let json = serde_json::to_string_pretty(&LedgerConfig::default())?;
            std::fs::write(&paths.config_json, format!("{json}\n")).map_err(Error::store)?;
        }
        let config = LedgerConfig::load(&paths)?;

        let created = !paths.ledger_db.exists();
        SqliteStore::open_or_create(&paths.ledger_db, config.busy_timeout())?;
        if created {
            info!(path = %paths.ledger_db.display(), "created ledger database");
        }
        Ok(Self { paths, config })
    }

    /// Open an existing workspace. Fails if `.waybill/` was never initialized.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = WaybillPaths::discover(root);
        if !paths.is_initialized() {
            return Err(Error::Invalid(format!(
                "not a waybill workspace ({}/.waybill not found). Run `waybill init` first.",
                paths.root.display()
            )));
        }
        let config = LedgerConfig::load(&paths)?;
        Ok(Self { paths, config })
    }

    /// A fresh connection on the workspace database.
    pub fn store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.paths.ledger_db, self.config.busy_timeout())
    }

    pub fn snapshot_log(&self) -> Result<SnapshotLog> {
        Ok(SnapshotLog::new(
            self.store()?,
            self.config.business_offset()?,
        ))
    }

    pub fn task_tracker(&self) -> Result<TaskTracker> {
        Ok(TaskTracker::new(self.store()?))
    }
}
