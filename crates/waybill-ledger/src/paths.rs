use std::path::{Path, PathBuf};

/// Well-known paths under `.waybill/`.
#[derive(Debug, Clone)]
pub struct WaybillPaths {
    pub root: PathBuf,
    pub waybill_dir: PathBuf,
    pub ledger_db: PathBuf,
    pub config_json: PathBuf,
}

impl WaybillPaths {
    /// Derive all paths from a workspace root. Pure computation, no I/O.
    pub fn discover(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let waybill_dir = root.join(".waybill");
        Self {
            ledger_db: waybill_dir.join("ledger.db"),
            config_json: waybill_dir.join("config.json"),
            waybill_dir,
            root,
        }
    }

    /// Create the `.waybill/` directory. Idempotent.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.waybill_dir)
    }

    pub fn is_initialized(&self) -> bool {
        self.waybill_dir.is_dir() && self.ledger_db.is_file()
    }

    /// Walk up from `start` looking for a directory containing `.waybill/`.
    pub fn find_root(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .find(|dir| dir.join(".waybill").is_dir())
            .map(Path::to_path_buf)
    }
}
