pub mod config;
pub mod ledger;
pub mod paths;
pub mod snapshot_log;
pub mod sqlite_store;
pub mod task_tracker;

pub use config::LedgerConfig;
pub use ledger::Ledger;
pub use paths::WaybillPaths;
pub use snapshot_log::{Dimension, SnapshotLog};
pub use sqlite_store::{SqliteStore, DEFAULT_BUSY_TIMEOUT};
pub use task_tracker::TaskTracker;
