pub mod clock;
pub mod error;
pub mod filter;
pub mod hash;
pub mod snapshot;
pub mod task;
pub mod types;

pub use error::{Error, Result};
pub use filter::{ArchivedFilter, Page, SnapshotFilter, SortOrder, TaskFilter, TimeWindow};
pub use snapshot::{ChainIssue, ChainReport};
pub use task::{NotificationKind, TaskNotification};
pub use types::*;
