//! Error taxonomy shared by the snapshot log and the task tracker.
//!
//! Every failure is returned to the caller unchanged; nothing in the core
//! retries or recovers silently.

/// Result alias used across Waybill crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Entity labels carried in `NotFound` and `Conflict` errors.
pub mod entity {
    pub const SNAPSHOT: &str = "snapshot";
    pub const DELIVERY: &str = "delivery";
    pub const TASK: &str = "task";
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No record with the given id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A guarded write was rejected because the stored state no longer
    /// permits it (already transitioned, stale predecessor, lost claim).
    #[error("conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// A snapshot pointer names a snapshot owned by another delivery.
    #[error(
        "snapshot {snapshot_id} belongs to delivery {actual_delivery}, not {expected_delivery}"
    )]
    InvalidReference {
        snapshot_id: String,
        expected_delivery: String,
        actual_delivery: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller input failed validation.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Infrastructure failure from the backing store, passed through as-is.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Conflict {
            entity,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a backend error without altering it.
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Store(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
