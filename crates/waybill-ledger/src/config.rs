//! Workspace configuration stored as a flat key map in `.waybill/config.json`.
//!
//! Keys are dotted names (`store.busy_timeout_ms`), matching what
//! `waybill config set` writes. Missing keys fall back to defaults; unknown
//! keys are ignored.

use crate::paths::WaybillPaths;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::UtcOffset;
use waybill_core::{clock, Error, Result};

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_ARCHIVE_AFTER_DAYS: u32 = 90;
pub const DEFAULT_DELETE_AFTER_DAYS: u32 = 365;
pub const DEFAULT_REMINDER_INTERVAL_MINUTES: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(rename = "store.busy_timeout_ms", default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Offset used to derive `business_date` from `created_at`.
    #[serde(rename = "business.utc_offset_minutes", default)]
    pub business_utc_offset_minutes: i32,
    #[serde(
        rename = "retention.archive_after_days",
        default = "default_archive_after_days"
    )]
    pub archive_after_days: u32,
    #[serde(
        rename = "retention.delete_after_days",
        default = "default_delete_after_days"
    )]
    pub delete_after_days: u32,
    #[serde(
        rename = "reminders.interval_minutes",
        default = "default_reminder_interval_minutes"
    )]
    pub reminder_interval_minutes: u32,
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_archive_after_days() -> u32 {
    DEFAULT_ARCHIVE_AFTER_DAYS
}

fn default_delete_after_days() -> u32 {
    DEFAULT_DELETE_AFTER_DAYS
}

fn default_reminder_interval_minutes() -> u32 {
    DEFAULT_REMINDER_INTERVAL_MINUTES
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            business_utc_offset_minutes: 0,
            archive_after_days: DEFAULT_ARCHIVE_AFTER_DAYS,
            delete_after_days: DEFAULT_DELETE_AFTER_DAYS,
            reminder_interval_minutes: DEFAULT_REMINDER_INTERVAL_MINUTES,
        }
    }
}

impl LedgerConfig {
    /// Load from `.waybill/config.json`. A missing file yields defaults; a
    /// malformed one is an error rather than a silent fallback.
    pub fn load(paths: &WaybillPaths) -> Result<Self> {
        let content = match std::fs::read_to_string(&paths.config_json) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::store(e)),
        };
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.business_offset()?;
        if self.delete_after_days != 0 && self.delete_after_days < self.archive_after_days {
            return Err(Error::Invalid(format!(
                "retention.delete_after_days ({}) is shorter than retention.archive_after_days ({})",
                self.delete_after_days, self.archive_after_days
            )));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn business_offset(&self) -> Result<UtcOffset> {
        clock::offset_from_minutes(self.business_utc_offset_minutes)
    }

    pub fn reminder_interval(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.reminder_interval_minutes))
    }
}
