//! Query parameters handed to the store: pagination, time windows, and the
//! composable snapshot and task filters.

use crate::error::{Error, Result};
use crate::types::{SnapshotType, TaskStatus, TaskType};
use time::{Date, OffsetDateTime, Time, UtcOffset};

/// Limit/offset pagination. A `limit` of 0 means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub const ALL: Page = Page { limit: 0, offset: 0 };
    pub const DEFAULT_LIMIT: u32 = 100;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(Self::DEFAULT_LIMIT)
    }
}

/// Half-open interval `[start, end)` over `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeWindow {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        if end < start {
            return Err(Error::Invalid(format!(
                "window end {end} is before start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The 24 hours of `date` in the given business offset.
    pub fn day(date: Date, offset: UtcOffset) -> Self {
        let start = date.with_time(Time::MIDNIGHT).assume_offset(offset);
        Self {
            start,
            end: start + time::Duration::DAY,
        }
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start <= ts && ts < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchivedFilter {
    #[default]
    Any,
    Only,
    Exclude,
}

/// Composable snapshot filter. Every populated field narrows the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFilter {
    pub delivery_id: Option<String>,
    /// Empty means any type.
    pub types: Vec<SnapshotType>,
    pub provider_code: Option<String>,
    pub delivery_status: Option<String>,
    pub customer_id: Option<String>,
    pub order_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub province: Option<String>,
    pub business_date: Option<Date>,
    pub window: Option<TimeWindow>,
    pub archived: ArchivedFilter,
    pub order: SortOrder,
    pub page: Page,
}

impl SnapshotFilter {
    /// Unbounded, oldest-first filter with no criteria.
    pub fn all() -> Self {
        Self {
            page: Page::ALL,
            ..Default::default()
        }
    }

    pub fn delivery(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }

    pub fn of_type(mut self, snapshot_type: SnapshotType) -> Self {
        self.types.push(snapshot_type);
        self
    }

    pub fn of_types(mut self, types: &[SnapshotType]) -> Self {
        self.types.extend_from_slice(types);
        self
    }

    pub fn provider(mut self, provider_code: impl Into<String>) -> Self {
        self.provider_code = Some(provider_code.into());
        self
    }

    pub fn status(mut self, delivery_status: impl Into<String>) -> Self {
        self.delivery_status = Some(delivery_status.into());
        self
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    pub fn province(mut self, province: impl Into<String>) -> Self {
        self.province = Some(province.into());
        self
    }

    pub fn on_business_date(mut self, date: Date) -> Self {
        self.business_date = Some(date);
        self
    }

    pub fn within(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn archived(mut self, archived: ArchivedFilter) -> Self {
        self.archived = archived;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = SortOrder::NewestFirst;
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = SortOrder::OldestFirst;
        self
    }

    pub fn page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }
}

/// Task listing filter. Results are always newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Empty means any status.
    pub statuses: Vec<TaskStatus>,
    pub assigned_to: Option<String>,
    pub unassigned_only: bool,
    pub provider_code: Option<String>,
    pub task_type: Option<TaskType>,
    pub delivery_id: Option<String>,
    pub page: Page,
}

impl TaskFilter {
    pub fn with_statuses(statuses: &[TaskStatus], page: Page) -> Self {
        Self {
            statuses: statuses.to_vec(),
            page,
            ..Default::default()
        }
    }
}
