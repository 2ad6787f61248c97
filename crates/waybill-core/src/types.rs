use crate::clock::{serde_date, serde_ts};
use crate::error::Error;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Date, OffsetDateTime};

/// Snapshot id format: `snap_<ulid>`
pub type SnapshotId = String;

/// Task id format: `task_<ulid>`
pub type TaskId = String;

// ── Snapshot tags ──

/// Kind of delivery-affecting event a snapshot records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Created,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Failed,
    Cancelled,
}

impl SnapshotType {
    pub const ALL: [SnapshotType; 7] = [
        SnapshotType::Created,
        SnapshotType::Assigned,
        SnapshotType::PickedUp,
        SnapshotType::InTransit,
        SnapshotType::Delivered,
        SnapshotType::Failed,
        SnapshotType::Cancelled,
    ];

    /// Types that count as business-critical milestones. `InTransit` is
    /// progress noise and is left out.
    pub const BUSINESS_EVENTS: [SnapshotType; 6] = [
        SnapshotType::Created,
        SnapshotType::Assigned,
        SnapshotType::PickedUp,
        SnapshotType::Delivered,
        SnapshotType::Failed,
        SnapshotType::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotType::Created => "created",
            SnapshotType::Assigned => "assigned",
            SnapshotType::PickedUp => "picked_up",
            SnapshotType::InTransit => "in_transit",
            SnapshotType::Delivered => "delivered",
            SnapshotType::Failed => "failed",
            SnapshotType::Cancelled => "cancelled",
        }
    }

    pub fn is_business_event(self) -> bool {
        Self::BUSINESS_EVENTS.contains(&self)
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown snapshot type: {s:?}")))
    }
}

// ── Snapshot records ──

/// Denormalized delivery attributes copied onto each snapshot so reporting
/// queries never need to join against the delivery itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeliveryFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address_province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_fee: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
}

/// A snapshot as submitted for append, before the log assigns id, time and hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewSnapshot {
    pub delivery_id: String,
    pub snapshot_type: SnapshotType,
    #[serde(default)]
    pub snapshot_data: serde_json::Value,
    /// Expected predecessor. When absent the log links to the current latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_snapshot_id: Option<SnapshotId>,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_user_id: Option<String>,
    pub triggered_event: String,
    #[serde(flatten)]
    pub facts: DeliveryFacts,
}

/// One immutable entry of a delivery's audit chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub delivery_id: String,
    pub snapshot_type: SnapshotType,
    pub snapshot_data: serde_json::Value,
    pub previous_snapshot_id: Option<SnapshotId>,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_user_id: Option<String>,
    pub triggered_event: String,
    #[serde(flatten)]
    pub facts: DeliveryFacts,
    #[serde(with = "serde_ts")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_date")]
    pub business_date: Date,
    /// SHA-256 over the canonical audit content (everything but `hash` and
    /// `archived_at`).
    pub hash: String,
    #[serde(
        default,
        with = "serde_ts::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub archived_at: Option<OffsetDateTime>,
}

// ── Task tags ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown task status: {s:?}")))
    }
}

/// Kind of human follow-up work. Known kinds get variants; anything else is
/// carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskType {
    PickupCall,
    DeliveryConfirmation,
    CodFollowUp,
    Other(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::PickupCall => "pickup_call",
            TaskType::DeliveryConfirmation => "delivery_confirmation",
            TaskType::CodFollowUp => "cod_follow_up",
            TaskType::Other(tag) => tag,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Ok(match tag {
            "" => return Err(Error::Invalid("task type must not be empty".into())),
            "pickup_call" => TaskType::PickupCall,
            "delivery_confirmation" => TaskType::DeliveryConfirmation,
            "cod_follow_up" => TaskType::CodFollowUp,
            other => TaskType::Other(other.to_string()),
        })
    }
}

impl TryFrom<String> for TaskType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        match value {
            TaskType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

// ── Task records ──

/// Input for creating a coordination task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub delivery_id: String,
    pub provider_code: String,
    pub task_type: TaskType,
    pub task_instructions: String,
    #[serde(default)]
    pub contact_information: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_user_id: Option<String>,
    #[serde(
        default,
        with = "serde_ts::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_reminder_due: Option<OffsetDateTime>,
}

/// A unit of human coordination work tied to one delivery and one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualCoordinationTask {
    pub id: TaskId,
    pub delivery_id: String,
    pub provider_code: String,
    pub task_type: TaskType,
    pub task_status: TaskStatus,
    pub assigned_to_user_id: Option<String>,
    pub task_instructions: String,
    pub contact_information: serde_json::Value,
    #[serde(default, with = "serde_ts::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub completion_notes: Option<String>,
    pub external_reference: Option<String>,
    pub reminder_count: u32,
    #[serde(default, with = "serde_ts::option")]
    pub last_reminder_sent: Option<OffsetDateTime>,
    #[serde(default, with = "serde_ts::option")]
    pub next_reminder_due: Option<OffsetDateTime>,
    #[serde(with = "serde_ts")]
    pub created_at: OffsetDateTime,
    #[serde(with = "serde_ts")]
    pub updated_at: OffsetDateTime,
}

impl ManualCoordinationTask {
    pub fn is_active(&self) -> bool {
        self.task_status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.task_status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_type_tags_round_trip() {
        for t in SnapshotType::ALL {
            assert_eq!(t.as_str().parse::<SnapshotType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!("shipped".parse::<SnapshotType>().is_err());
    }

    #[test]
    fn in_transit_is_not_a_business_event() {
        assert!(!SnapshotType::InTransit.is_business_event());
        assert!(SnapshotType::Delivered.is_business_event());
        assert_eq!(SnapshotType::BUSINESS_EVENTS.len(), 6);
    }

    #[test]
    fn task_status_partitions() {
        let active: Vec<_> = TaskStatus::ALL.into_iter().filter(|s| s.is_active()).collect();
        assert_eq!(active, vec![TaskStatus::Pending, TaskStatus::InProgress]);
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
    }

    #[test]
    fn task_type_is_open_set() {
        assert_eq!("pickup_call".parse::<TaskType>().unwrap(), TaskType::PickupCall);
        assert_eq!("cod_follow_up".parse::<TaskType>().unwrap(), TaskType::CodFollowUp);
        let other: TaskType = "return_label".parse().unwrap();
        assert_eq!(other, TaskType::Other("return_label".into()));
        assert_eq!(other.to_string(), "return_label");
        assert!("  ".parse::<TaskType>().is_err());
    }

    #[test]
    fn task_type_serde_as_plain_string() {
        let json = serde_json::to_string(&TaskType::DeliveryConfirmation).unwrap();
        assert_eq!(json, "\"delivery_confirmation\"");
        let back: TaskType = serde_json::from_str("\"vendor_audit\"").unwrap();
        assert_eq!(back, TaskType::Other("vendor_audit".into()));
        assert!(serde_json::from_str::<TaskType>("\"\"").is_err());
    }

    #[test]
    fn facts_flatten_and_fee_as_string() {
        let facts = DeliveryFacts {
            provider_code: Some("manual".into()),
            delivery_fee: Some(Decimal::new(1250, 2)),
            ..Default::default()
        };
        let v = serde_json::to_value(&facts).unwrap();
        assert_eq!(v["provider_code"], "manual");
        assert_eq!(v["delivery_fee"], "12.50");
        assert!(v.get("vehicle_id").is_none());
    }
}
