//! Coordination-task state machine and notification shape.

use crate::clock::{self, serde_ts};
use crate::error::{Error, Result};
use crate::types::{ManualCoordinationTask, NewTask, TaskStatus, TaskType};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub fn new_task_id() -> String {
    format!("task_{}", ulid::Ulid::new().to_string().to_lowercase())
}

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(TaskStatus, &[TaskStatus])] = &[
    (
        TaskStatus::Pending,
        &[
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ],
    ),
    (
        TaskStatus::InProgress,
        &[
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ],
    ),
    // Completed, Failed and Cancelled are terminal
];

pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

/// Every status a task may be in for a move to `to` to be legal. This is the
/// `IN (...)` set of the conditional update.
pub fn sources_for(to: TaskStatus) -> Vec<TaskStatus> {
    VALID_TRANSITIONS
        .iter()
        .filter(|(_, targets)| targets.contains(&to))
        .map(|(from, _)| *from)
        .collect()
}

// ── Creation ──

impl NewTask {
    pub fn new(
        delivery_id: impl Into<String>,
        provider_code: impl Into<String>,
        task_type: TaskType,
        task_instructions: impl Into<String>,
    ) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            provider_code: provider_code.into(),
            task_type,
            task_instructions: task_instructions.into(),
            contact_information: serde_json::Value::Object(Default::default()),
            assigned_to_user_id: None,
            next_reminder_due: None,
        }
    }

    pub fn with_contact(mut self, contact: serde_json::Value) -> Self {
        self.contact_information = contact;
        self
    }

    pub fn assigned_to(mut self, user_id: impl Into<String>) -> Self {
        self.assigned_to_user_id = Some(user_id.into());
        self
    }

    pub fn remind_at(mut self, due: OffsetDateTime) -> Self {
        self.next_reminder_due = Some(due);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery_id.trim().is_empty() {
            return Err(Error::Invalid("delivery_id must not be empty".into()));
        }
        if self.provider_code.trim().is_empty() {
            return Err(Error::Invalid("provider_code must not be empty".into()));
        }
        if self.task_type.as_str().trim().is_empty() {
            return Err(Error::Invalid("task_type must not be empty".into()));
        }
        if !self.contact_information.is_object() && !self.contact_information.is_null() {
            return Err(Error::Invalid(
                "contact_information must be a JSON object".into(),
            ));
        }
        Ok(())
    }

    /// Build the initial `Pending` record.
    pub fn into_task(self, now: OffsetDateTime) -> Result<ManualCoordinationTask> {
        self.validate()?;
        let now = clock::truncate_micros(now);
        let contact_information = if self.contact_information.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.contact_information
        };
        Ok(ManualCoordinationTask {
            id: new_task_id(),
            delivery_id: self.delivery_id,
            provider_code: self.provider_code,
            task_type: self.task_type,
            task_status: TaskStatus::Pending,
            assigned_to_user_id: self.assigned_to_user_id,
            task_instructions: self.task_instructions,
            contact_information,
            completed_at: None,
            completion_notes: None,
            external_reference: None,
            reminder_count: 0,
            last_reminder_sent: None,
            next_reminder_due: self.next_reminder_due.map(clock::truncate_micros),
            created_at: now,
            updated_at: now,
        })
    }
}

// ── Notification shape ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskCreated,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

/// Plain-data notification the application layer publishes on task
/// creation and completion. Transport is not this crate's concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskNotification {
    pub kind: NotificationKind,
    pub task_id: String,
    pub delivery_id: String,
    pub provider_code: String,
    pub task_type: TaskType,
    pub instructions: String,
    pub assigned_to: Option<String>,
    #[serde(with = "serde_ts")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "serde_ts::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "serde_ts")]
    pub emitted_at: OffsetDateTime,
}

impl TaskNotification {
    /// Document suitable for a snapshot's `snapshot_data`, keeping the
    /// task correlated with the delivery's audit chain.
    pub fn to_snapshot_data(&self) -> Result<serde_json::Value> {
        let mut val = serde_json::to_value(self)?;
        if let Some(obj) = val.as_object_mut() {
            obj.insert("source".into(), serde_json::Value::from("manual_coordination"));
        }
        Ok(val)
    }
}

impl ManualCoordinationTask {
    pub fn notification(&self, kind: NotificationKind) -> TaskNotification {
        TaskNotification {
            kind,
            task_id: self.id.clone(),
            delivery_id: self.delivery_id.clone(),
            provider_code: self.provider_code.clone(),
            task_type: self.task_type.clone(),
            instructions: self.task_instructions.clone(),
            assigned_to: self.assigned_to_user_id.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            emitted_at: clock::now_utc(),
        }
    }

    /// Notification matching the task's current terminal status, if any.
    pub fn outcome_notification(&self) -> Option<TaskNotification> {
        let kind = match self.task_status {
            TaskStatus::Completed => NotificationKind::TaskCompleted,
            TaskStatus::Failed => NotificationKind::TaskFailed,
            TaskStatus::Cancelled => NotificationKind::TaskCancelled,
            TaskStatus::Pending | TaskStatus::InProgress => return None,
        };
        Some(self.notification(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            for to in TaskStatus::ALL {
                assert!(!is_valid_transition(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn no_way_back_to_pending() {
        assert!(sources_for(TaskStatus::Pending).is_empty());
        assert!(!is_valid_transition(TaskStatus::InProgress, TaskStatus::Pending));
    }

    #[test]
    fn sources_for_terminal_targets_are_active_states() {
        for to in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert_eq!(
                sources_for(to),
                vec![TaskStatus::Pending, TaskStatus::InProgress]
            );
        }
        assert_eq!(sources_for(TaskStatus::InProgress), vec![TaskStatus::Pending]);
    }

    #[test]
    fn new_task_starts_pending() {
        let now = datetime!(2026-03-01 10:00:00 UTC);
        let task = NewTask::new("D1", "manual", TaskType::PickupCall, "call before 17:00")
            .with_contact(json!({"phone": "+66 2 000 0000"}))
            .into_task(now)
            .unwrap();
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.task_status, TaskStatus::Pending);
        assert_eq!(task.reminder_count, 0);
        assert_eq!(task.created_at, now);
        assert_eq!(task.updated_at, now);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn validation_rejects_blanks() {
        let now = datetime!(2026-03-01 10:00:00 UTC);
        assert!(NewTask::new("", "manual", TaskType::PickupCall, "x")
            .into_task(now)
            .is_err());
        assert!(NewTask::new("D1", " ", TaskType::PickupCall, "x")
            .into_task(now)
            .is_err());
        assert!(NewTask::new("D1", "manual", TaskType::PickupCall, "x")
            .with_contact(json!(["not", "an", "object"]))
            .into_task(now)
            .is_err());
    }

    #[test]
    fn notification_carries_contract_fields() {
        let task = NewTask::new("D1", "manual", TaskType::CodFollowUp, "collect 350 THB")
            .assigned_to("U1")
            .into_task(datetime!(2026-03-01 10:00:00 UTC))
            .unwrap();
        let n = task.notification(NotificationKind::TaskCreated);
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["kind"], "task_created");
        assert_eq!(v["task_id"], task.id.as_str());
        assert_eq!(v["delivery_id"], "D1");
        assert_eq!(v["task_type"], "cod_follow_up");
        assert_eq!(v["instructions"], "collect 350 THB");
        assert_eq!(v["assigned_to"], "U1");
        assert_eq!(v["created_at"], "2026-03-01T10:00:00.000000Z");
        assert!(v["completed_at"].is_null());
        assert!(task.outcome_notification().is_none());
    }

    #[test]
    fn snapshot_data_embeds_task_id() {
        let task = NewTask::new("D1", "manual", TaskType::PickupCall, "call")
            .into_task(datetime!(2026-03-01 10:00:00 UTC))
            .unwrap();
        let data = task
            .notification(NotificationKind::TaskCreated)
            .to_snapshot_data()
            .unwrap();
        assert_eq!(data["task_id"], task.id.as_str());
        assert_eq!(data["source"], "manual_coordination");
    }
}
