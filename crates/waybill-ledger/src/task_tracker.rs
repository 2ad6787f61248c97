//! Manual coordination tasks.
//!
//! Every guarded mutation is a single `UPDATE ... WHERE id = ? AND <guard>
//! RETURNING ...`. A miss is explained by re-reading the row: absent means
//! `NotFound`, present means the guard rejected it and the caller gets a
//! `Conflict` carrying the observed state.

use crate::sqlite_store::{
    opt_text, opt_ts, page_values, parse_opt_ts, placeholders, text, ts, SqliteStore,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::debug;
use waybill_core::error::entity;
use waybill_core::task::sources_for;
use waybill_core::{
    clock, Error, ManualCoordinationTask, NewTask, Page, Result, TaskFilter, TaskStatus, TaskType,
};

const TASK_COLUMNS: &str = "id, delivery_id, provider_code, task_type, task_status,
    assigned_to_user_id, task_instructions, contact_information, completed_at,
    completion_notes, external_reference, reminder_count, last_reminder_sent,
    next_reminder_due, created_at, updated_at";

pub struct TaskTracker {
    store: SqliteStore,
}

impl TaskTracker {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn create(&self, new: NewTask) -> Result<ManualCoordinationTask> {
        let task = new.into_task(clock::now_utc())?;
        let contact = serde_json::to_string(&task.contact_information)?;
        self.store
            .conn()
            .execute(
                &format!(
                    "INSERT INTO coordination_tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params_from_iter([
                    text(task.id.as_str()),
                    text(task.delivery_id.as_str()),
                    text(task.provider_code.as_str()),
                    text(task.task_type.as_str()),
                    text(task.task_status.as_str()),
                    opt_text(task.assigned_to_user_id.as_deref()),
                    text(task.task_instructions.as_str()),
                    text(contact),
                    Value::Null,
                    Value::Null,
                    Value::Null,
                    Value::Integer(0),
                    Value::Null,
                    opt_ts(task.next_reminder_due),
                    ts(task.created_at),
                    ts(task.updated_at),
                ]),
            )
            .map_err(Error::store)?;
        debug!(task_id = %task.id, delivery_id = %task.delivery_id, task_type = %task.task_type, "task created");
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<ManualCoordinationTask> {
        self.find(id)?
            .ok_or_else(|| Error::not_found(entity::TASK, id))
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let changed = self
            .store
            .conn()
            .execute("DELETE FROM coordination_tasks WHERE id = ?1", params![id])
            .map_err(Error::store)?;
        if changed == 0 {
            return Err(Error::not_found(entity::TASK, id));
        }
        debug!(task_id = id, "task deleted");
        Ok(())
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Pending → InProgress.
    pub fn start_task(&self, id: &str) -> Result<ManualCoordinationTask> {
        self.transition(id, TaskStatus::InProgress, "", Vec::new())
    }

    pub fn complete_task(
        &self,
        id: &str,
        notes: Option<&str>,
        external_reference: Option<&str>,
    ) -> Result<ManualCoordinationTask> {
        self.transition(
            id,
            TaskStatus::Completed,
            ", completed_at = ?, completion_notes = ?, external_reference = ?",
            vec![
                ts(clock::now_utc()),
                opt_text(non_blank(notes)),
                opt_text(non_blank(external_reference)),
            ],
        )
    }

    pub fn fail_task(&self, id: &str, reason: Option<&str>) -> Result<ManualCoordinationTask> {
        self.transition(
            id,
            TaskStatus::Failed,
            ", completed_at = ?, completion_notes = ?",
            vec![ts(clock::now_utc()), opt_text(non_blank(reason))],
        )
    }

    /// Cancelled tasks keep `completed_at` empty; only the reason is stored.
    pub fn cancel_task(&self, id: &str, reason: Option<&str>) -> Result<ManualCoordinationTask> {
        self.transition(
            id,
            TaskStatus::Cancelled,
            ", completion_notes = ?",
            vec![opt_text(non_blank(reason))],
        )
    }

    fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        extra_set: &str,
        extra_values: Vec<Value>,
    ) -> Result<ManualCoordinationTask> {
        let mut set = format!("task_status = ?{extra_set}");
        let mut values = vec![text(to.as_str())];
        values.extend(extra_values);
        if to.is_terminal() {
            set.push_str(", next_reminder_due = NULL");
        }
        let task = self.guarded_update(id, &set, values, &sources_for(to), None)?;
        debug!(task_id = id, status = %to, "task transitioned");
        Ok(task)
    }

    // ── Assignment ──────────────────────────────────────────────────

    pub fn assign_to_user(&self, id: &str, user_id: &str) -> Result<ManualCoordinationTask> {
        if user_id.trim().is_empty() {
            return Err(Error::Invalid("assignee must not be empty".into()));
        }
        self.guarded_update(
            id,
            "assigned_to_user_id = ?",
            vec![text(user_id)],
            &TaskStatus::ACTIVE,
            None,
        )
    }

    pub fn unassign_task(&self, id: &str) -> Result<ManualCoordinationTask> {
        self.guarded_update(
            id,
            "assigned_to_user_id = NULL",
            Vec::new(),
            &TaskStatus::ACTIVE,
            None,
        )
    }

    // ── Reminders ───────────────────────────────────────────────────

    /// Claim a due reminder. Succeeds only while the task is active and its
    /// `next_reminder_due` still equals `expected_due`; the due time is
    /// cleared so a competing sweeper holding the same value loses.
    pub fn mark_reminder_sent(
        &self,
        id: &str,
        expected_due: OffsetDateTime,
    ) -> Result<ManualCoordinationTask> {
        let task = self
            .guarded_update(
                id,
                "reminder_count = reminder_count + 1, last_reminder_sent = ?, next_reminder_due = NULL",
                vec![ts(clock::now_utc())],
                &TaskStatus::ACTIVE,
                Some(expected_due),
            )?;
        debug!(task_id = id, reminder_count = task.reminder_count, "reminder claimed");
        Ok(task)
    }

    pub fn set_next_reminder(
        &self,
        id: &str,
        when: OffsetDateTime,
    ) -> Result<ManualCoordinationTask> {
        self.guarded_update(
            id,
            "next_reminder_due = ?",
            vec![ts(when)],
            &TaskStatus::ACTIVE,
            None,
        )
    }

    /// Active tasks whose reminder is due at or before `now`, soonest first.
    pub fn get_tasks_due_for_reminder(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.by_reminder_due("<=", now)
    }

    pub fn get_tasks_for_reminder(
        &self,
        max_time: OffsetDateTime,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.by_reminder_due("<=", max_time)
    }

    pub fn get_overdue_tasks(&self) -> Result<Vec<ManualCoordinationTask>> {
        self.by_reminder_due("<", clock::now_utc())
    }

    pub fn get_overdue_tasks_before(
        &self,
        threshold: OffsetDateTime,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.by_reminder_due("<", threshold)
    }

    fn by_reminder_due(
        &self,
        op: &str,
        bound: OffsetDateTime,
    ) -> Result<Vec<ManualCoordinationTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM coordination_tasks
             WHERE next_reminder_due IS NOT NULL AND next_reminder_due {op} ?
               AND task_status IN ({})
             ORDER BY next_reminder_due ASC, rowid ASC",
            placeholders(TaskStatus::ACTIVE.len())
        );
        let mut values = vec![ts(bound)];
        values.extend(TaskStatus::ACTIVE.iter().map(|s| text(s.as_str())));
        self.query(&sql, values)
    }

    // ── Listings ────────────────────────────────────────────────────

    pub fn get_pending_tasks(&self, page: Page) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter::with_statuses(&[TaskStatus::Pending], page))
    }

    pub fn get_active_tasks(&self, page: Page) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter::with_statuses(&TaskStatus::ACTIVE, page))
    }

    pub fn get_unassigned_tasks(&self, page: Page) -> Result<Vec<ManualCoordinationTask>> {
        let mut filter = TaskFilter::with_statuses(&TaskStatus::ACTIVE, page);
        filter.unassigned_only = true;
        self.list(&filter)
    }

    pub fn get_by_assigned_user(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter {
            assigned_to: Some(user_id.to_string()),
            page,
            ..Default::default()
        })
    }

    pub fn get_by_provider_code(
        &self,
        provider_code: &str,
        page: Page,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter {
            provider_code: Some(provider_code.to_string()),
            page,
            ..Default::default()
        })
    }

    pub fn get_by_task_type(
        &self,
        task_type: &TaskType,
        page: Page,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter {
            task_type: Some(task_type.clone()),
            page,
            ..Default::default()
        })
    }

    pub fn get_by_status(
        &self,
        status: TaskStatus,
        page: Page,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter::with_statuses(&[status], page))
    }

    pub fn get_by_delivery_id(
        &self,
        delivery_id: &str,
        page: Page,
    ) -> Result<Vec<ManualCoordinationTask>> {
        self.list(&TaskFilter {
            delivery_id: Some(delivery_id.to_string()),
            page,
            ..Default::default()
        })
    }

    /// Filtered listing, newest first.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<ManualCoordinationTask>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.statuses.is_empty() {
            clauses.push(format!(
                "task_status IN ({})",
                placeholders(filter.statuses.len())
            ));
            values.extend(filter.statuses.iter().map(|s| text(s.as_str())));
        }
        if filter.unassigned_only {
            clauses.push("assigned_to_user_id IS NULL".to_string());
        } else if let Some(user) = &filter.assigned_to {
            clauses.push("assigned_to_user_id = ?".to_string());
            values.push(text(user.as_str()));
        }
        if let Some(provider) = &filter.provider_code {
            clauses.push("provider_code = ?".to_string());
            values.push(text(provider.as_str()));
        }
        if let Some(task_type) = &filter.task_type {
            clauses.push("task_type = ?".to_string());
            values.push(text(task_type.as_str()));
        }
        if let Some(delivery) = &filter.delivery_id {
            clauses.push("delivery_id = ?".to_string());
            values.push(text(delivery.as_str()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM coordination_tasks{where_sql}
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        values.extend(page_values(filter.page));
        self.query(&sql, values)
    }

    /// Task counts per status. Every status is present, zero included.
    pub fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>> {
        let mut out: BTreeMap<TaskStatus, u64> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut stmt = self
            .store
            .conn()
            .prepare("SELECT task_status, COUNT(*) FROM coordination_tasks GROUP BY task_status")
            .map_err(Error::store)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(Error::store)?;
        for row in rows {
            let (status, count) = row.map_err(Error::store)?;
            out.insert(status.parse()?, count.max(0) as u64);
        }
        Ok(out)
    }

    // ── Internal ────────────────────────────────────────────────────

    /// One conditional write. `set` uses positional `?` placeholders bound
    /// from `values`; `updated_at` is always refreshed. When
    /// `expected_due` is given, the row must also still carry that
    /// `next_reminder_due`.
    fn guarded_update(
        &self,
        id: &str,
        set: &str,
        mut values: Vec<Value>,
        allowed: &[TaskStatus],
        expected_due: Option<OffsetDateTime>,
    ) -> Result<ManualCoordinationTask> {
        let mut sql = format!(
            "UPDATE coordination_tasks SET {set}, updated_at = ?
             WHERE id = ? AND task_status IN ({})",
            placeholders(allowed.len())
        );
        values.push(ts(clock::now_utc()));
        values.push(text(id));
        values.extend(allowed.iter().map(|s| text(s.as_str())));
        if let Some(due) = expected_due {
            sql.push_str(" AND next_reminder_due = ?");
            values.push(ts(due));
        }
        sql.push_str(&format!(" RETURNING {TASK_COLUMNS}"));

        let row = self
            .store
            .conn()
            .query_row(&sql, params_from_iter(values), map_task_row)
            .optional()
            .map_err(Error::store)?;
        match row {
            Some(row) => row_to_task(row),
            None => Err(self.explain_miss(id, allowed, expected_due)),
        }
    }

    fn explain_miss(
        &self,
        id: &str,
        allowed: &[TaskStatus],
        expected_due: Option<OffsetDateTime>,
    ) -> Error {
        let current = match self.find(id) {
            Ok(Some(task)) => task,
            Ok(None) => return Error::not_found(entity::TASK, id),
            Err(e) => return e,
        };
        let reason = if !allowed.contains(&current.task_status) {
            format!("task is {}", current.task_status)
        } else if let Some(expected) = expected_due {
            format!(
                "reminder due {} no longer matches expected {}",
                describe_due(current.next_reminder_due),
                clock::format_timestamp(expected)
            )
        } else {
            format!("task is {}", current.task_status)
        };
        debug!(task_id = id, %reason, "task update rejected");
        Error::conflict(entity::TASK, id, reason)
    }

    fn find(&self, id: &str) -> Result<Option<ManualCoordinationTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM coordination_tasks WHERE id = ?1");
        let row = self
            .store
            .conn()
            .query_row(&sql, params![id], map_task_row)
            .optional()
            .map_err(Error::store)?;
        row.map(row_to_task).transpose()
    }

    fn query(&self, sql: &str, values: Vec<Value>) -> Result<Vec<ManualCoordinationTask>> {
        let mut stmt = self.store.conn().prepare(sql).map_err(Error::store)?;
        let rows = stmt
            .query_map(params_from_iter(values), map_task_row)
            .map_err(Error::store)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::store)?;
        rows.into_iter().map(row_to_task).collect()
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn describe_due(due: Option<OffsetDateTime>) -> String {
    due.map(clock::format_timestamp)
        .unwrap_or_else(|| "none".to_string())
}

struct TaskRow {
    id: String,
    delivery_id: String,
    provider_code: String,
    task_type: String,
    task_status: String,
    assigned_to_user_id: Option<String>,
    task_instructions: String,
    contact_information: String,
    completed_at: Option<String>,
    completion_notes: Option<String>,
    external_reference: Option<String>,
    reminder_count: i64,
    last_reminder_sent: Option<String>,
    next_reminder_due: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        delivery_id: row.get(1)?,
        provider_code: row.get(2)?,
        task_type: row.get(3)?,
        task_status: row.get(4)?,
        assigned_to_user_id: row.get(5)?,
        task_instructions: row.get(6)?,
        contact_information: row.get(7)?,
        completed_at: row.get(8)?,
        completion_notes: row.get(9)?,
        external_reference: row.get(10)?,
        reminder_count: row.get(11)?,
        last_reminder_sent: row.get(12)?,
        next_reminder_due: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_task(row: TaskRow) -> Result<ManualCoordinationTask> {
    Ok(ManualCoordinationTask {
        id: row.id,
        delivery_id: row.delivery_id,
        provider_code: row.provider_code,
        task_type: row.task_type.parse()?,
        task_status: row.task_status.parse()?,
        assigned_to_user_id: row.assigned_to_user_id,
        task_instructions: row.task_instructions,
        contact_information: serde_json::from_str(&row.contact_information)?,
        completed_at: parse_opt_ts(row.completed_at)?,
        completion_notes: row.completion_notes,
        external_reference: row.external_reference,
        reminder_count: u32::try_from(row.reminder_count)
            .map_err(|_| Error::Invalid(format!("corrupt reminder_count {}", row.reminder_count)))?,
        last_reminder_sent: parse_opt_ts(row.last_reminder_sent)?,
        next_reminder_due: parse_opt_ts(row.next_reminder_due)?,
        created_at: clock::parse_timestamp(&row.created_at)?,
        updated_at: clock::parse_timestamp(&row.updated_at)?,
    })
}
