use crate::window::parse_instant;
use clap::Subcommand;
use std::path::Path;
use time::Duration;
use waybill_core::{
    clock, ManualCoordinationTask, NewTask, NotificationKind, Page, TaskFilter, TaskStatus,
    TaskType,
};
use waybill_ledger::{Ledger, TaskTracker};

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum TaskCmd {
    /// Create a coordination task
    Create {
        #[arg(long)]
        delivery: String,
        #[arg(long)]
        provider: String,
        /// Task type (pickup_call, delivery_confirmation, cod_follow_up, or any tag)
        #[arg(long = "type")]
        task_type: TaskType,
        /// What the operator should do
        #[arg(long, default_value = "")]
        instructions: String,
        /// Contact details as a JSON object
        #[arg(long)]
        contact: Option<String>,
        /// Assign to a user right away
        #[arg(long)]
        assign: Option<String>,
        /// First reminder: RFC 3339 timestamp or YYYY-MM-DD
        #[arg(long, conflicts_with = "remind_in")]
        remind_at: Option<String>,
        /// First reminder in N minutes
        #[arg(long)]
        remind_in: Option<u32>,
        /// Print the task-created notification as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a pending task to in-progress
    Start { id: String },
    /// Assign a task to a user
    Assign { id: String, user: String },
    /// Clear a task's assignee
    Unassign { id: String },
    /// Complete a task
    Complete {
        id: String,
        #[arg(long)]
        notes: Option<String>,
        /// External reference (ticket, call id, ...)
        #[arg(long = "ref")]
        external_reference: Option<String>,
        /// Print the outcome notification as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a task failed
    Fail {
        id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Cancel a task
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show one task
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List tasks, newest first
    List {
        /// Status (repeatable; default: all)
        #[arg(long = "status")]
        statuses: Vec<TaskStatus>,
        #[arg(long, conflicts_with = "unassigned")]
        assignee: Option<String>,
        /// Only tasks without an assignee
        #[arg(long)]
        unassigned: bool,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long = "type")]
        task_type: Option<TaskType>,
        #[arg(long)]
        delivery: Option<String>,
        /// Maximum number of tasks (0 = unlimited)
        #[arg(long, default_value_t = Page::DEFAULT_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long)]
        json: bool,
    },
    /// Active tasks whose reminder is due
    Due {
        /// Horizon: RFC 3339 timestamp or YYYY-MM-DD (default: now)
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Active tasks whose reminder is past due
    Overdue {
        /// Only tasks overdue before this instant (default: now)
        #[arg(long)]
        before: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Claim every due reminder and schedule the next one
    Remind {
        /// Minutes until the next reminder (default: reminders.interval_minutes)
        #[arg(long)]
        interval: Option<u32>,
        /// List what would be claimed without writing
        #[arg(long)]
        dry_run: bool,
    },
}

// ── Dispatch ──

pub fn run(cmd: TaskCmd, repo_root: &Path) -> anyhow::Result<()> {
    let ledger = Ledger::open(repo_root)?;
    let tracker = ledger.task_tracker()?;
    let offset = ledger.config.business_offset()?;

    match cmd {
        TaskCmd::Create {
            delivery,
            provider,
            task_type,
            instructions,
            contact,
            assign,
            remind_at,
            remind_in,
            json,
        } => {
            let mut new = NewTask::new(delivery, provider, task_type, instructions);
            if let Some(contact) = contact {
                let value: serde_json::Value = serde_json::from_str(&contact)
                    .map_err(|e| anyhow::anyhow!("--contact is not valid JSON: {e}"))?;
                new = new.with_contact(value);
            }
            if let Some(user) = assign {
                new = new.assigned_to(user);
            }
            if let Some(at) = remind_at {
                new = new.remind_at(parse_instant(&at, offset)?);
            } else if let Some(minutes) = remind_in {
                new = new.remind_at(clock::now_utc() + Duration::minutes(i64::from(minutes)));
            }
            let task = tracker.create(new)?;
            if json {
                let note = task.notification(NotificationKind::TaskCreated);
                println!("{}", serde_json::to_string_pretty(&note)?);
            } else {
                println!("{}", task.id);
            }
            Ok(())
        }
        TaskCmd::Start { id } => print_task(&tracker.start_task(&id)?, false),
        TaskCmd::Assign { id, user } => print_task(&tracker.assign_to_user(&id, &user)?, false),
        TaskCmd::Unassign { id } => print_task(&tracker.unassign_task(&id)?, false),
        TaskCmd::Complete {
            id,
            notes,
            external_reference,
            json,
        } => print_outcome(
            &tracker.complete_task(&id, notes.as_deref(), external_reference.as_deref())?,
            json,
        ),
        TaskCmd::Fail { id, reason, json } => {
            print_outcome(&tracker.fail_task(&id, reason.as_deref())?, json)
        }
        TaskCmd::Cancel { id, reason, json } => {
            print_outcome(&tracker.cancel_task(&id, reason.as_deref())?, json)
        }
        TaskCmd::Show { id, json } => print_task(&tracker.get_task(&id)?, json),
        TaskCmd::List {
            statuses,
            assignee,
            unassigned,
            provider,
            task_type,
            delivery,
            limit,
            offset: page_offset,
            json,
        } => {
            let filter = TaskFilter {
                statuses,
                assigned_to: assignee,
                unassigned_only: unassigned,
                provider_code: provider,
                task_type,
                delivery_id: delivery,
                page: Page::new(limit, page_offset),
            };
            print_tasks(&tracker.list(&filter)?, json)
        }
        TaskCmd::Due { at, json } => {
            let horizon = match at {
                Some(at) => parse_instant(&at, offset)?,
                None => clock::now_utc(),
            };
            print_tasks(&tracker.get_tasks_due_for_reminder(horizon)?, json)
        }
        TaskCmd::Overdue { before, json } => {
            let tasks = match before {
                Some(before) => tracker.get_overdue_tasks_before(parse_instant(&before, offset)?)?,
                None => tracker.get_overdue_tasks()?,
            };
            print_tasks(&tasks, json)
        }
        TaskCmd::Remind { interval, dry_run } => {
            let interval = match interval {
                Some(minutes) => Duration::minutes(i64::from(minutes)),
                None => ledger.config.reminder_interval(),
            };
            remind(&tracker, interval, dry_run)
        }
    }
}

// ── Command Implementations ──

/// One sweep: claim each due task, then re-arm it at `now + interval`.
/// A claim lost to a concurrent sweeper is skipped.
fn remind(
    tracker: &TaskTracker,
    interval: Duration,
    dry_run: bool,
) -> anyhow::Result<()> {
    let now = clock::now_utc();
    let due = tracker.get_tasks_due_for_reminder(now)?;
    if due.is_empty() {
        println!("No reminders due.");
        return Ok(());
    }

    let mut sent = 0usize;
    let mut skipped = 0usize;
    for task in &due {
        let Some(expected) = task.next_reminder_due else {
            continue;
        };
        if dry_run {
            println!("  would remind {} ({})", task.id, describe(task));
            continue;
        }
        let claimed = match tracker.mark_reminder_sent(&task.id, expected) {
            Ok(t) => t,
            Err(e) if e.is_conflict() || e.is_not_found() => {
                tracing::debug!(task_id = %task.id, error = %e, "reminder claim lost");
                skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let next = now + interval;
        match tracker.set_next_reminder(&claimed.id, next) {
            Ok(_) => {}
            // Closed between claim and reschedule; nothing left to remind.
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e.into()),
        }
        println!(
            "  reminded {} (#{}, next {})",
            claimed.id,
            claimed.reminder_count,
            clock::format_timestamp(next)
        );
        sent += 1;
    }

    if dry_run {
        println!("{} reminders due (dry run)", due.len());
    } else {
        println!("Sent {sent} reminders, {skipped} claimed elsewhere");
    }
    Ok(())
}

fn describe(task: &ManualCoordinationTask) -> String {
    let due = task
        .next_reminder_due
        .map(clock::format_timestamp)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} {} for {}, due {due}",
        task.provider_code, task.task_type, task.delivery_id
    )
}

fn print_outcome(task: &ManualCoordinationTask, json: bool) -> anyhow::Result<()> {
    if json {
        if let Some(note) = task.outcome_notification() {
            println!("{}", serde_json::to_string_pretty(&note)?);
            return Ok(());
        }
    }
    print_task(task, false)
}

fn print_task(task: &ManualCoordinationTask, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(task)?);
        return Ok(());
    }
    println!("{}  [{}]", task.id, task.task_status);
    println!("  delivery:  {}", task.delivery_id);
    println!("  provider:  {}", task.provider_code);
    println!("  type:      {}", task.task_type);
    println!(
        "  assignee:  {}",
        task.assigned_to_user_id.as_deref().unwrap_or("-")
    );
    if !task.task_instructions.is_empty() {
        println!("  do:        {}", task.task_instructions);
    }
    println!(
        "  reminders: {} sent, next {}",
        task.reminder_count,
        task.next_reminder_due
            .map(clock::format_timestamp)
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(notes) = &task.completion_notes {
        println!("  notes:     {notes}");
    }
    if let Some(reference) = &task.external_reference {
        println!("  ref:       {reference}");
    }
    Ok(())
}

fn print_tasks(tasks: &[ManualCoordinationTask], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("(no tasks)");
        return Ok(());
    }
    for t in tasks {
        println!(
            "{}  {:<11}  {:<22}  {}  {}",
            t.id,
            t.task_status.as_str(),
            t.task_type.as_str(),
            t.delivery_id,
            t.assigned_to_user_id.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
