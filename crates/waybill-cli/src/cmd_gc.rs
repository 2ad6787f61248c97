use clap::Subcommand;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use waybill_core::{clock, ArchivedFilter, SnapshotFilter, TimeWindow};
use waybill_ledger::{Ledger, SnapshotLog};

#[derive(Subcommand)]
pub enum GcCmd {
    /// Tag snapshots older than N days as archived (content and hashes stay)
    Archive {
        /// Age in days (default: retention.archive_after_days)
        #[arg(long)]
        days: Option<u32>,
        /// Report what would be archived without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Permanently delete snapshots older than N days
    Purge {
        /// Age in days (default: retention.delete_after_days)
        #[arg(long)]
        days: Option<u32>,
        /// Report what would be deleted without writing
        #[arg(long)]
        dry_run: bool,
        /// Required to actually delete
        #[arg(long)]
        force: bool,
    },
}

pub fn run(cmd: GcCmd, repo_root: &Path) -> anyhow::Result<()> {
    let ledger = Ledger::open(repo_root)?;
    let log = ledger.snapshot_log()?;

    match cmd {
        GcCmd::Archive { days, dry_run } => {
            let days = days.unwrap_or(ledger.config.archive_after_days);
            let cutoff = cutoff(days);
            if dry_run {
                let n = count_older_than(&log, cutoff, ArchivedFilter::Exclude)?;
                println!("Would archive {n} snapshots created before {}", clock::format_timestamp(cutoff));
                return Ok(());
            }
            let n = log.archive_snapshots_older_than(cutoff)?;
            println!("Archived {n} snapshots created before {}", clock::format_timestamp(cutoff));
        }
        GcCmd::Purge {
            days,
            dry_run,
            force,
        } => {
            let days = match days {
                Some(d) => d,
                None if ledger.config.delete_after_days == 0 => {
                    anyhow::bail!(
                        "purge is disabled (retention.delete_after_days = 0); pass --days explicitly"
                    )
                }
                None => ledger.config.delete_after_days,
            };
            let cutoff = cutoff(days);
            if dry_run {
                let n = count_older_than(&log, cutoff, ArchivedFilter::Any)?;
                println!("Would delete {n} snapshots created before {}", clock::format_timestamp(cutoff));
                return Ok(());
            }
            if !force {
                anyhow::bail!("purge permanently deletes snapshots; re-run with --force");
            }
            let n = log.delete_snapshots_older_than(cutoff)?;
            println!("Deleted {n} snapshots created before {}", clock::format_timestamp(cutoff));
        }
    }
    Ok(())
}

fn cutoff(days: u32) -> OffsetDateTime {
    clock::now_utc() - Duration::days(i64::from(days))
}

fn count_older_than(
    log: &SnapshotLog,
    cutoff: OffsetDateTime,
    archived: ArchivedFilter,
) -> anyhow::Result<u64> {
    let window = TimeWindow::new(OffsetDateTime::UNIX_EPOCH, cutoff)?;
    let filter = SnapshotFilter::all().within(window).archived(archived);
    Ok(log.count_snapshots(&filter)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waybill_core::{NewSnapshot, SnapshotType};

    #[test]
    fn dry_run_counts_respect_archived_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::init(tmp.path()).unwrap();
        let log = ledger.snapshot_log().unwrap();
        for d in ["D1", "D2", "D3"] {
            log.append(NewSnapshot::new(d, SnapshotType::Created, "dispatcher", "created"))
                .unwrap();
        }

        let later = clock::now_utc() + Duration::SECOND;
        assert_eq!(count_older_than(&log, later, ArchivedFilter::Exclude).unwrap(), 3);
        assert_eq!(count_older_than(&log, cutoff(1), ArchivedFilter::Any).unwrap(), 0);

        log.archive_snapshots_older_than(later).unwrap();
        assert_eq!(count_older_than(&log, later, ArchivedFilter::Exclude).unwrap(), 0);
        assert_eq!(count_older_than(&log, later, ArchivedFilter::Any).unwrap(), 3);
    }
}
