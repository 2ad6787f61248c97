use crate::window::parse_instant;
use clap::{Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::path::Path;
use time::OffsetDateTime;
use waybill_core::{
    clock, ArchivedFilter, ChainIssue, DeliveryFacts, NewSnapshot, Page, Snapshot,
    SnapshotFilter, SnapshotType, TimeWindow,
};
use waybill_ledger::Ledger;

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum SnapshotCmd {
    /// Append a snapshot to a delivery's chain
    Append {
        /// Delivery identifier
        #[arg(long)]
        delivery: String,
        /// Snapshot type (created, assigned, picked_up, in_transit, delivered, failed, cancelled)
        #[arg(long = "type")]
        snapshot_type: SnapshotType,
        /// Actor or subsystem that caused the change
        #[arg(long, default_value = "cli")]
        by: String,
        /// Event name that caused the change
        #[arg(long, default_value = "manual")]
        event: String,
        /// Acting user id
        #[arg(long)]
        user: Option<String>,
        /// Expected current latest snapshot (rejected if stale)
        #[arg(long)]
        previous: Option<String>,
        /// Snapshot payload as a JSON object
        #[arg(long)]
        data: Option<String>,
        #[command(flatten)]
        facts: FactArgs,
    },
    /// Show a delivery's snapshots, oldest first
    Timeline {
        delivery: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a delivery's latest snapshot
    Latest {
        delivery: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search snapshots across deliveries
    List(ListArgs),
    /// Recompute hashes and links along a delivery's chain
    Verify { delivery: String },
}

#[derive(clap::Args)]
pub struct FactArgs {
    /// Delivery status at the time of the snapshot
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    customer: Option<String>,
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    vehicle: Option<String>,
    #[arg(long)]
    driver: Option<String>,
    #[arg(long)]
    province: Option<String>,
    /// Delivery fee (decimal, e.g. 45.50)
    #[arg(long)]
    fee: Option<Decimal>,
    /// Provider code
    #[arg(long)]
    provider: Option<String>,
}

impl From<FactArgs> for DeliveryFacts {
    fn from(a: FactArgs) -> Self {
        DeliveryFacts {
            delivery_status: a.status,
            customer_id: a.customer,
            order_id: a.order,
            vehicle_id: a.vehicle,
            driver_name: a.driver,
            delivery_address_province: a.province,
            delivery_fee: a.fee,
            provider_code: a.provider,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ArchivedArg {
    Any,
    Only,
    Exclude,
}

#[derive(clap::Args)]
pub struct ListArgs {
    #[arg(long)]
    delivery: Option<String>,
    /// Snapshot type (repeatable)
    #[arg(long = "type")]
    types: Vec<SnapshotType>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    customer: Option<String>,
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    vehicle: Option<String>,
    #[arg(long)]
    province: Option<String>,
    /// Business date (YYYY-MM-DD)
    #[arg(long)]
    date: Option<String>,
    /// Created at or after (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    since: Option<String>,
    /// Created before (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    until: Option<String>,
    #[arg(long, value_enum, default_value = "any")]
    archived: ArchivedArg,
    /// Newest first instead of oldest first
    #[arg(long)]
    newest: bool,
    /// Maximum number of snapshots (0 = unlimited)
    #[arg(long, default_value_t = Page::DEFAULT_LIMIT)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

// ── Dispatch ──

pub fn run(cmd: SnapshotCmd, repo_root: &Path) -> anyhow::Result<()> {
    let ledger = Ledger::open(repo_root)?;
    match cmd {
        SnapshotCmd::Append {
            delivery,
            snapshot_type,
            by,
            event,
            user,
            previous,
            data,
            facts,
        } => {
            let mut new = NewSnapshot::new(delivery, snapshot_type, by, event).with_facts(facts.into());
            if let Some(data) = data {
                let value: serde_json::Value = serde_json::from_str(&data)
                    .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))?;
                new = new.with_data(value);
            }
            if let Some(user) = user {
                new = new.with_user(user);
            }
            if let Some(previous) = previous {
                new = new.with_previous(previous);
            }
            append(&ledger, new)
        }
        SnapshotCmd::Timeline { delivery, json } => {
            let timeline = ledger.snapshot_log()?.get_delivery_timeline(&delivery)?;
            print_snapshots(&timeline, json)
        }
        SnapshotCmd::Latest { delivery, json } => {
            let latest = ledger.snapshot_log()?.get_latest_by_delivery_id(&delivery)?;
            print_snapshots(std::slice::from_ref(&latest), json)
        }
        SnapshotCmd::List(args) => list(&ledger, args),
        SnapshotCmd::Verify { delivery } => verify(&ledger, &delivery),
    }
}

// ── Command Implementations ──

fn append(ledger: &Ledger, new: NewSnapshot) -> anyhow::Result<()> {
    let snapshot = ledger.snapshot_log()?.append(new)?;
    println!("{}", snapshot.id);
    println!(
        "  {} {} after {}",
        snapshot.delivery_id,
        snapshot.snapshot_type,
        snapshot.previous_snapshot_id.as_deref().unwrap_or("(first)")
    );
    println!("  hash {}", snapshot.hash);
    Ok(())
}

fn list(ledger: &Ledger, args: ListArgs) -> anyhow::Result<()> {
    let log = ledger.snapshot_log()?;
    let offset = log.business_offset();

    let mut filter = SnapshotFilter::default()
        .of_types(&args.types)
        .page(Page::new(args.limit, args.offset))
        .archived(match args.archived {
            ArchivedArg::Any => ArchivedFilter::Any,
            ArchivedArg::Only => ArchivedFilter::Only,
            ArchivedArg::Exclude => ArchivedFilter::Exclude,
        });
    filter.delivery_id = args.delivery;
    filter.provider_code = args.provider;
    filter.delivery_status = args.status;
    filter.customer_id = args.customer;
    filter.order_id = args.order;
    filter.vehicle_id = args.vehicle;
    filter.province = args.province;
    if let Some(date) = &args.date {
        filter = filter.on_business_date(clock::parse_date(date)?);
    }
    if args.since.is_some() || args.until.is_some() {
        let start = match &args.since {
            Some(s) => parse_instant(s, offset)?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        let end = match &args.until {
            Some(s) => parse_instant(s, offset)?,
            None => clock::now_utc() + time::Duration::SECOND,
        };
        filter = filter.within(TimeWindow::new(start, end)?);
    }
    if args.newest {
        filter = filter.newest_first();
    }

    let snapshots = log.search_snapshots(&filter)?;
    print_snapshots(&snapshots, args.json)
}

fn verify(ledger: &Ledger, delivery: &str) -> anyhow::Result<()> {
    let report = ledger.snapshot_log()?.verify_delivery_chain(delivery)?;
    if report.is_intact() {
        println!("{delivery}: {} snapshots, chain intact", report.checked);
        return Ok(());
    }
    for issue in &report.issues {
        match issue {
            ChainIssue::HashMismatch { snapshot_id } => {
                println!("  {snapshot_id}: content does not match its hash");
            }
            ChainIssue::BrokenLink {
                snapshot_id,
                expected_previous,
                actual_previous,
            } => {
                println!(
                    "  {snapshot_id}: links to {} but predecessor is {}",
                    actual_previous.as_deref().unwrap_or("(none)"),
                    expected_previous.as_deref().unwrap_or("(none)")
                );
            }
            ChainIssue::ForeignDelivery {
                snapshot_id,
                delivery_id,
            } => {
                println!("  {snapshot_id}: belongs to delivery {delivery_id}");
            }
        }
    }
    anyhow::bail!(
        "{delivery}: chain verification failed ({} issues in {} snapshots)",
        report.issues.len(),
        report.checked
    )
}

fn print_snapshots(snapshots: &[Snapshot], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshots)?);
        return Ok(());
    }
    if snapshots.is_empty() {
        println!("(no snapshots)");
        return Ok(());
    }
    for s in snapshots {
        let archived = if s.archived_at.is_some() { " [archived]" } else { "" };
        println!(
            "{}  {}  {:<10}  {}  {} by {}{archived}",
            clock::format_timestamp(s.created_at),
            s.delivery_id,
            s.snapshot_type.as_str(),
            s.id,
            s.triggered_event,
            s.triggered_by,
        );
    }
    Ok(())
}
