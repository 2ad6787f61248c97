use crate::window::WindowArgs;
use clap::{Subcommand, ValueEnum};
use std::path::Path;
use waybill_core::clock;
use waybill_ledger::{Dimension, Ledger};

#[derive(Clone, Copy, ValueEnum)]
pub enum ByArg {
    Type,
    Provider,
    Status,
}

#[derive(Subcommand)]
pub enum ReportCmd {
    /// Snapshot counts grouped by a dimension
    Counts {
        #[arg(long, value_enum, default_value = "type")]
        by: ByArg,
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        json: bool,
    },
    /// Delivered snapshots per distinct delivery in the window
    Completion {
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Delivered fees per provider
    Revenue {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        json: bool,
    },
    /// One provider's delivered fees on a business day
    Fees {
        #[arg(long)]
        provider: String,
        /// Business date (YYYY-MM-DD, default: today in the business offset)
        #[arg(long)]
        date: Option<String>,
    },
}

pub fn run(cmd: ReportCmd, repo_root: &Path) -> anyhow::Result<()> {
    let ledger = Ledger::open(repo_root)?;
    let log = ledger.snapshot_log()?;
    let offset = log.business_offset();

    match cmd {
        ReportCmd::Counts { by, window, json } => {
            let dimension = match by {
                ByArg::Type => Dimension::Type,
                ByArg::Provider => Dimension::Provider,
                ByArg::Status => Dimension::Status,
            };
            let counts = log.count_by(dimension, window.resolve(offset)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else if counts.is_empty() {
                println!("(no snapshots in window)");
            } else {
                for (key, count) in &counts {
                    println!("{key:<24} {count}");
                }
            }
        }
        ReportCmd::Completion { window } => {
            let window = window.resolve(offset)?;
            let rate = log.get_delivery_completion_rate(window)?;
            println!(
                "{:.1}% completed between {} and {}",
                rate * 100.0,
                clock::format_timestamp(window.start),
                clock::format_timestamp(window.end)
            );
        }
        ReportCmd::Revenue { window, json } => {
            let revenue = log.get_revenue_from_snapshots(window.resolve(offset)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&revenue)?);
            } else if revenue.is_empty() {
                println!("(no delivered fees in window)");
            } else {
                for (provider, total) in &revenue {
                    println!("{provider:<24} {total}");
                }
            }
        }
        ReportCmd::Fees { provider, date } => {
            let date = match date {
                Some(d) => clock::parse_date(&d)?,
                None => clock::business_date(clock::now_utc(), offset),
            };
            let total = log.get_delivery_fees_from_snapshots(&provider, date)?;
            println!("{provider} {} {total}", clock::format_date(date));
        }
    }
    Ok(())
}
