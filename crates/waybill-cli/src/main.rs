mod cmd_config;
mod cmd_gc;
mod cmd_init;
mod cmd_report;
mod cmd_snapshot;
mod cmd_task;
mod window;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use waybill_ledger::WaybillPaths;

#[derive(Parser)]
#[command(
    name = "waybill",
    version,
    about = "Delivery snapshot log and manual coordination tasks"
)]
struct Cli {
    /// Log library events at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a new .waybill/ workspace in the current directory
    Init,
    /// Manage workspace configuration
    Config {
        #[command(subcommand)]
        cmd: cmd_config::ConfigCmd,
    },
    /// Append and inspect delivery snapshots
    Snapshot {
        #[command(subcommand)]
        cmd: cmd_snapshot::SnapshotCmd,
    },
    /// Drive manual coordination tasks
    Task {
        #[command(subcommand)]
        cmd: cmd_task::TaskCmd,
    },
    /// Aggregates over the snapshot log
    Report {
        #[command(subcommand)]
        cmd: cmd_report::ReportCmd,
    },
    /// Archive or purge old snapshots
    Gc {
        #[command(subcommand)]
        cmd: cmd_gc::GcCmd,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// The nearest ancestor holding `.waybill/`, or the current directory.
fn workspace_root(cwd: PathBuf) -> PathBuf {
    WaybillPaths::find_root(&cwd).unwrap_or(cwd)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cwd = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => cmd_init::execute(&cwd),
        Command::Config { cmd } => cmd_config::run(cmd, &workspace_root(cwd)),
        Command::Snapshot { cmd } => cmd_snapshot::run(cmd, &workspace_root(cwd)),
        Command::Task { cmd } => cmd_task::run(cmd, &workspace_root(cwd)),
        Command::Report { cmd } => cmd_report::run(cmd, &workspace_root(cwd)),
        Command::Gc { cmd } => cmd_gc::run(cmd, &workspace_root(cwd)),
    }
}
