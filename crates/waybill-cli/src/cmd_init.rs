use std::path::Path;
use waybill_ledger::{Ledger, WaybillPaths};

pub fn execute(repo_root: &Path) -> anyhow::Result<()> {
    let paths = WaybillPaths::discover(repo_root);
    let existed = paths.is_initialized();

    let ledger = Ledger::init(repo_root)?;
    if existed {
        println!("Already initialized at {}", ledger.paths.waybill_dir.display());
        return Ok(());
    }

    println!("Initialized .waybill/ at {}", ledger.paths.root.display());
    println!("  database: {}", ledger.paths.ledger_db.display());
    println!("  config:   {}", ledger.paths.config_json.display());
    Ok(())
}
