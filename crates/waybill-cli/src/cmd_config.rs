use clap::Subcommand;
use std::io::Write;
use std::path::Path;
use waybill_ledger::{LedgerConfig, WaybillPaths};

// ── CLI Schema ──

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Set a config value
    Set {
        /// Config key (e.g. retention.archive_after_days)
        key: String,
        /// Config value (true/false/number/string)
        value: String,
    },
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },
    /// List all config values
    List,
}

// ── Dispatch ──

pub fn run(cmd: ConfigCmd, repo_root: &Path) -> anyhow::Result<()> {
    let paths = WaybillPaths::discover(repo_root);
    if !paths.is_initialized() {
        anyhow::bail!("No .waybill/ workspace found. Run `waybill init` first.");
    }
    match cmd {
        ConfigCmd::Set { key, value } => set(&paths, &key, &value),
        ConfigCmd::Get { key } => get(&paths, &key),
        ConfigCmd::List => list(&paths),
    }
}

// ── Command Implementations ──

type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Read `.waybill/config.json` as a flat map. Missing file means empty.
fn read_config(path: &Path) -> anyhow::Result<ConfigMap> {
    if !path.exists() {
        return Ok(ConfigMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str(&content)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} is not a JSON object", path.display()),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

/// Parse a string value into an appropriate JSON value (bool/number/string).
fn parse_value(s: &str) -> serde_json::Value {
    match s {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => {
            if let Ok(n) = s.parse::<i64>() {
                serde_json::Value::Number(n.into())
            } else if let Ok(f) = s.parse::<f64>() {
                serde_json::json!(f)
            } else {
                serde_json::Value::String(s.to_string())
            }
        }
    }
}

/// `waybill config set <key> <value>`
///
/// The resulting file must still load as a valid `LedgerConfig`; a value
/// that would break it is rejected before anything is written.
fn set(paths: &WaybillPaths, key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = read_config(&paths.config_json)?;
    config.insert(key.to_string(), parse_value(value));

    let candidate: LedgerConfig =
        serde_json::from_value(serde_json::Value::Object(config.clone()))
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}"))?;
    candidate.validate()?;

    let json = serde_json::to_string_pretty(&config)?;
    write_atomic(&paths.config_json, format!("{json}\n").as_bytes())?;
    println!("{key} = {value}");
    Ok(())
}

/// `waybill config get <key>`
fn get(paths: &WaybillPaths, key: &str) -> anyhow::Result<()> {
    let config = read_config(&paths.config_json)?;
    match config.get(key) {
        Some(val) => println!("{val}"),
        None => println!("(not set)"),
    }
    Ok(())
}

/// `waybill config list`
fn list(paths: &WaybillPaths) -> anyhow::Result<()> {
    let config = read_config(&paths.config_json)?;
    if config.is_empty() {
        println!("(no config set)");
    } else {
        for (k, v) in &config {
            println!("{k} = {v}");
        }
    }
    Ok(())
}
