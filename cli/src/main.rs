use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};

use keel_kernel::config::PrepConfig;
use keel_kernel::job::{run_prep_job, JobOutcome};
use keel_kernel::schema::TableAction;
use keel_kernel::status::{JobStatus, RunId, StatusError, StatusNotifier, StatusRecord};
use keel_kernel::store::InMemoryStore;

/// Keel pipeline bootstrap CLI
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(about = "Provision pipeline tables and consolidate metadata (dry-run)", long_about = None)]
struct Cli {
    /// Path to prep config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Table name prefix for the built-in config
    #[arg(long, default_value = "keel_")]
    prefix: String,

    /// Drop and rebuild the metadata table
    #[arg(long)]
    first_run: bool,

    /// Path to sorted metadata fragments, one JSON object per line
    #[arg(long)]
    fragments: PathBuf,

    /// Where to write job status updates
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// One line of the fragments file.
#[derive(Debug, Deserialize)]
struct FragmentLine {
    #[serde(rename = "type")]
    type_key: String,
    payload: serde_json::Value,
}

/// Writes the latest status record to a file.
struct StatusFile {
    path: Option<PathBuf>,
}

impl StatusNotifier for StatusFile {
    fn update(&mut self, run_id: RunId, status: JobStatus) -> Result<(), StatusError> {
        info!(%run_id, ?status, "job status");
        let Some(path) = &self.path else {
            return Ok(());
        };

        let record = StatusRecord { run_id, status };
        let failed = |reason: String| StatusError { status, reason };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| failed(e.to_string()))?;
        fs::write(path, json).map_err(|e| failed(format!("{}: {e}", path.display())))
    }
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    run_id: String,
    tables: BTreeMap<String, TableAction>,
    warnings: Vec<String>,
    records: BTreeMap<String, usize>,
    committed: usize,
}

impl From<&JobOutcome> for CliOutput {
    fn from(outcome: &JobOutcome) -> Self {
        Self {
            run_id: outcome.run_id.to_string(),
            tables: outcome
                .provision
                .outcomes
                .iter()
                .map(|o| (o.table.clone(), o.action))
                .collect(),
            warnings: outcome
                .provision
                .warnings
                .iter()
                .map(ToString::to_string)
                .collect(),
            records: outcome
                .merge
                .records
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
            committed: outcome.committed,
        }
    }
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => bail!("invalid log level '{other}', expected one of [trace, debug, info, warn, error]"),
    }
}

fn read_fragments(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading fragments from {}", path.display()))?;

    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| -> Result<(String, Vec<u8>)> {
            let parsed: FragmentLine = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed fragment line", path.display(), n + 1))?;
            Ok((parsed.type_key, serde_json::to_vec(&parsed.payload)?))
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_level(&cli.log_level)?)
        .with_target(true)
        .init();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config from {}", path.display()))?;
            PrepConfig::from_json(&data)?
        }
        None => PrepConfig::default_config(&cli.prefix, false),
    }
    .with_first_run(cli.first_run);

    // ----------------------------
    // Load fragments
    // ----------------------------
    let fragments = read_fragments(&cli.fragments)?;

    // ----------------------------
    // Run job
    // ----------------------------
    let store = InMemoryStore::new();
    let mut sink = store.clone();
    let mut notifier = StatusFile {
        path: cli.status_file,
    };
    let outcome = run_prep_job(&config, store, &mut sink, fragments, &mut notifier)?;

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput::from(&outcome);
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
