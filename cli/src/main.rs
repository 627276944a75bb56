use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use histlog_kernel::broker::FileBroker;
use histlog_kernel::config::HistoryConfig;
use histlog_kernel::{DatabaseHistory, Document, HistoryRecord, TopicDatabaseHistory};

/// Schema history CLI
#[derive(Parser, Debug)]
#[command(name = "histlog")]
#[command(about = "Record and replay database schema history", long_about = None)]
struct Cli {
    /// Path to a JSON object of `database.history.*` properties
    #[arg(long)]
    config: PathBuf,

    /// Directory holding the history log
    #[arg(long)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append one schema change to the history
    Record {
        /// Database the DDL applies to
        #[arg(long)]
        database: Option<String>,

        /// DDL statement(s)
        #[arg(long)]
        ddl: String,

        /// Source attribute as key=value (repeatable)
        #[arg(long = "source", value_parser = parse_pair)]
        source: Vec<(String, String)>,

        /// Position attribute as key=value (repeatable)
        #[arg(long = "position", value_parser = parse_pair)]
        position: Vec<(String, String)>,
    },

    /// Replay the history and print each record as a JSON line
    Recover,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn document(pairs: Vec<(String, String)>) -> Document {
    pairs
        .into_iter()
        .map(|(key, value)| {
            // Numbers and booleans keep their JSON type.
            let value = serde_json::from_str::<Value>(&value)
                .ok()
                .filter(|v| v.is_number() || v.is_boolean())
                .unwrap_or(Value::String(value));
            (key, value)
        })
        .collect()
}

fn load_properties(path: &Path) -> Result<BTreeMap<String, String>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let raw: BTreeMap<String, Value> = serde_json::from_str(&data)
        .with_context(|| format!("parsing config {}", path.display()))?;

    let mut props = BTreeMap::new();
    for (key, value) in raw {
        let value = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => bail!("property `{key}` must be a string, number or boolean, got {other}"),
        };
        props.insert(key, value);
    }
    Ok(props)
}

/// Start, record one change, stop. A failed record wins over a failed stop.
fn record_change<H: DatabaseHistory>(
    history: &H,
    source: Document,
    position: Document,
    database: Option<&str>,
    ddl: &str,
) -> Result<()> {
    history.start()?;
    let stored = history.record(source, position, database, ddl);
    let stopped = history.stop();
    stored.context("recording schema change")?;
    stopped.context("stopping database history")?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("histlog=info,histlog_kernel=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load configuration
    // ----------------------------
    let props = load_properties(&cli.config)?;
    let config = HistoryConfig::from_properties(&props)?;
    let history = TopicDatabaseHistory::new(config, FileBroker::new(&cli.dir));
    tracing::info!("using database history {history}");

    match cli.command {
        Command::Record {
            database,
            ddl,
            source,
            position,
        } => {
            record_change(
                &history,
                document(source),
                document(position),
                database.as_deref(),
                &ddl,
            )?;
        }
        Command::Recover => {
            let mut records: Vec<HistoryRecord> = Vec::new();
            history.recover(&mut records, |records, record| records.push(record))?;
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
            tracing::info!("recovered {} records", records.len());
        }
    }

    Ok(())
}
