//! Thermolog administration tool
//!
//! Works directly on the database file. Stop the server before running
//! `import` or `reindex` against a live store.

mod import;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use thermolog_core::config::Config;
use thermolog_core::{MetricKind, Reader, StoreConfig, Timestamp, ViewRange, WriteMode, Writer};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Maintain and inspect a Thermolog database
#[derive(Parser)]
#[command(name = "thermolog-admin", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, conflicts_with = "database")]
    config: Option<PathBuf>,

    /// Database file, using the bucket widths it was built with
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild every cached rollup from raw samples
    Reindex,
    /// Import `YYYYmmddTHHMMSS <temp> <hum>` lines for a sensor
    Import {
        /// Sensor the readings belong to
        sensor: String,
        /// Input file, or `-` for stdin
        #[arg(default_value = "-")]
        file: PathBuf,
    },
    /// Print rollup statistics for a sensor
    Stats {
        sensor: String,
        #[arg(value_parser = parse_view)]
        view: ViewRange,
        /// Window start (RFC 3339 or YYYYmmddTHHMMSS, UTC)
        #[arg(long, value_parser = parse_time, requires = "to")]
        from: Option<Timestamp>,
        /// Window end, exclusive
        #[arg(long, value_parser = parse_time, requires = "from")]
        to: Option<Timestamp>,
    },
    /// Print raw samples for a sensor
    Raw {
        sensor: String,
        #[arg(long, value_parser = parse_time)]
        from: Timestamp,
        #[arg(long, value_parser = parse_time)]
        to: Timestamp,
    },
    /// Print the first and last sample times in the store
    Span,
    /// Print the most recent sample of a sensor metric
    Latest {
        sensor: String,
        #[arg(value_parser = parse_metric)]
        metric: MetricKind,
    },
}

fn parse_time(s: &str) -> Result<Timestamp, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
        .map(|t| t.and_utc())
        .map_err(|_| format!("invalid time {s:?}"))
}

fn parse_view(s: &str) -> Result<ViewRange, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_metric(s: &str) -> Result<MetricKind, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn store_config(cli: &Cli) -> Result<StoreConfig> {
    match (&cli.config, &cli.database) {
        (Some(path), _) => Ok(Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?
            .store_config()),
        // Without a config, keep whatever bucket widths the store was built with
        (None, Some(path)) => Ok(StoreConfig::at(path).with_stored_widths()?),
        (None, None) => anyhow::bail!("either --config or --database is required"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut store = store_config(&cli)?;

    match cli.command {
        Command::Reindex => {
            let mut writer = Writer::open(store)?;
            let stats = writer.reindex_all()?;
            println!(
                "reindexed {} sensors: {} buckets, {} rollup rows",
                stats.sensors, stats.buckets, stats.rows
            );
        }
        Command::Import { sensor, file } => {
            // Rollups are rebuilt once at the end
            store.write_mode = WriteMode::Deferred;
            let mut writer = Writer::open(store)?;

            let stats = if file.as_os_str() == "-" {
                import::import(&mut writer, &sensor, io::stdin().lock())?
            } else {
                let input = File::open(&file)
                    .with_context(|| format!("opening {}", file.display()))?;
                import::import(&mut writer, &sensor, BufReader::new(input))?
            };
            info!("Rebuilding rollups after import");
            writer.reindex_all()?;

            println!(
                "imported {} of {} lines ({} skipped)",
                stats.imported, stats.lines, stats.skipped
            );
        }
        Command::Stats {
            sensor,
            view,
            from,
            to,
        } => {
            let mut reader = Reader::open(&store)?;
            let window = match (from, to) {
                (Some(from), Some(to)) => Some((from, to)),
                _ => reader.default_window(view, Utc::now())?,
            };
            let rows = match window {
                Some((from, to)) => reader.get_stats(&sensor, from, to, view)?,
                None => Vec::new(),
            };
            print_json(&rows)?;
        }
        Command::Raw { sensor, from, to } => {
            let reader = Reader::open(&store)?;
            print_json(&reader.get(&sensor, from, to)?)?;
        }
        Command::Span => {
            let reader = Reader::open(&store)?;
            print_json(&reader.date_span()?)?;
        }
        Command::Latest { sensor, metric } => {
            let reader = Reader::open(&store)?;
            print_json(&reader.get_latest(&sensor, metric)?)?;
        }
    }

    Ok(())
}
