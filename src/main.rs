//! itemstore CLI
//!
//! Command-line interface over a local item store:
//! - Add, inspect, delete and re-time items
//! - List and count items by time range
//! - Checkpoint and status

use anyhow::{bail, Context};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use itemstore::config::{generate_default_config, Config};
use itemstore::storage::{Item, ItemId, ItemStore, ScanOrder, StoreStats, TimeRange, WriteOutcome};
use itemstore::ItemQuery;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

#[derive(Parser)]
#[command(name = "itemstore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Embedded store for timestamped items")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: searched in standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add an item
    Add {
        /// Timestamp (default: now). Supports: "now", "yesterday", YYYY-MM-DD, RFC 3339, Unix millis
        #[arg(short, long)]
        time: Option<String>,
    },

    /// Show one item
    Get {
        id: ItemId,
    },

    /// Delete an item
    Delete {
        id: ItemId,
    },

    /// Change an item's timestamp
    Touch {
        id: ItemId,
        /// New timestamp (default: now)
        #[arg(short, long)]
        time: Option<String>,
    },

    /// List items in timestamp order
    List {
        /// Only items from the last duration (e.g., 12h, 7d, 4w)
        #[arg(short, long, conflicts_with_all = ["from", "to"])]
        last: Option<String>,
        /// Lower bound (inclusive)
        #[arg(long)]
        from: Option<String>,
        /// Upper bound (inclusive); a bare date covers that whole day
        #[arg(long)]
        to: Option<String>,
        /// Newest first
        #[arg(long)]
        desc: bool,
        /// Maximum number of items to print
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Count items
    Count {
        /// Only items from the last duration (e.g., 12h, 7d, 4w)
        #[arg(short, long)]
        last: Option<String>,
    },

    /// Fold the WAL into a fresh checkpoint
    Checkpoint,

    /// Show store status
    Status,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing config to {:?}", path))?;
                println!("Config written to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }

    init_logging(&config);

    let store = Arc::new(ItemStore::open(config.to_store_config()).await?);
    let result = run(&cli, &store).await;

    // Always leave a checkpoint behind, even if the command failed
    store.shutdown().await?;
    result
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("itemstore={}", config.logging.level)));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}

async fn run(cli: &Cli, store: &Arc<ItemStore>) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Add { time } => {
            let timestamp = parse_time(time.as_deref())?;
            let id = store.create(timestamp).await?;
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string(&Item::new(id, timestamp))?)
                }
                OutputFormat::Table => println!("Added item {} at {}", id, format_time(timestamp)),
            }
        }

        Commands::Get { id } => match store.get(*id)? {
            Some(item) => print_items(cli.format, &[item])?,
            None => bail!("item {} not found", id),
        },

        Commands::Delete { id } => match store.delete(*id).await? {
            WriteOutcome::Applied => println!("Deleted item {}", id),
            WriteOutcome::NotFound => bail!("item {} not found", id),
        },

        Commands::Touch { id, time } => {
            let timestamp = parse_time(time.as_deref())?;
            match store.update_timestamp(*id, timestamp).await? {
                WriteOutcome::Applied => {
                    println!("Item {} now at {}", id, format_time(timestamp))
                }
                WriteOutcome::NotFound => bail!("item {} not found", id),
            }
        }

        Commands::List {
            last,
            from,
            to,
            desc,
            limit,
        } => {
            let order = if *desc {
                ScanOrder::Descending
            } else {
                ScanOrder::Ascending
            };
            let query = ItemQuery::new(Arc::clone(store)).order(order);
            let range = match last {
                Some(last) => last_range(last)?,
                None => bounded_range(from.as_deref(), to.as_deref())?,
            };

            let items: Vec<Item> = query
                .in_range(range.start, range.end)
                .take(limit.unwrap_or(usize::MAX))
                .collect();
            print_items(cli.format, &items)?;
        }

        Commands::Count { last } => {
            let query = ItemQuery::new(Arc::clone(store));
            let count = match last {
                Some(last) => {
                    let range = last_range(last)?;
                    query.count_in_range(range.start, range.end)
                }
                None => query.count(),
            };
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "count": count })),
                OutputFormat::Table => println!("{}", count),
            }
        }

        Commands::Checkpoint => {
            store.checkpoint().await?;
            println!("Checkpoint written");
        }

        Commands::Status => {
            let stats = store.stats().await;
            let bounds = ItemQuery::new(Arc::clone(store)).time_bounds();
            print_status(cli.format, store, &stats, bounds)?;
        }

        // Handled before the store is opened
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn print_items(format: OutputFormat, items: &[Item]) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No items");
        return Ok(());
    }

    println!("{:<12} {:<26} {}", "ID", "Time (UTC)", "Timestamp");
    println!("{}", "-".repeat(56));
    for item in items {
        println!(
            "{:<12} {:<26} {}",
            item.id(),
            format_time(item.timestamp()),
            item.timestamp()
        );
    }
    Ok(())
}

fn print_status(
    format: OutputFormat,
    store: &ItemStore,
    stats: &StoreStats,
    bounds: Option<(i64, i64)>,
) -> anyhow::Result<()> {
    let report = store.recovery_report();

    if format == OutputFormat::Json {
        let status = serde_json::json!({
            "data_dir": store.data_dir(),
            "items": stats.item_count,
            "quarantined": stats.quarantined_count,
            "wal_frames": stats.wal_frames,
            "wal_bytes": stats.wal_bytes,
            "checkpoint_bytes": stats.checkpoint_bytes,
            "last_seq": stats.last_seq,
            "next_id": stats.next_id,
            "oldest": bounds.map(|b| b.0),
            "newest": bounds.map(|b| b.1),
            "recovery": {
                "frames_replayed": report.frames_replayed,
                "discarded_wal_bytes": report.discarded_wal_bytes,
                "quarantined_ids": report.quarantined.iter().map(|r| r.id).collect::<Vec<_>>(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("itemstore v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Data directory: {:?}", store.data_dir());
    println!("{}", stats);
    if let Some((oldest, newest)) = bounds {
        println!("Oldest: {}", format_time(oldest));
        println!("Newest: {}", format_time(newest));
    }

    if !report.is_clean() {
        println!();
        println!("Recovery:");
        if report.discarded_wal_bytes > 0 {
            println!("  Discarded {} bytes of torn WAL tail", report.discarded_wal_bytes);
        }
        for record in &report.quarantined {
            let note = if record.id_verified { "" } else { " (unverified id)" };
            println!("  Quarantined {}{}: {}", record.id, note, record.reason);
        }
    }
    Ok(())
}

/// Parse an optional timestamp argument, defaulting to now
fn parse_time(input: Option<&str>) -> anyhow::Result<i64> {
    match input {
        None => Ok(Utc::now().timestamp_millis()),
        Some(s) => parse_time_str(s),
    }
}

fn parse_time_str(s: &str) -> anyhow::Result<i64> {
    let s = s.trim();
    match s {
        "now" => return Ok(Utc::now().timestamp_millis()),
        "yesterday" => return Ok((Utc::now() - Duration::days(1)).timestamp_millis()),
        _ => {}
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        Ok(dt.timestamp_millis())
    } else if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .context("midnight is always valid")?;
        Ok(midnight.and_utc().timestamp_millis())
    } else if let Ok(ts) = s.parse::<i64>() {
        Ok(ts)
    } else {
        bail!("Invalid timestamp format: {}", s)
    }
}

/// Parse a `--from`/`--to` bound; a bare date as an upper bound means its last millisecond
fn parse_bound(s: &str, end_of_day: bool) -> anyhow::Result<i64> {
    if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        let day = TimeRange::day(date.year(), date.month(), date.day())
            .with_context(|| format!("Date out of range: {}", s))?;
        return Ok(if end_of_day { day.end } else { day.start });
    }
    parse_time_str(s)
}

fn bounded_range(from: Option<&str>, to: Option<&str>) -> anyhow::Result<TimeRange> {
    let start = from.map(|s| parse_bound(s, false)).transpose()?.unwrap_or(i64::MIN);
    let end = to.map(|s| parse_bound(s, true)).transpose()?.unwrap_or(i64::MAX);
    TimeRange::try_new(start, end).context("--from must not be after --to")
}

/// Range from `now - last` up to now
fn last_range(last: &str) -> anyhow::Result<TimeRange> {
    let now = Utc::now().timestamp_millis();
    let span = parse_duration(last)?.num_milliseconds();
    TimeRange::try_new(now.saturating_sub(span), now)
        .with_context(|| format!("Duration must not be negative: {}", last))
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim().to_lowercase();

    let duration = if let Some(hours) = s.strip_suffix('h') {
        Duration::try_hours(hours.parse()?)
    } else if let Some(days) = s.strip_suffix('d') {
        Duration::try_days(days.parse()?)
    } else if let Some(weeks) = s.strip_suffix('w') {
        Duration::try_weeks(weeks.parse()?)
    } else if let Some(months) = s.strip_suffix('m') {
        months.parse::<i64>()?.checked_mul(30).and_then(Duration::try_days)
    } else if let Some(years) = s.strip_suffix('y') {
        years.parse::<i64>()?.checked_mul(365).and_then(Duration::try_days)
    } else {
        bail!("Invalid duration format: {}. Use: 12h, 7d, 4w, 3m, 1y", s)
    };
    duration.with_context(|| format!("Duration too large: {}", s))
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| "out of range".to_string())
}
