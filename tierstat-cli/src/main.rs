//! CLI for tierstat rollup metrics.
//!
//! Operates on a JSON file store: emit values, query statistics, list what is
//! stored and inspect a record's span layout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tierstat::clock::{Clock, SystemClock};
use tierstat::store::FileStore;
use tierstat::{
    Dimensions, EmitOptions, MetricRecord, Metrics, MetricsConfig, QueryOptions, Statistic,
    Verbosity,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// tierstat: multi-resolution rollup metrics CLI.
#[derive(Parser)]
#[command(name = "tierstat", version, about)]
struct Cli {
    /// Owner (tenant) to read and write as. Overrides the config file.
    #[arg(long, global = true)]
    owner: Option<String>,

    /// JSON config file with spans, buffering and retry settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging (-v for writes and queries, -vv for rollup detail).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Record one value.
    Emit {
        /// Path to the store file.
        store_path: PathBuf,

        /// Metric namespace.
        namespace: String,

        /// Metric name.
        metric: String,

        /// Value to record.
        value: f64,

        /// Dimension as key=value. Repeat for more tags.
        #[arg(long = "dim", value_parser = parse_dimension)]
        dims: Vec<(String, String)>,

        /// Epoch seconds to record at instead of now.
        #[arg(long)]
        timestamp: Option<u64>,
    },

    /// Read a statistic for one metric stream.
    Query {
        /// Path to the store file.
        store_path: PathBuf,

        /// Metric namespace.
        namespace: String,

        /// Metric name.
        metric: String,

        /// Dimension as key=value. Repeat for more tags.
        #[arg(long = "dim", value_parser = parse_dimension)]
        dims: Vec<(String, String)>,

        /// Time range to query (e.g., "5m", "1h", "7d").
        #[arg(long, default_value = "1h")]
        period: String,

        /// Statistic: sum, avg, min, max, count, current or pNN.
        #[arg(long, default_value = "avg")]
        statistic: Statistic,

        /// Collapse the range into a single value.
        #[arg(long)]
        accumulate: bool,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// List namespaces, metrics or dimension sets.
    List {
        /// Path to the store file.
        store_path: PathBuf,

        /// List metrics in this namespace.
        #[arg(long)]
        namespace: Option<String>,

        /// List dimension sets of this metric (requires --namespace).
        #[arg(long, requires = "namespace")]
        metric: Option<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Show a record's spans and bucket usage.
    Inspect {
        /// Path to the store file.
        store_path: PathBuf,

        /// Metric namespace.
        namespace: String,

        /// Metric name.
        metric: String,

        /// Dimension as key=value. Repeat for more tags.
        #[arg(long = "dim", value_parser = parse_dimension)]
        dims: Vec<(String, String)>,
    },

    /// Migrate a record to the configured span layout.
    Upgrade {
        /// Path to the store file.
        store_path: PathBuf,

        /// Metric namespace.
        namespace: String,

        /// Metric name.
        metric: String,

        /// Dimension as key=value. Repeat for more tags.
        #[arg(long = "dim", value_parser = parse_dimension)]
        dims: Vec<(String, String)>,
    },

    /// Remove records whose expiration has passed.
    Expire {
        /// Path to the store file.
        store_path: PathBuf,
    },
}

/// Output format for query and list results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// Pretty-printed JSON.
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_occurrences(cli.verbose);
    init_tracing(verbosity);

    if let Err(e) = run(cli, verbosity).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Logs to stderr. `RUST_LOG` wins over `-v`.
fn init_tracing(verbosity: Verbosity) {
    let default = match verbosity {
        Verbosity::Off => "warn",
        Verbosity::Info => "info",
        Verbosity::Verbose => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, verbosity: Verbosity) -> CliResult<()> {
    let mut config = match &cli.config {
        Some(path) => MetricsConfig::from_json_file(path)?,
        None => MetricsConfig::new("default"),
    };
    if let Some(owner) = cli.owner {
        config.owner = owner;
    }
    if verbosity.info() {
        config.verbosity = verbosity;
    }

    match cli.command {
        Commands::Emit {
            store_path,
            namespace,
            metric,
            value,
            dims,
            timestamp,
        } => {
            let (_store, metrics) = open(&store_path, config).await?;
            let dims = to_dimensions(dims);
            let written = cmd_emit(&metrics, &namespace, &metric, value, &dims, timestamp).await?;
            for record in &written {
                println!("{} seq={}", record.key(), record.seq);
            }
            Ok(())
        }
        Commands::Query {
            store_path,
            namespace,
            metric,
            dims,
            period,
            statistic,
            accumulate,
            format,
        } => {
            let (_store, metrics) = open(&store_path, config).await?;
            let options = QueryOptions {
                accumulate,
                ..QueryOptions::default()
            };
            cmd_query(
                &metrics,
                &namespace,
                &metric,
                &to_dimensions(dims),
                parse_duration(&period)?,
                statistic,
                options,
                &format,
            )
            .await
        }
        Commands::List {
            store_path,
            namespace,
            metric,
            format,
        } => {
            let (_store, metrics) = open(&store_path, config).await?;
            cmd_list(&metrics, namespace.as_deref(), metric.as_deref(), &format).await
        }
        Commands::Inspect {
            store_path,
            namespace,
            metric,
            dims,
        } => {
            let (_store, metrics) = open(&store_path, config).await?;
            cmd_inspect(&metrics, &namespace, &metric, &to_dimensions(dims)).await
        }
        Commands::Upgrade {
            store_path,
            namespace,
            metric,
            dims,
        } => {
            let (_store, metrics) = open(&store_path, config).await?;
            match metrics.upgrade(&namespace, &metric, &to_dimensions(dims)).await? {
                Some(record) => println!("{} seq={} spans={}", record.key(), record.seq, record.spans.len()),
                None => return Err(format!("Metric '{namespace}/{metric}' not found").into()),
            }
            Ok(())
        }
        Commands::Expire { store_path } => {
            let store = FileStore::open(&store_path).await?;
            let now = SystemClock.now();
            let removed = store.expire(now).await?;
            println!("Removed {removed} expired records");
            Ok(())
        }
    }
}

async fn open(path: &Path, config: MetricsConfig) -> CliResult<(Arc<FileStore>, Metrics)> {
    let store = Arc::new(FileStore::open(path).await?);
    debug!(path = %path.display(), owner = %config.owner, "opened store");
    let metrics = Metrics::with_system_clock(config, store.clone())?;
    Ok((store, metrics))
}

/// Implements `tierstat emit`.
///
/// The process exits right after, so anything a configured buffer policy
/// held back is flushed before returning.
async fn cmd_emit(
    metrics: &Metrics,
    namespace: &str,
    metric: &str,
    value: f64,
    dims: &Dimensions,
    timestamp: Option<u64>,
) -> CliResult<Vec<MetricRecord>> {
    let mut options = EmitOptions::default();
    if let Some(timestamp) = timestamp {
        options = options.with_timestamp(timestamp);
    }

    let mut written = metrics
        .emit(namespace, metric, value, std::slice::from_ref(dims), options)
        .await?;
    let flushed = metrics.flush().await?;
    if flushed > 0 {
        debug!(flushed, "flushed buffered emits before exit");
        if let Some(record) = metrics.record(namespace, metric, dims).await? {
            written.push(record);
        }
    }
    Ok(written)
}

/// Implements `tierstat query`.
#[allow(clippy::too_many_arguments)]
async fn cmd_query(
    metrics: &Metrics,
    namespace: &str,
    metric: &str,
    dims: &Dimensions,
    period: u64,
    statistic: Statistic,
    options: QueryOptions,
    format: &OutputFormat,
) -> CliResult<()> {
    let result = metrics
        .query(namespace, metric, dims, period, statistic, options)
        .await?;

    match format {
        OutputFormat::Csv => {
            println!(
                "# metric={namespace}/{metric}, statistic={statistic}, period={}, points={}",
                format_duration_secs(result.period),
                result.points.len()
            );
            println!("timestamp,value,count");
            for point in &result.points {
                println!("{},{},{}", point.timestamp, point.value, point.count);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

/// Implements `tierstat list`.
async fn cmd_list(
    metrics: &Metrics,
    namespace: Option<&str>,
    metric: Option<&str>,
    format: &OutputFormat,
) -> CliResult<()> {
    let list = metrics.get_metric_list(namespace, metric).await?;

    match format {
        OutputFormat::Csv => {
            let lines: Vec<String> = match (namespace, metric) {
                (Some(_), Some(_)) => list.dimensions.iter().map(tierstat::dimensions::encode).collect(),
                (Some(_), None) => list.metrics,
                (None, _) => list.namespaces,
            };
            for line in lines {
                println!("{line}");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
    }

    Ok(())
}

/// Implements `tierstat inspect`.
async fn cmd_inspect(metrics: &Metrics, namespace: &str, metric: &str, dims: &Dimensions) -> CliResult<()> {
    let record = metrics
        .record(namespace, metric, dims)
        .await?
        .ok_or_else(|| format!("Metric '{namespace}/{metric}' not found"))?;

    println!("Record: {}", record.key());
    println!("  Seq: {}", record.seq);
    println!("  Expires: {}", record.expires);
    if let Some(source) = &record.source {
        println!("  Source: {source}");
    }
    if !record.matches_spans(&metrics.config().spans) {
        println!("  Layout: stale (run `tierstat upgrade` to migrate)");
    }
    println!();

    println!("Spans: {}", record.spans.len());
    for (i, span) in record.spans.iter().enumerate() {
        println!(
            "  Span {i}: period={}, interval={}, buckets={}/{}, count={}",
            format_duration_secs(span.period),
            format_duration_secs(span.interval()),
            span.points.len(),
            span.samples,
            span.total_count()
        );
        if span.end > 0 {
            println!("    Window: {}..{}", span.start(), span.end);
        }
    }

    Ok(())
}

fn to_dimensions(pairs: Vec<(String, String)>) -> Dimensions {
    pairs.into_iter().collect()
}

/// Parses a `key=value` dimension argument.
fn parse_dimension(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> CliResult<u64> {
    let s = s.trim();
    let Some((split, _)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }

    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str.parse()?;

    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "y" => 365 * 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, d or y.").into()),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("Duration '{s}' is too large").into())
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
