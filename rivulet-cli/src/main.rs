//! CLI for the rivulet log stream store.
//!
//! Replays a JSON-lines push file into an in-memory instance, then queries
//! it, lists label metadata, or benchmarks the push path.
//!
//! Each input line is one push stream:
//!
//! ```json
//! {"labels": {"job": "api", "env": "prod"}, "entries": [{"timestamp": 1, "line": "GET /"}]}
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use rivulet::matcher::{LineFilter, Selector};
use rivulet::query::{
    LabelRequest, QUERY_BATCH_SIZE, QueryContext, QueryRequest, QueryResponse, SeriesRequest,
};
use rivulet::{Direction, Entry, Instance, InstanceConfig, Matcher, PushRequest, PushStream};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// rivulet: in-memory log stream store CLI.
#[derive(Parser)]
#[command(name = "rivulet", version, about)]
struct Cli {
    /// Instance config file (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tenant the replayed streams belong to.
    #[arg(long, global = true, default_value = "anonymous")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Replay a push file and print instance statistics.
    Info {
        /// JSON-lines push file.
        input: PathBuf,
    },

    /// Replay a push file and run a range query against it.
    Query {
        /// JSON-lines push file.
        input: PathBuf,

        /// Label matcher such as `job="api"` or `env=~"prod|dev"`. Repeatable.
        #[arg(long = "match", short = 'm')]
        matchers: Vec<String>,

        /// Keep only lines containing this substring. Repeatable.
        #[arg(long)]
        contains: Vec<String>,

        /// Keep only lines matching this regex. Repeatable.
        #[arg(long)]
        regex: Vec<String>,

        /// Inclusive start timestamp in nanoseconds.
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Exclusive end timestamp in nanoseconds.
        #[arg(long, default_value_t = u64::MAX)]
        end: u64,

        /// Maximum number of entries (0 = unbounded).
        #[arg(long, default_value_t = 100)]
        limit: u32,

        /// Result order: forward or backward.
        #[arg(long, default_value = "forward")]
        direction: String,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Replay a push file and list label names, or the values of one label.
    Labels {
        /// JSON-lines push file.
        input: PathBuf,

        /// Label whose values to list.
        name: Option<String>,
    },

    /// Replay a push file and list the series matching any group.
    Series {
        /// JSON-lines push file.
        input: PathBuf,

        /// Comma-separated matchers forming one group. Repeatable.
        #[arg(long = "group", short = 'g', required = true)]
        groups: Vec<String>,
    },

    /// Run a push-path microbenchmark.
    Bench {
        /// Number of streams.
        #[arg(long, default_value = "100")]
        streams: u32,

        /// Entries pushed to each stream.
        #[arg(long, default_value = "10000")]
        entries: u64,
    },
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// One `timestamp labels line` row per entry.
    Text,
    /// JSON array of batches.
    Json,
}

/// One line of a push file.
#[derive(Deserialize)]
struct PushLine {
    labels: BTreeMap<String, String>,
    entries: Vec<Entry>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { ref input } => cmd_info(&cli, input),
        Commands::Query {
            ref input,
            ref matchers,
            ref contains,
            ref regex,
            start,
            end,
            limit,
            ref direction,
            ref format,
        } => build_query(matchers, contains, regex, start, end, limit, direction)
            .and_then(|req| cmd_query(&cli, input, &req, format)),
        Commands::Labels {
            ref input,
            ref name,
        } => cmd_labels(&cli, input, name.as_deref()),
        Commands::Series {
            ref input,
            ref groups,
        } => cmd_series(&cli, input, groups),
        Commands::Bench { streams, entries } => cmd_bench(&cli, streams, entries),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Builds an instance from the global options.
fn new_instance(cli: &Cli) -> Result<Instance, Box<dyn std::error::Error>> {
    let cfg = match &cli.config {
        Some(path) => InstanceConfig::load(path)?,
        None => InstanceConfig::default(),
    };
    Ok(Instance::from_config(cfg, cli.tenant.as_str()))
}

/// Replays `input` into a fresh instance.
///
/// Rejected pushes are logged and counted; they do not abort the replay.
fn replay(cli: &Cli, input: &Path) -> Result<Instance, Box<dyn std::error::Error>> {
    let instance = new_instance(cli)?;
    let file = std::fs::File::open(input)
        .map_err(|e| format!("cannot open '{}': {e}", input.display()))?;

    let mut pushed = 0usize;
    let mut rejected = 0usize;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: PushLine = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {e}", input.display(), lineno + 1))?;

        let req = PushRequest {
            streams: vec![PushStream {
                labels: parsed.labels.into_iter().collect(),
                entries: parsed.entries,
            }],
        };
        match instance.push(&req) {
            Ok(()) => pushed += 1,
            Err(e) => {
                rejected += 1;
                warn!(line = lineno + 1, status = e.status_code(), error = %e, "push rejected");
            }
        }
    }

    info!(
        input = %input.display(),
        pushed,
        rejected,
        streams = instance.stream_count(),
        "replay finished"
    );
    Ok(instance)
}

fn build_query(
    matchers: &[String],
    contains: &[String],
    regex: &[String],
    start: u64,
    end: u64,
    limit: u32,
    direction: &str,
) -> Result<QueryRequest, Box<dyn std::error::Error>> {
    let matchers = matchers
        .iter()
        .map(|m| m.parse::<Matcher>())
        .collect::<Result<Vec<_>, _>>()?;
    let mut selector = Selector::new(matchers);
    for needle in contains {
        selector = selector.with_filter(LineFilter::Contains(needle.clone()));
    }
    for pattern in regex {
        selector = selector.with_filter(LineFilter::regex(pattern)?);
    }
    Ok(QueryRequest::new(selector, start, end)
        .with_direction(direction.parse::<Direction>()?)
        .with_limit(limit))
}

/// Implements `rivulet info <input>`.
fn cmd_info(cli: &Cli, input: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let instance = replay(cli, input)?;
    let metrics = instance.metrics();

    println!("Tenant: {}", instance.tenant());
    println!("Streams: {}", instance.stream_count());
    println!("  Created total: {}", metrics.streams_created_total);
    println!("  Chunks in memory: {}", metrics.memory_chunks);

    let names = instance.label(&LabelRequest::names()).values;
    println!("Labels: {}", names.len());
    for name in &names {
        let values = instance.label(&LabelRequest::values_of(name.as_str())).values;
        println!("  - {name} ({} values)", values.len());
    }
    Ok(())
}

/// Implements `rivulet query <input>`.
fn cmd_query(
    cli: &Cli,
    input: &Path,
    req: &QueryRequest,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let instance = replay(cli, input)?;

    let mut batches: Vec<QueryResponse> = Vec::new();
    let stats = instance.query(&QueryContext::new(), req, &mut batches)?;

    match format {
        OutputFormat::Text => {
            println!(
                "# lines={}, batches={}, chunks={}",
                stats.total_lines_sent, stats.total_batches, stats.total_chunks_matched
            );
            for batch in &batches {
                for stream in &batch.streams {
                    for entry in &stream.entries {
                        println!("{} {} {}", entry.timestamp, stream.labels, entry.line);
                    }
                }
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "stats": stats,
                "batches": batches,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Implements `rivulet labels <input> [name]`.
fn cmd_labels(cli: &Cli, input: &Path, name: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let instance = replay(cli, input)?;
    let req = match name {
        Some(name) => LabelRequest::values_of(name),
        None => LabelRequest::names(),
    };
    for value in instance.label(&req).values {
        println!("{value}");
    }
    Ok(())
}

/// Implements `rivulet series <input> --group ...`.
fn cmd_series(cli: &Cli, input: &Path, groups: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let groups = groups
        .iter()
        .map(|group| {
            split_group(group)
                .into_iter()
                .map(str::parse::<Matcher>)
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let instance = replay(cli, input)?;
    let response = instance.series(&SeriesRequest { groups })?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Splits a `--group` value on commas outside double-quoted values.
///
/// Backslash escapes inside quotes are skipped, so `job=~"a{1,2}"` and
/// `msg="say \"hi, there\""` stay whole. Empty pieces are dropped.
fn split_group(group: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in group.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&group[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&group[start..]);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

/// Implements `rivulet bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(cli: &Cli, stream_count: u32, entries: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("rivulet push-path benchmark");
    println!("  Streams: {stream_count}");
    println!("  Entries per stream: {entries}");
    println!();

    let instance = new_instance(cli)?;
    let pods: Vec<String> = (0..stream_count).map(|i| format!("pod-{i}")).collect();
    let base_time = 1_700_000_000_000_000_000u64;

    let start = Instant::now();
    for step in 0..entries {
        let ts = base_time + step * 1_000_000;
        let req = PushRequest {
            streams: pods
                .iter()
                .map(|pod| {
                    PushStream::new(
                        &[("job", "bench"), ("pod", pod.as_str())],
                        vec![Entry::new(ts, "level=info msg=\"request served\" status=200")],
                    )
                })
                .collect(),
        };
        instance.push(&req)?;
    }
    let push_elapsed = start.elapsed();

    let start = Instant::now();
    let mut batches: Vec<QueryResponse> = Vec::new();
    let req = QueryRequest::new(
        Selector::new(vec![Matcher::equal("job", "bench")]),
        0,
        u64::MAX,
    );
    let stats = instance.query(&QueryContext::new(), &req, &mut batches)?;
    let query_elapsed = start.elapsed();

    let total = entries * u64::from(stream_count);
    let ns_per_entry = push_elapsed.as_nanos() as f64 / total.max(1) as f64;
    let entries_per_sec = total as f64 / push_elapsed.as_secs_f64();

    println!("Results:");
    println!("  Total entries: {total}");
    println!("  Push elapsed: {push_elapsed:.3?}");
    println!("  Avg push latency: {ns_per_entry:.1} ns/entry");
    println!("  Push throughput: {entries_per_sec:.0} entries/sec");
    println!(
        "  Full query: {} lines in {} batches of <= {QUERY_BATCH_SIZE}, {query_elapsed:.3?}",
        stats.total_lines_sent, stats.total_batches
    );
    println!("  Chunks in memory: {}", instance.metrics().memory_chunks);
    Ok(())
}
