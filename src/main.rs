use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pingfleet::config::{Config, ProbeMode};
use pingfleet::fanout::SinkFailurePolicy;
use pingfleet::probe::build_strategy;
use pingfleet::remote::{ApiClient, ApiClientConfig, DbClient};
use pingfleet::scheduler::Scheduler;
use pingfleet::sinks::{ApiSink, DbSink, FileSink, StdoutSink};
use pingfleet::sources::{ArgvSource, ApiSource, DbSource, FileSource};

#[derive(Parser)]
#[command(
    name = "pingfleet",
    version,
    about = "Probe many hosts in parallel and deliver loss and latency to console, file, API or database",
    long_about = None
)]
struct Cli {
    /// Hosts to probe (address, name, host:port or address/prefix)
    hosts: Vec<String>,

    /// Configuration file with API endpoints, secrets, database queries
    #[arg(short = 'C', long = "config")]
    config: Option<PathBuf>,

    /// Don't print results to stdout
    #[arg(short, long)]
    silent: bool,

    /// Print each host's replies together with its summary
    #[arg(short, long)]
    grouped: bool,

    /// Probe type: icmp (privileged), udp (unprivileged echo) or tcp (connect)
    #[arg(short = 'p', long = "probe")]
    probe: Option<ProbeMode>,

    /// Number of echo requests per host
    #[arg(short, long)]
    count: Option<u32>,

    /// Interval between echo requests, eg. 1s, 100ms
    #[arg(short, long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Per-host timeout, defaults to count seconds
    #[arg(short, long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Port used when a host gives none
    #[arg(long)]
    port: Option<u16>,

    /// Repeat the probe run at this interval until interrupted
    #[arg(long, value_parser = humantime::parse_duration)]
    every: Option<Duration>,

    /// Read hosts from a file, one per line
    #[arg(long)]
    source_file: Option<PathBuf>,

    /// Read hosts from the device API
    #[arg(long)]
    source_api: bool,

    /// Read hosts from the database
    #[arg(long)]
    source_db: bool,

    /// Append results to a file
    #[arg(long)]
    out_file: Option<PathBuf>,

    /// Send results to the device API
    #[arg(long)]
    out_api: bool,

    /// Write results to the database
    #[arg(long)]
    out_db: bool,

    /// What a failing output does: isolate or abort
    #[arg(long)]
    on_sink_error: Option<SinkFailurePolicy>,

    /// Write Prometheus metrics to this file when the run ends
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    if let Err(e) = pingfleet::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let scheduler = build_scheduler(&cli, &config)?;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, finishing queued probes");
            stopper.cancel();
        }
    });

    let outcome = scheduler.run(cancel).await;

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }

    let summary = outcome.context("Probe run failed")?;

    if summary.distribution.total_failed() > 0 {
        tracing::warn!(
            failed = summary.distribution.total_failed(),
            "Some results could not be delivered"
        );
    }

    Ok(())
}

/// Dump the Prometheus text exposition, also after a failed run
async fn write_metrics(path: &std::path::Path) -> Result<()> {
    if !pingfleet::metrics::metrics_initialized() {
        anyhow::bail!("metrics are not registered");
    }

    let text = pingfleet::metrics::encode_metrics()
        .map_err(|e| anyhow::anyhow!("failed to encode metrics: {e}"))?;
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    tracing::debug!(path = %path.display(), "Metrics written");
    Ok(())
}

/// Defaults, then config file, then environment, then flags
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => Config::discover().context("Failed to load config file")?,
    };

    config.apply_env().context("Invalid environment override")?;
    apply_cli(&mut config, cli);
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(mode) = cli.probe {
        config.probe.mode = mode;
    }
    if let Some(count) = cli.count {
        config.probe.count = count;
    }
    if let Some(interval) = cli.interval {
        config.probe.interval = interval;
    }
    if let Some(timeout) = cli.timeout {
        config.probe.timeout = Some(timeout);
    }
    if let Some(port) = cli.port {
        config.probe.default_port = port;
    }
    if let Some(workers) = cli.workers {
        config.pool.workers = workers;
    }
    if let Some(every) = cli.every {
        config.schedule.every = Some(every);
    }
    if let Some(policy) = cli.on_sink_error {
        config.output.on_sink_error = policy;
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    if cli.grouped {
        config.probe.grouped = true;
    }
    if cli.silent {
        config.probe.verbose = false;
    }
}

fn build_scheduler(cli: &Cli, config: &Config) -> Result<Scheduler> {
    let api = if cli.source_api || cli.out_api {
        config.validate_api().context("API output or source needs [api]")?;
        Some(Arc::new(ApiClient::new(ApiClientConfig::from(&config.api))?))
    } else {
        None
    };

    let db = if cli.source_db || cli.out_db {
        config
            .validate_database()
            .context("Database output or source needs [database]")?;
        Some(Arc::new(DbClient::from_config(&config.database)?))
    } else {
        None
    };

    let mut builder = Scheduler::builder()
        .config(config)
        .strategy(build_strategy(&config.probe));

    if !cli.hosts.is_empty() {
        builder = builder.source(Arc::new(ArgvSource::new(cli.hosts.iter().cloned())));
    }
    if let Some(path) = &cli.source_file {
        builder = builder.source(Arc::new(FileSource::new(path)));
    }
    if let (true, Some(api)) = (cli.source_api, &api) {
        builder = builder.source(Arc::new(ApiSource::new(Arc::clone(api))));
    }
    if let (true, Some(db)) = (cli.source_db, &db) {
        builder = builder.source(Arc::new(DbSource::new(Arc::clone(db))));
    }

    if !cli.silent {
        builder = builder.sink(Arc::new(StdoutSink));
    }
    if let Some(path) = &cli.out_file {
        builder = builder.sink(Arc::new(FileSink::new(path)));
    }
    if let (true, Some(api)) = (cli.out_api, &api) {
        builder = builder.sink(Arc::new(ApiSink::new(Arc::clone(api))));
    }
    if let (true, Some(db)) = (cli.out_db, &db) {
        builder = builder.sink(Arc::new(DbSink::new(Arc::clone(db))));
    }

    if let Some(db) = db {
        builder = builder.cleanup(db);
    }

    builder
        .build()
        .context("Give hosts, --source-file, --source-api or --source-db")
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("pingfleet=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("pingfleet={level},warn"))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
