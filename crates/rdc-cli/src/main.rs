use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rdc_dispatch::{
    decode_batch, rank_batch, write_run_report, BatchRecord, DispatchConfig, Dispatcher,
    FileSeenKeys, OutcomeHook, RankOutcome, RunReport, SeenKeys, TracingOutcomeHook,
};
use rdc_transport::{HttpTransport, RunCancel};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rdc")]
#[command(about = "Resilient Dispatch Core: rank opportunities and dispatch outreach")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dedupe and rank a JSON batch without dispatching.
    Rank {
        input: PathBuf,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Read only: ranking a batch does not mark its keys as seen.
        #[arg(long)]
        seen_keys: Option<PathBuf>,
    },
    /// Rank a JSON batch and dispatch the results.
    Run(RunArgs),
    /// Load, validate, and print the effective configuration.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    input: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Updated only by runs that dispatch; dry runs leave it unchanged.
    #[arg(long)]
    seen_keys: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    /// Contact to suppress for this run; repeatable.
    #[arg(long = "suppress")]
    suppress: Vec<String>,
}

fn init_logging(format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("initializing json log format")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .context("initializing pretty log format")?,
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
            .context("initializing compact log format")?,
    }
    Ok(())
}

/// Decode a JSON array; elements that do not decode stay in place and are reported
/// as malformed by ranking.
fn parse_batch(text: &str) -> Result<Vec<BatchRecord>> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(text).context("input must be a JSON array")?;
    let records = decode_batch(values);
    for (index, record) in records.iter().enumerate() {
        if let BatchRecord::Undecodable(error) = record {
            warn!(index, %error, "undecodable record");
        }
    }
    Ok(records)
}

fn load_batch(path: &Path) -> Result<Vec<BatchRecord>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let records = parse_batch(&text).with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "loaded opportunity batch");
    Ok(records)
}

enum Seen {
    Memory(HashSet<String>),
    File(FileSeenKeys),
}

impl Seen {
    async fn open(path: Option<&Path>) -> Result<Self> {
        Ok(match path {
            Some(path) => Seen::File(FileSeenKeys::open(path).await?),
            None => Seen::Memory(HashSet::new()),
        })
    }

    fn keys(&mut self) -> &mut dyn SeenKeys {
        match self {
            Seen::Memory(keys) => keys as &mut dyn SeenKeys,
            Seen::File(keys) => keys as &mut dyn SeenKeys,
        }
    }

    async fn persist(&mut self) -> Result<()> {
        if let Seen::File(keys) = self {
            keys.persist().await?;
        }
        Ok(())
    }
}

/// Persist newly seen keys unless the run was a dry run. Returns whether it wrote.
async fn commit_seen(seen: &mut Seen, dry_run: bool) -> Result<bool> {
    if dry_run {
        info!("dry run; seen-key store left unchanged");
        return Ok(false);
    }
    seen.persist().await?;
    Ok(true)
}

/// Returns the report and, when a reports directory was given, the run's directory.
async fn execute_run(args: RunArgs, cancel: RunCancel) -> Result<(RunReport, Option<PathBuf>)> {
    let mut config = DispatchConfig::load(args.config.as_deref())?;
    config.dry_run |= args.dry_run;
    let transport = Arc::new(HttpTransport::new(config.http_transport_config())?);
    let hooks: Vec<Arc<dyn OutcomeHook>> = vec![Arc::new(TracingOutcomeHook)];
    let dispatcher = Dispatcher::new(config, transport).with_hooks(hooks);
    for contact in &args.suppress {
        dispatcher.consent().suppress(contact, "cli").await;
    }

    let records = load_batch(&args.input)?;
    let mut seen = Seen::open(args.seen_keys.as_deref()).await?;
    let report = dispatcher
        .run_batch_with_cancel(records, seen.keys(), cancel)
        .await?;
    commit_seen(&mut seen, report.dry_run).await?;

    let written = match &args.reports_dir {
        Some(dir) => Some(write_run_report(dir, &report).await?),
        None => None,
    };
    Ok((report, written))
}

fn print_rank(outcome: &RankOutcome) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(outcome).context("serializing rank outcome")?
    );
    Ok(())
}

fn print_run(report: &RunReport, reports_dir: Option<&Path>) {
    let c = &report.counters;
    println!(
        "run complete: run_id={} phase={} ranked={} attempted={} succeeded={} failed={} circuit_open={} consent_denied={} cancelled={}",
        report.run_id,
        report.phase.as_str(),
        c.ranked,
        c.attempted,
        c.succeeded,
        c.failed,
        c.circuit_open,
        c.consent_denied,
        c.cancelled
    );
    if let Some(dir) = reports_dir {
        println!("reports={}", dir.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Commands::Rank {
            input,
            limit,
            seen_keys,
        } => {
            let records = load_batch(&input)?;
            let mut seen = Seen::open(seen_keys.as_deref()).await?;
            let outcome = rank_batch(records, seen.keys(), limit);
            print_rank(&outcome)?;
        }
        Commands::Run(args) => {
            let cancel = RunCancel::new();
            let on_signal = cancel.clone();
            let signal_task = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling run");
                    on_signal.cancel();
                }
            });

            let result = execute_run(args, cancel).await;
            signal_task.abort();
            let (report, written) = result?;
            print_run(&report, written.as_deref());
        }
        Commands::CheckConfig { config } => {
            let config = DispatchConfig::load(config.as_deref())?;
            config.validate()?;
            print!(
                "{}",
                serde_yaml::to_string(&config).context("rendering config")?
            );
        }
    }

    Ok(())
}
