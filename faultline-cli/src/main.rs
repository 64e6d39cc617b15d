//! The faultline command-line runner.

mod config;
mod workloads;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use config::RunConfig;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use workloads::{Settings, Workload};

#[derive(Parser)]
#[command(
    name = "faultline",
    about = "Run fault-injecting workloads and check the recorded history",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload against the built-in in-memory store.
    Run(RunArgs),
    /// Run a workload under external drive: a composer drops `op-<N>` and
    /// `check` FIFOs into a directory to pace the run.
    Fifo(FifoArgs),
}

#[derive(clap::Args)]
struct FifoArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Directory watched for composer FIFOs; created if absent and emptied
    /// at startup.
    #[arg(long)]
    dir: PathBuf,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Workload to run.
    #[arg(long, value_enum)]
    workload: Option<Workload>,

    /// Number of client worker threads.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Workload duration in seconds.
    #[arg(long)]
    time_limit: Option<f64>,

    /// Target operations per second.
    #[arg(long)]
    rate: Option<f64>,

    /// Seconds between nemesis operations (0 disables the nemesis).
    #[arg(long)]
    nemesis_interval: Option<f64>,

    /// Probability that a store operation turns indeterminate.
    #[arg(long)]
    fault_probability: Option<f64>,

    /// Make the store lose acknowledged writes, to see an invalid verdict.
    #[arg(long)]
    buggy: bool,

    /// Node names for the simulated cluster.
    #[arg(long, value_delimiter = ',')]
    nodes: Option<Vec<String>>,

    /// TOML config file providing defaults for omitted flags.
    #[arg(long, env = "FAULTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Write the op journal to this file, one JSON record per line.
    #[arg(long)]
    journal: Option<PathBuf>,
}

impl RunArgs {
    /// Flags win over file values; defaults fill the rest.
    fn settings(&self, file: &RunConfig) -> Settings {
        let defaults = Settings::default();
        Settings {
            concurrency: self
                .concurrency
                .or(file.concurrency)
                .unwrap_or(defaults.concurrency),
            time_limit: self
                .time_limit
                .or(file.time_limit)
                .unwrap_or(defaults.time_limit),
            rate: self.rate.or(file.rate).unwrap_or(defaults.rate),
            nemesis_interval: self
                .nemesis_interval
                .or(file.nemesis_interval)
                .unwrap_or(defaults.nemesis_interval),
            fault_probability: self
                .fault_probability
                .or(file.fault_probability)
                .unwrap_or(defaults.fault_probability),
            buggy: self.buggy || file.buggy.unwrap_or(false),
            nodes: self
                .nodes
                .clone()
                .or_else(|| file.nodes.clone())
                .unwrap_or(defaults.nodes),
        }
    }

    fn resolve_workload(&self, file: &RunConfig) -> anyhow::Result<Workload> {
        if let Some(w) = self.workload {
            return Ok(w);
        }
        if let Some(name) = &file.workload {
            return clap::ValueEnum::from_str(name, true)
                .map_err(|e| anyhow::anyhow!("bad workload in config: {}", e));
        }
        anyhow::bail!("no workload given (flag --workload or config file)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Fifo(args) => fifo_command(args).await,
    }
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let file = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    let workload = args.resolve_workload(&file)?;
    let settings = args.settings(&file);
    info!(?workload, ?settings, "starting run");

    let plan = workloads::plan(workload, &settings);
    let report = faultline_engine::run(plan)
        .await
        .context("test run failed")?;
    conclude(&args, report)
}

async fn fifo_command(args: FifoArgs) -> anyhow::Result<()> {
    let file = match &args.run.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    let workload = args.run.resolve_workload(&file)?;
    let settings = args.run.settings(&file);
    info!(?workload, dir = %args.dir.display(), "starting composer-driven run");

    let (plan, final_generator) = workloads::fifo_plan(workload, &settings);
    let options = faultline_engine::FifoOptions {
        dir: args.dir.clone(),
        final_generator,
    };
    let report = faultline_engine::run_fifo(plan, options)
        .await
        .context("fifo run failed")?;
    conclude(&args.run, report)
}

fn conclude(args: &RunArgs, report: faultline_engine::TestReport) -> anyhow::Result<()> {
    if let Some(path) = &args.journal {
        write_journal(path, &report.history)
            .with_context(|| format!("writing journal {}", path.display()))?;
    }

    let summary = serde_json::json!({
        "test": report.test.name,
        "run_id": report.test.run_id,
        "started_at": report.test.started_at,
        "op_count": report.history.len(),
        "result": report.result,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !report.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}

/// The op journal: dense, indexed, append-only, one record per line, read
/// back by sequential scan.
fn write_journal(path: &std::path::Path, history: &faultline_core::History) -> anyhow::Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for op in history.iter() {
        serde_json::to_writer(&mut out, op)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
