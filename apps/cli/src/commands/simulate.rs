//! `metronome simulate` - run a synthetic training loop through the coordinator.

use crate::synthetic::{FlakyStore, SimulatedModel, SimulatedOptimizer, SyntheticSource};
use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use metronome_core::collective::DEFAULT_COLLECTIVE_TIMEOUT;
use metronome_core::{
    discover_checkpoints, rescan_checkpoints, Coordinator, CoordinatorConfig, DirectoryCheckpointStore,
    DistributedBackend, LocalGroup, MetricLog, ModelState, NullProvider, ReductionProvider, RunLayout, TcpCollective,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{info, warn};

const MODEL_HIDDEN: usize = 8;

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Batches to run after the resolved start step
    #[arg(long, default_value_t = 100)]
    pub steps: u64,

    /// Worker threads for the local backend
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Reduction backend: none, local or tcp
    #[arg(long)]
    pub backend: Option<DistributedBackend>,

    /// This process's rank (tcp backend)
    #[arg(long, default_value_t = 0)]
    pub rank: usize,

    /// Number of processes in the group (tcp backend)
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    /// Address rank 0 listens on (tcp backend)
    #[arg(long)]
    pub address: Option<String>,

    #[arg(long)]
    pub summary_interval: Option<u64>,

    #[arg(long)]
    pub checkpoint_interval: Option<u64>,

    #[arg(long)]
    pub max_to_keep: Option<usize>,

    /// Start from this step instead of the one recovered from the metric log
    #[arg(long)]
    pub initial_step: Option<u64>,

    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Make the checkpoint save at this step fail (may be repeated)
    #[arg(long = "fail-checkpoint-at")]
    pub fail_checkpoint_at: Vec<u64>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// What one worker reports back once its loop ends.
#[derive(Debug, Clone, Copy)]
struct WorkerOutcome {
    rank: usize,
    start_step: u64,
    final_step: u64,
}

pub fn execute(args: SimulateArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let layout = RunLayout::from(&config);
    layout.ensure_dirs().with_context(|| format!("Failed to create {}", layout.root().display()))?;

    info!(
        backend = ?config.distributed_backend,
        steps = args.steps,
        output_dir = %config.output_dir.display(),
        "starting simulated run"
    );

    let outcomes = match config.distributed_backend {
        DistributedBackend::None => vec![run_worker(Arc::new(NullProvider), &config, &args)?],
        DistributedBackend::Local => run_local(&config, &args)?,
        DistributedBackend::Tcp => vec![run_tcp(&config, &args)?],
    };

    let Some(leader) = outcomes.iter().find(|o| o.rank == 0).copied() else {
        // A non-leader tcp process has nothing durable to report.
        for outcome in &outcomes {
            println!("rank {} finished at step {}", outcome.rank, outcome.final_step);
        }
        return Ok(());
    };
    report(&layout, leader, outcomes.len(), args.json)
}

/// Config file (or defaults), then command-line overrides, then validation.
fn resolve_config(args: &SimulateArgs) -> Result<CoordinatorConfig> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load_from_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.distributed_backend = backend;
    }
    if let Some(address) = &args.address {
        config.tcp.address.clone_from(address);
    }
    if let Some(interval) = args.summary_interval {
        config.summary_interval_steps = interval;
    }
    if let Some(interval) = args.checkpoint_interval {
        config.checkpoint_interval_steps = interval;
    }
    if let Some(keep) = args.max_to_keep {
        config.checkpoints_max_to_keep = keep;
    }
    if let Some(step) = args.initial_step {
        config.initial_global_step = Some(step);
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir.clone_from(dir);
    }
    config.validate()?;
    Ok(config)
}

fn run_local(config: &CoordinatorConfig, args: &SimulateArgs) -> Result<Vec<WorkerOutcome>> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }
    let workers = LocalGroup::new(args.workers, DEFAULT_COLLECTIVE_TIMEOUT);
    thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| scope.spawn(move || run_worker(Arc::new(worker), config, args)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| anyhow::anyhow!("worker thread panicked"))?)
            .collect()
    })
}

fn run_tcp(config: &CoordinatorConfig, args: &SimulateArgs) -> Result<WorkerOutcome> {
    if args.world_size == 0 || args.rank >= args.world_size {
        bail!("--rank {} is out of range for --world-size {}", args.rank, args.world_size);
    }
    let address: SocketAddr =
        config.tcp.address.parse().with_context(|| format!("Invalid tcp address `{}`", config.tcp.address))?;
    let provider = if args.rank == 0 {
        TcpCollective::host(address, args.world_size, DEFAULT_COLLECTIVE_TIMEOUT)?
    } else {
        TcpCollective::join(address, args.rank, args.world_size, DEFAULT_COLLECTIVE_TIMEOUT)?
    };
    run_worker(Arc::new(provider), config, args)
}

/// Drive one worker's coordinator for `args.steps` batches.
fn run_worker(
    provider: Arc<dyn ReductionProvider>,
    config: &CoordinatorConfig,
    args: &SimulateArgs,
) -> Result<WorkerOutcome> {
    let rank = provider.rank();
    let leader = provider.is_leader();
    let model = Arc::new(SimulatedModel::new(MODEL_HIDDEN));
    let optimizer = Arc::new(Mutex::new(SimulatedOptimizer::default()));

    let mut builder = Coordinator::builder(config.clone())
        .provider(provider)
        .optimizer(optimizer.clone())
        .model(model.clone());
    if leader && !args.fail_checkpoint_at.is_empty() {
        let layout = RunLayout::from(config);
        let inner = DirectoryCheckpointStore::open(layout.checkpoints_dir(), config.checkpoints_max_to_keep, model.clone())?;
        builder = builder
            .checkpoint_store(Box::new(FlakyStore::new(inner, args.fail_checkpoint_at.clone())))
            .model_config(model.structural_config());
    }
    let mut coordinator = builder.build()?;

    let start_step = coordinator.begin_run()?;
    let mut source = SyntheticSource::new(rank, config.accuracy);
    for _ in 0..args.steps {
        coordinator.on_batch_begin()?;
        let step = coordinator.step() + 1;
        let mut logs = source.next_batch(step);
        let learning_rate = optimizer.lock().map(|o| o.learning_rate).unwrap_or_default();
        model.apply_update(learning_rate);
        coordinator.on_batch_end(&mut logs)?;
    }
    let final_step = coordinator.finish()?;
    if final_step != start_step + args.steps {
        warn!(rank, start_step, final_step, "step count drifted from batches run");
    }
    Ok(WorkerOutcome { rank, start_step, final_step })
}

fn report(layout: &RunLayout, leader: WorkerOutcome, workers: usize, json_output: bool) -> Result<()> {
    let rows = MetricLog::open(layout.metric_log_path()).records().len();
    let dir = layout.checkpoints_dir();
    let checkpoints = discover_checkpoints(&dir).or_else(|_| rescan_checkpoints(&dir))?;
    let last_checkpoint = checkpoints.last().map(|h| h.step);

    if json_output {
        let out = json!({
            "start_step": leader.start_step,
            "final_step": leader.final_step,
            "workers": workers,
            "metric_rows": rows,
            "metric_log": layout.metric_log_path(),
            "checkpoints": checkpoints.iter().map(|h| h.step).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Run complete".bold().green());
    println!();
    println!("  {:<14} {} -> {}", "Steps:".bold(), leader.start_step, leader.final_step.to_string().cyan());
    println!("  {:<14} {}", "Workers:".bold(), workers);
    println!("  {:<14} {} ({} rows)", "Metric log:".bold(), layout.metric_log_path().display(), rows);
    match last_checkpoint {
        Some(step) => println!(
            "  {:<14} {} retained, latest at step {}",
            "Checkpoints:".bold(),
            checkpoints.len(),
            step.to_string().cyan()
        ),
        None => println!("  {:<14} {}", "Checkpoints:".bold(), "none".dimmed()),
    }
    println!();
    Ok(())
}
