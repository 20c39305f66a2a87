//! Metronome CLI - drive and inspect the training-step coordinator
//!
//! `metronome simulate` pushes a synthetic training loop through the
//! coordinator on one or more workers; `last-step` and `checkpoints` read the
//! durable state a run left behind.

mod commands;
mod synthetic;

use clap::{Parser, Subcommand, ValueEnum};
use commands::inspect::{CheckpointsArgs, LastStepArgs};
use commands::simulate::SimulateArgs;
use tracing_subscriber::EnvFilter;

/// Metronome - step-driven coordination for data-parallel training
#[derive(Parser, Debug)]
#[command(name = "metronome", author, version, about = "Metronome - training-step coordinator")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a synthetic training loop through the coordinator
    ///
    /// Every worker reports loss, accuracy and token counts per batch; the
    /// coordinator reduces them, writes the metric log and saves checkpoints
    /// under the output directory.
    Simulate(SimulateArgs),

    /// Print the last step recorded in a run's metric log
    LastStep(LastStepArgs),

    /// List the checkpoints retained in a run's output directory
    Checkpoints(CheckpointsArgs),
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("metronome={level}")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_format)?;

    match args.command {
        Command::Simulate(simulate) => commands::simulate::execute(simulate),
        Command::LastStep(last_step) => commands::inspect::last_step(&last_step),
        Command::Checkpoints(checkpoints) => commands::inspect::checkpoints(&checkpoints),
    }
}
