//! Read-only views of a run's durable state.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use metronome_core::{discover_checkpoints, load_last_step, rescan_checkpoints, verify_checkpoint, RunLayout};
use serde_json::json;
use std::path::PathBuf;
use tracing::warn;

const DEFAULT_METRIC_LOG: &str = "training_data.csv";

#[derive(Args, Debug, Clone)]
pub struct LastStepArgs {
    /// Run output directory holding the metric log
    #[arg(short, long, default_value = "output", conflicts_with = "log")]
    pub output_dir: PathBuf,

    /// Metric log file to read instead of `<output-dir>/training_data.csv`
    #[arg(long)]
    pub log: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckpointsArgs {
    /// Run output directory
    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Prints the recovered step, or `none` when the log has no usable row.
pub fn last_step(args: &LastStepArgs) -> Result<()> {
    let path = args
        .log
        .clone()
        .unwrap_or_else(|| RunLayout::new(&args.output_dir, DEFAULT_METRIC_LOG).metric_log_path());
    match load_last_step(&path) {
        Some(step) => println!("{step}"),
        None => println!("none"),
    }
    Ok(())
}

pub fn checkpoints(args: &CheckpointsArgs) -> Result<()> {
    let dir = RunLayout::new(&args.output_dir, DEFAULT_METRIC_LOG).checkpoints_dir();
    let handles = match discover_checkpoints(&dir) {
        Ok(handles) => handles,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "checkpoint index unreadable, listing checkpoint files instead");
            rescan_checkpoints(&dir).with_context(|| format!("Failed to scan {}", dir.display()))?
        }
    };

    if args.json {
        let out: Vec<_> = handles
            .iter()
            .map(|h| {
                json!({
                    "step": h.step,
                    "path": h.path,
                    "sha256": h.sha256,
                    "created_at": h.created_at,
                    "verified": verify_checkpoint(h).is_ok(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints ({})", handles.len()).bold().cyan());
    println!();

    if handles.is_empty() {
        println!("  {}", format!("No checkpoints found in {}", dir.display()).dimmed());
        println!();
        return Ok(());
    }

    println!("{:<10} {:<10} {:<26} {}", "Step", "Digest", "Saved", "Path");
    println!("{}", "─".repeat(90));
    for handle in &handles {
        let digest = match verify_checkpoint(handle) {
            Ok(()) => "ok".green(),
            Err(_) => "mismatch".red(),
        };
        println!(
            "{:<10} {:<10} {:<26} {}",
            handle.step.to_string().cyan(),
            digest,
            handle.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            handle.path.display().to_string().dimmed()
        );
    }
    println!();
    Ok(())
}
