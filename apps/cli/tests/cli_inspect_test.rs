//! Integration tests for `metronome last-step` and `metronome checkpoints`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn metronome() -> Command {
    let mut cmd = Command::cargo_bin("metronome").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn run_simulation(dir: &Path, steps: &str) {
    metronome()
        .arg("simulate")
        .arg("--output-dir")
        .arg(dir)
        .args(["--steps", steps, "--summary-interval", "5", "--checkpoint-interval", "10"])
        .assert()
        .success();
}

#[test]
fn test_last_step_without_log_prints_none() {
    let temp = TempDir::new().unwrap();
    metronome()
        .arg("last-step")
        .arg("--output-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::diff("none\n"));
}

#[test]
fn test_last_step_takes_numeric_maximum() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("custom.csv");
    fs::write(&log, "step,loss,lr,accuracy\n10,2.0,,\n40,1.0,,\n25,1.5,,\nbogus,1.0,,\n").unwrap();

    metronome().arg("last-step").arg("--log").arg(&log).assert().success().stdout(predicate::str::diff("40\n"));
}

#[test]
fn test_last_step_after_simulation() {
    let temp = TempDir::new().unwrap();
    run_simulation(temp.path(), "23");

    // finish() flushes the tail, so the last row is the last summary step.
    metronome()
        .arg("last-step")
        .arg("--output-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::diff("20\n"));
}

#[test]
fn test_checkpoints_empty_directory() {
    let temp = TempDir::new().unwrap();
    metronome()
        .arg("checkpoints")
        .arg("--output-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoints found"));
}

#[test]
fn test_checkpoints_json_lists_verified_handles() {
    let temp = TempDir::new().unwrap();
    run_simulation(temp.path(), "30");

    let output = metronome().arg("checkpoints").arg("--output-dir").arg(temp.path()).arg("--json").output().unwrap();
    assert!(output.status.success());
    let handles: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();

    let steps: Vec<u64> = handles.iter().map(|h| h["step"].as_u64().unwrap()).collect();
    assert_eq!(steps, vec![10, 20, 30]);
    assert!(handles.iter().all(|h| h["verified"] == true));
    assert!(handles.iter().all(|h| h["sha256"].as_str().unwrap().len() == 64));
}

#[test]
fn test_checkpoints_flags_tampered_file() {
    let temp = TempDir::new().unwrap();
    run_simulation(temp.path(), "10");
    fs::write(temp.path().join("checkpoints").join("ckpt-10.json"), b"{}").unwrap();

    metronome()
        .arg("checkpoints")
        .arg("--output-dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Checkpoints (1)"))
        .stdout(predicate::str::contains("mismatch"));
}

#[test]
fn test_checkpoints_survive_corrupt_index() {
    let temp = TempDir::new().unwrap();
    run_simulation(temp.path(), "20");
    fs::write(temp.path().join("checkpoints").join("checkpoint_index.json"), b"{trunc").unwrap();

    let output = metronome().arg("checkpoints").arg("--output-dir").arg(temp.path()).arg("--json").output().unwrap();
    assert!(output.status.success());
    let handles: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    let steps: Vec<u64> = handles.iter().map(|h| h["step"].as_u64().unwrap()).collect();
    assert_eq!(steps, vec![10, 20]);
    assert!(handles.iter().all(|h| h["verified"] == true));
}
