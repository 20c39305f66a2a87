//! Checkpoint cadence, persistence and retention.

use crate::error::{error_chain, CheckpointError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CHECKPOINT_INDEX_FILE: &str = "checkpoint_index.json";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

/// A saved snapshot of trainable state at one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHandle {
    pub step: u64,
    pub path: PathBuf,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Source of the state a checkpoint captures.
pub trait ModelState: Send + Sync {
    /// Trainable state to persist.
    fn snapshot(&self) -> Result<serde_json::Value, CheckpointError>;

    /// Structural configuration needed to rebuild the model, written once
    /// alongside the first checkpoint of a process.
    fn structural_config(&self) -> serde_json::Value;
}

/// Persistence backend with bounded retention.
pub trait CheckpointStore: Send {
    fn save(&mut self, step: u64) -> Result<CheckpointHandle, CheckpointError>;

    /// Retained checkpoints, oldest first.
    fn retained(&self) -> &[CheckpointHandle];

    fn directory(&self) -> &Path;
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    step: u64,
    saved_at: DateTime<Utc>,
    state: serde_json::Value,
}

pub fn sha256_file(path: &Path) -> Result<String, CheckpointError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Write `bytes` to `path` through a temporary file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Stores checkpoints as JSON files `ckpt-<step>.json` in one directory and
/// tracks them in an index file so retention survives restarts.
pub struct DirectoryCheckpointStore {
    dir: PathBuf,
    max_to_keep: usize,
    model: Arc<dyn ModelState>,
    retained: Vec<CheckpointHandle>,
}

impl std::fmt::Debug for DirectoryCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCheckpointStore")
            .field("dir", &self.dir)
            .field("max_to_keep", &self.max_to_keep)
            .field("retained", &self.retained.len())
            .finish_non_exhaustive()
    }
}

impl DirectoryCheckpointStore {
    /// Open (creating if needed) the checkpoint directory and pick up the
    /// checkpoints a previous process left behind.
    pub fn open(dir: impl Into<PathBuf>, max_to_keep: usize, model: Arc<dyn ModelState>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let retained = match discover_checkpoints(&dir) {
            Ok(retained) => retained,
            Err(e) => {
                warn!(dir = %dir.display(), error = %error_chain(&e), "checkpoint index unreadable, rescanning directory");
                rescan_checkpoints(&dir)?
            }
        };
        if !retained.is_empty() {
            info!(dir = %dir.display(), count = retained.len(), "found existing checkpoints");
        }
        Ok(Self { dir, max_to_keep: max_to_keep.max(1), model, retained })
    }

    #[must_use]
    pub fn checkpoint_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("ckpt-{step}.json"))
    }

    fn write_index(&self) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(&self.retained)?;
        write_atomic(&self.dir.join(CHECKPOINT_INDEX_FILE), &json)
    }

    fn evict(&mut self) {
        while self.retained.len() > self.max_to_keep {
            let oldest = self.retained.remove(0);
            match std::fs::remove_file(&oldest.path) {
                Ok(()) => debug!(step = oldest.step, path = %oldest.path.display(), "evicted checkpoint"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %oldest.path.display(), error = %e, "failed to delete evicted checkpoint"),
            }
        }
    }
}

impl CheckpointStore for DirectoryCheckpointStore {
    fn save(&mut self, step: u64) -> Result<CheckpointHandle, CheckpointError> {
        let snapshot = SnapshotFile { step, saved_at: Utc::now(), state: self.model.snapshot()? };
        let path = self.checkpoint_path(step);
        write_atomic(&path, &serde_json::to_vec(&snapshot)?)?;

        let handle = CheckpointHandle { step, sha256: sha256_file(&path)?, path, created_at: snapshot.saved_at };
        // A restarted run may save a step it already saved once.
        self.retained.retain(|h| h.path != handle.path);
        self.retained.push(handle.clone());
        self.evict();
        self.write_index()?;
        Ok(handle)
    }

    fn retained(&self) -> &[CheckpointHandle] {
        &self.retained
    }

    fn directory(&self) -> &Path {
        &self.dir
    }
}

/// Checkpoints recorded in `dir`'s index whose files still exist, oldest first.
pub fn discover_checkpoints(dir: &Path) -> Result<Vec<CheckpointHandle>, CheckpointError> {
    let index = dir.join(CHECKPOINT_INDEX_FILE);
    let bytes = match std::fs::read(&index) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let handles: Vec<CheckpointHandle> = serde_json::from_slice(&bytes)?;
    Ok(handles.into_iter().filter(|h| h.path.exists()).collect())
}

/// Rebuild the handle list from the `ckpt-<step>.json` files in `dir`,
/// oldest first. Files that do not parse as a snapshot are skipped.
pub fn rescan_checkpoints(dir: &Path) -> Result<Vec<CheckpointHandle>, CheckpointError> {
    let mut handles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(step) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("ckpt-")?.strip_suffix(".json"))
            .and_then(|step| step.parse::<u64>().ok())
        else {
            continue;
        };
        let snapshot = std::fs::read(&path)
            .map_err(CheckpointError::from)
            .and_then(|bytes| serde_json::from_slice::<SnapshotFile>(&bytes).map_err(CheckpointError::from));
        match snapshot {
            Ok(snapshot) => {
                handles.push(CheckpointHandle { step, sha256: sha256_file(&path)?, path, created_at: snapshot.saved_at });
            }
            Err(e) => warn!(path = %path.display(), error = %error_chain(&e), "skipping unreadable checkpoint"),
        }
    }
    handles.sort_by_key(|h| h.step);
    Ok(handles)
}

/// Recompute the digest of a checkpoint and compare it with its handle.
pub fn verify_checkpoint(handle: &CheckpointHandle) -> Result<(), CheckpointError> {
    if sha256_file(&handle.path)? == handle.sha256 {
        Ok(())
    } else {
        Err(CheckpointError::Integrity { path: handle.path.clone() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Saving,
}

/// Saves a checkpoint every `interval` steps.
///
/// A failed save leaves the scheduler idle and is reported to the caller;
/// the next interval tries again.
pub struct CheckpointScheduler {
    store: Box<dyn CheckpointStore>,
    interval: u64,
    state: SchedulerState,
    model_config: Option<serde_json::Value>,
    config_written: bool,
    last_save: Option<Duration>,
}

impl std::fmt::Debug for CheckpointScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointScheduler")
            .field("dir", &self.store.directory())
            .field("interval", &self.interval)
            .field("state", &self.state)
            .field("config_written", &self.config_written)
            .finish_non_exhaustive()
    }
}

impl CheckpointScheduler {
    #[must_use]
    pub fn new(store: Box<dyn CheckpointStore>, interval: u64) -> Self {
        Self {
            store,
            interval: interval.max(1),
            state: SchedulerState::Idle,
            model_config: None,
            config_written: false,
            last_save: None,
        }
    }

    /// Model structure to dump next to the first successful checkpoint.
    #[must_use]
    pub fn with_model_config(mut self, config: serde_json::Value) -> Self {
        self.model_config = Some(config);
        self
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    #[must_use]
    pub fn retained(&self) -> &[CheckpointHandle] {
        self.store.retained()
    }

    /// Duration of the most recent successful save.
    #[must_use]
    pub fn last_save_duration(&self) -> Option<Duration> {
        self.last_save
    }

    #[must_use]
    pub fn is_due(&self, step: u64) -> bool {
        step % self.interval == 0
    }

    /// Save if `step` is on the checkpoint interval.
    pub fn on_step(&mut self, step: u64) -> Result<Option<CheckpointHandle>, CheckpointError> {
        if !self.is_due(step) {
            return Ok(None);
        }

        self.state = SchedulerState::Saving;
        let started = Instant::now();
        let result = self.store.save(step);
        self.state = SchedulerState::Idle;

        let handle = result?;
        let elapsed = started.elapsed();
        self.last_save = Some(elapsed);
        info!(
            step,
            path = %handle.path.display(),
            elapsed_secs = format_args!("{:.2}", elapsed.as_secs_f64()),
            "saved checkpoint"
        );

        if !self.config_written {
            self.write_model_config();
        }
        Ok(Some(handle))
    }

    fn write_model_config(&mut self) {
        let Some(config) = &self.model_config else {
            self.config_written = true;
            return;
        };
        let path = self.store.directory().join(MODEL_CONFIG_FILE);
        let result = serde_json::to_vec_pretty(config)
            .map_err(CheckpointError::from)
            .and_then(|bytes| write_atomic(&path, &bytes));
        match result {
            Ok(()) => {
                info!(path = %path.display(), "wrote model configuration");
                self.config_written = true;
            }
            // Retried with the next successful save.
            Err(e) => warn!(path = %path.display(), error = %error_chain(&e), "failed to write model configuration"),
        }
    }
}
