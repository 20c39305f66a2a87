use std::path::{Path, PathBuf};

/// Filesystem layout of one training run's durable state.
///
/// ```text
/// <output_dir>/
///   training_data.csv
///   checkpoints/
///     checkpoint_index.json
///     model_config.json
///     ckpt-<step>.json
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    metric_log_file: String,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, metric_log_file: impl Into<String>) -> Self {
        Self { root: root.into(), metric_log_file: metric_log_file.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn metric_log_path(&self) -> PathBuf {
        self.root.join(&self.metric_log_file)
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.checkpoints_dir())?;
        Ok(())
    }
}

impl From<&crate::config::CoordinatorConfig> for RunLayout {
    fn from(config: &crate::config::CoordinatorConfig) -> Self {
        Self::new(config.output_dir.clone(), config.metric_log_file.clone())
    }
}
