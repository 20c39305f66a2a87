//! Durable metric log.
//!
//! Rows accumulate in memory at every summary point and the whole history is
//! rewritten to a CSV file at checkpoint cadence. The file is the source of
//! truth for the last step a run reached; a crash loses at most the rows
//! appended since the previous flush.

use crate::error::MetricLogError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const HEADER: [&str; 4] = ["step", "loss", "lr", "accuracy"];

/// One summary row. Absent values are written as empty cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: u64,
    pub loss: f64,
    #[serde(rename = "lr")]
    pub learning_rate: Option<f64>,
    pub accuracy: Option<f64>,
}

impl MetricRecord {
    fn to_fields(&self) -> [String; 4] {
        [
            self.step.to_string(),
            self.loss.to_string(),
            self.learning_rate.map(|v| v.to_string()).unwrap_or_default(),
            self.accuracy.map(|v| v.to_string()).unwrap_or_default(),
        ]
    }
}

#[derive(Debug)]
pub struct MetricLog {
    path: PathBuf,
    records: Vec<MetricRecord>,
}

impl MetricLog {
    /// Open the log at `path`, loading any rows a previous run flushed so the
    /// next flush rewrites the full history. Unreadable rows are dropped.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match read_rows(&path) {
            Ok(rows) => rows.into_iter().filter_map(|row| row.into_record()).collect(),
            Err(e) if is_not_found(&e) => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read previous metric log; starting empty");
                Vec::new()
            }
        };
        if !records.is_empty() {
            info!(path = %path.display(), rows = records.len(), "loaded previous metric rows");
        }
        Self { path, records }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    pub fn append(&mut self, record: MetricRecord) {
        self.records.push(record);
    }

    /// Highest step held in memory, if any.
    #[must_use]
    pub fn last_step(&self) -> Option<u64> {
        self.records.iter().map(|r| r.step).max()
    }

    /// Rewrite the file with the whole in-memory history.
    ///
    /// The rows go to a temporary file in the same directory which then
    /// replaces the target, so readers never observe a half-written log.
    pub fn flush_to_durable(&self) -> Result<(), MetricLogError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        {
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(tmp.as_file_mut());
            writer.write_record(HEADER)?;
            for record in &self.records {
                writer.write_record(record.to_fields())?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!(path = %self.path.display(), rows = self.records.len(), "metric log flushed");
        Ok(())
    }
}

/// Scan the log at `path` for the highest numeric `step`.
///
/// Rows whose step is missing or not a non-negative integer are skipped. A
/// missing or unreadable file yields `None`; recovery never fails.
#[must_use]
pub fn load_last_step(path: &Path) -> Option<u64> {
    match read_rows(path) {
        Ok(rows) => {
            let last = rows.iter().filter_map(RawRow::step).max();
            match last {
                Some(step) => info!(path = %path.display(), step, "recovered last training step"),
                None => info!(path = %path.display(), "no valid step values in metric log"),
            }
            last
        }
        Err(e) if is_not_found(&e) => {
            debug!(path = %path.display(), "metric log does not exist");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "metric log unreadable; no prior step recovered");
            None
        }
    }
}

fn is_not_found(err: &csv::Error) -> bool {
    matches!(err.kind(), csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound)
}

/// A row as found on disk, before any field is trusted.
struct RawRow {
    line: u64,
    step: Option<String>,
    loss: Option<String>,
    lr: Option<String>,
    accuracy: Option<String>,
}

impl RawRow {
    fn step(&self) -> Option<u64> {
        let parsed = self.step.as_deref().map(str::trim).and_then(|s| s.parse::<u64>().ok());
        if parsed.is_none() {
            warn!(line = self.line, value = ?self.step, "skipping metric row with invalid step");
        }
        parsed
    }

    fn into_record(self) -> Option<MetricRecord> {
        let step = self.step()?;
        let Some(loss) = parse_float(self.loss.as_deref()) else {
            warn!(line = self.line, step, "skipping metric row with invalid loss");
            return None;
        };
        Some(MetricRecord {
            step,
            loss,
            learning_rate: parse_float(self.lr.as_deref()),
            accuracy: parse_float(self.accuracy.as_deref()),
        })
    }
}

fn parse_float(cell: Option<&str>) -> Option<f64> {
    cell.map(str::trim).filter(|s| !s.is_empty()).and_then(|s| s.parse::<f64>().ok())
}

fn read_rows(path: &Path) -> Result<Vec<RawRow>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h.trim() == name);
    let (step_col, loss_col, lr_col, acc_col) = (column("step"), column("loss"), column("lr"), column("accuracy"));

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let line = idx as u64 + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), line, error = %e, "skipping unreadable metric row");
                continue;
            }
        };
        let cell = |col: Option<usize>| col.and_then(|c| record.get(c)).map(ToString::to_string);
        rows.push(RawRow {
            line,
            step: cell(step_col),
            loss: cell(loss_col),
            lr: cell(lr_col),
            accuracy: cell(acc_col),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(step: u64, loss: f64) -> MetricRecord {
        MetricRecord { step, loss, learning_rate: None, accuracy: Some(0.5) }
    }

    #[test]
    fn test_missing_file_recovers_nothing() {
        let temp = TempDir::new().unwrap();
        assert_eq!(load_last_step(&temp.path().join("training_data.csv")), None);
    }

    #[test]
    fn test_recovers_max_step_regardless_of_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_data.csv");
        std::fs::write(&path, "step,loss,lr,accuracy\n10,2.0,,\n40,1.5,,\n25,1.7,,\n").unwrap();
        assert_eq!(load_last_step(&path), Some(40));
    }

    #[test]
    fn test_skips_non_numeric_steps() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_data.csv");
        std::fs::write(&path, "step,loss,lr,accuracy\n10,2.0,,\nabc,1.0,,\n30,1.1,,\n-5,1.0,,\n,1.0,,\n").unwrap();
        assert_eq!(load_last_step(&path), Some(30));
    }

    #[test]
    fn test_only_malformed_rows_recovers_nothing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_data.csv");
        std::fs::write(&path, "step,loss,lr,accuracy\nx,1.0,,\n").unwrap();
        assert_eq!(load_last_step(&path), None);
    }

    #[test]
    fn test_flush_writes_header_and_empty_cells() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("training_data.csv");
        let mut log = MetricLog::open(&path);
        log.append(MetricRecord { step: 5, loss: 1.0, learning_rate: Some(0.001), accuracy: None });
        log.flush_to_durable().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("step,loss,lr,accuracy"));
        assert_eq!(lines.next(), Some("5,1,0.001,"));
    }

    #[test]
    fn test_flush_overwrites_with_full_history() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_data.csv");
        let mut log = MetricLog::open(&path);
        log.append(record(5, 2.0));
        log.flush_to_durable().unwrap();
        log.append(record(10, 1.5));
        log.flush_to_durable().unwrap();

        let reopened = MetricLog::open(&path);
        assert_eq!(reopened.records(), &[record(5, 2.0), record(10, 1.5)]);
        assert_eq!(load_last_step(&path), Some(10));
    }

    #[test]
    fn test_reopen_keeps_history_and_drops_bad_rows() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_data.csv");
        std::fs::write(&path, "step,loss,lr,accuracy\n5,2.0,0.1,0.4\nbad,1.0,,\n10,nan-ish,,\n15,1.2,,\n").unwrap();

        let mut log = MetricLog::open(&path);
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.last_step(), Some(15));

        log.append(record(20, 1.0));
        log.flush_to_durable().unwrap();
        let steps: Vec<u64> = MetricLog::open(&path).records().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![5, 15, 20]);
    }

    #[test]
    fn test_tolerates_non_monotonic_history() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("training_data.csv");
        let mut log = MetricLog::open(&path);
        for step in [5, 10, 15, 10, 15, 20] {
            log.append(record(step, 1.0));
        }
        log.flush_to_durable().unwrap();
        assert_eq!(load_last_step(&path), Some(20));
        assert_eq!(MetricLog::open(&path).records().len(), 6);
    }
}
