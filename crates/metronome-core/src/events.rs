use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier for one coordinator run (one process lifetime).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What the leader reports at every summary interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub step: u64,
    /// Every reduced metric by name.
    pub metrics: BTreeMap<String, f64>,
    /// SUM metrics only.
    pub per_step: BTreeMap<String, f64>,
    /// SUM metrics only; empty when no batch time was measured.
    pub per_second: BTreeMap<String, f64>,
    pub learning_rate: Option<f64>,
    /// `false` when the values are this worker's own because the collective failed.
    pub reduced: bool,
}

impl SummaryReport {
    /// `name=value` pairs for every metric and rate, in name order.
    #[must_use]
    pub fn render_fields(&self) -> String {
        let mut out = String::new();
        let mut push = |name: &str, suffix: &str, value: f64| {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{name}{suffix}={value:.4}");
        };
        for (name, value) in &self.metrics {
            push(name, "", *value);
        }
        for (name, value) in &self.per_step {
            push(name, "_per_step", *value);
        }
        for (name, value) in &self.per_second {
            push(name, "_per_sec", *value);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    RunStarted { run_id: RunId, start_step: u64, rank: usize, world_size: usize },
    Summary(SummaryReport),
    MetricLogFlushed { step: u64, rows: usize, path: PathBuf },
    CheckpointSaved { step: u64, path: PathBuf, elapsed_ms: u64 },
    CheckpointFailed { step: u64, error: String },
    LearningRateUpdated { step: u64, learning_rate: f64 },
    RunFinished { run_id: RunId, final_step: u64 },
}

pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &CoordinatorEvent);
}

/// Renders events as `tracing` lines.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::RunStarted { run_id, start_step, rank, world_size } => {
                info!(run_id = %run_id, start_step, rank, world_size, "run started");
            }
            CoordinatorEvent::Summary(report) => {
                info!(
                    step = report.step,
                    lr = ?report.learning_rate,
                    reduced = report.reduced,
                    metrics = %report.render_fields(),
                    "summary"
                );
            }
            CoordinatorEvent::MetricLogFlushed { step, rows, path } => {
                info!(step, rows, path = %path.display(), "metric log flushed");
            }
            CoordinatorEvent::CheckpointSaved { step, path, elapsed_ms } => {
                info!(step, path = %path.display(), elapsed_ms, "checkpoint saved");
            }
            // The coordinator already logs the failure at warn.
            CoordinatorEvent::CheckpointFailed { step, error } => {
                debug!(step, error = %error, "checkpoint failed");
            }
            CoordinatorEvent::LearningRateUpdated { step, learning_rate } => {
                debug!(step, lr = learning_rate, "learning rate updated");
            }
            CoordinatorEvent::RunFinished { run_id, final_step } => {
                info!(run_id = %run_id, final_step, "run finished");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<CoordinatorEvent>>,
}

impl RecordingEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<CoordinatorEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<SummaryReport> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CoordinatorEvent::Summary(report) => Some(report),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn on_event(&self, event: &CoordinatorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> SummaryReport {
        SummaryReport {
            step: 20,
            metrics: BTreeMap::from([("loss".to_string(), 1.25), ("trg_tokens".to_string(), 130.0)]),
            per_step: BTreeMap::from([("trg_tokens".to_string(), 16.0)]),
            per_second: BTreeMap::from([("trg_tokens".to_string(), 80.0)]),
            learning_rate: Some(0.001),
            reduced: true,
        }
    }

    #[test]
    fn test_render_fields_lists_metrics_and_rates() {
        assert_eq!(
            report().render_fields(),
            "loss=1.2500 trg_tokens=130.0000 trg_tokens_per_step=16.0000 trg_tokens_per_sec=80.0000"
        );
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CoordinatorEvent::CheckpointFailed { step: 1000, error: "disk full".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "checkpoint_failed");
        assert_eq!(json["step"], 1000);
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingEventSink::new();
        sink.on_event(&CoordinatorEvent::Summary(report()));
        sink.on_event(&CoordinatorEvent::LearningRateUpdated { step: 20, learning_rate: 0.001 });
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.summaries(), vec![report()]);
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
