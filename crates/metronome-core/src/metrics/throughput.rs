use super::reducer::SumSample;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Per-step and per-second rates of SUM metrics over one summary interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rates {
    pub per_step: BTreeMap<String, f64>,
    /// Empty when no time was accumulated over the interval.
    pub per_second: BTreeMap<String, f64>,
}

/// Accumulates the wall time spent inside batches between summary points.
///
/// Time is latched at every batch begin and added at every batch end, so the
/// per-second rate reflects training time over the whole interval rather
/// than the latency of the reduction at its boundary.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    summary_interval: u64,
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl ThroughputTracker {
    #[must_use]
    pub fn new(summary_interval: u64) -> Self {
        Self { summary_interval: summary_interval.max(1), started_at: None, accumulated: Duration::ZERO }
    }

    pub fn on_trigger_begin(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Add the time since the last [`on_trigger_begin`](Self::on_trigger_begin).
    pub fn on_trigger_end(&mut self) -> Duration {
        let elapsed = self.started_at.take().map(|t| t.elapsed()).unwrap_or_default();
        self.accumulated += elapsed;
        elapsed
    }

    pub fn record_elapsed(&mut self, elapsed: Duration) {
        self.accumulated += elapsed;
    }

    #[must_use]
    pub fn accumulated(&self) -> Duration {
        self.accumulated
    }

    /// `delta = (current - previous) * worker_count`, then
    /// `per_step = delta / summary_interval` and `per_sec = delta / seconds`.
    #[must_use]
    pub fn rates(&self, sums: &BTreeMap<String, SumSample>, worker_count: usize) -> Rates {
        let secs = self.accumulated.as_secs_f64();
        let mut rates = Rates::default();
        for (name, sample) in sums {
            let delta = (sample.current - sample.previous) * worker_count.max(1) as f64;
            rates.per_step.insert(name.clone(), delta / self.summary_interval as f64);
            if secs > 0.0 {
                rates.per_second.insert(name.clone(), delta / secs);
            }
        }
        rates
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
    }
}
