//! Per-step scalar metrics: reduction policy, cross-worker reduction,
//! throughput rates and the durable metric log.

pub mod log;
pub mod reducer;
pub mod throughput;

pub use log::{load_last_step, MetricLog, MetricRecord};
pub use reducer::{MetricReducer, ReducedMetrics, SumSample};
pub use throughput::{Rates, ThroughputTracker};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Raw per-batch logs handed over by the training loop: metric name to scalar.
pub type BatchLogs = HashMap<String, f64>;

/// Name of the metric every summary row is keyed on.
pub const LOSS: &str = "loss";
pub const ACCURACY: &str = "accuracy";

/// How a metric is combined across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionKind {
    /// Averaged across workers (loss, accuracy).
    Mean,
    /// Running totals (token counts); turned into per-step and per-second rates.
    Sum,
}

/// Reduction kind per metric name. Unknown names reduce with MEAN.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    sums: HashSet<String>,
}

impl MetricCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sums<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { sums: names.into_iter().map(Into::into).collect() }
    }

    pub fn register(&mut self, name: impl Into<String>, kind: ReductionKind) {
        let name = name.into();
        match kind {
            ReductionKind::Sum => {
                self.sums.insert(name);
            }
            ReductionKind::Mean => {
                self.sums.remove(&name);
            }
        }
    }

    #[must_use]
    pub fn kind(&self, name: &str) -> ReductionKind {
        if self.sums.contains(name) {
            ReductionKind::Sum
        } else {
            ReductionKind::Mean
        }
    }
}
