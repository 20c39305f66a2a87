use super::{BatchLogs, MetricCatalog, ReductionKind};
use crate::collective::{layout_fingerprint, ReductionProvider};
use crate::error::{error_chain, CollectiveError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Current and previous reduced value of a SUM metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SumSample {
    pub current: f64,
    pub previous: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReducedMetrics {
    pub step: u64,
    /// Every metric, keyed and ordered by name.
    pub values: BTreeMap<String, f64>,
    /// SUM metrics only.
    pub sums: BTreeMap<String, SumSample>,
    /// `false` when the collective failed and `values` are this worker's own.
    pub reduced: bool,
}

/// Combines per-worker metrics into cross-worker values.
///
/// Values are all-reduced as one vector in lexicographic name order so every
/// worker issues the identical collective regardless of how its raw logs
/// were ordered. The fingerprint of the sorted names travels with the vector;
/// workers reporting different metric names fall back to local values. The summed vector is divided by the worker count, which is
/// the mean for MEAN metrics and the per-worker share for SUM metrics; the
/// throughput tracker scales SUM deltas back up by the worker count.
pub struct MetricReducer {
    provider: Arc<dyn ReductionProvider>,
    catalog: MetricCatalog,
    last_sums: HashMap<String, f64>,
}

impl std::fmt::Debug for MetricReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricReducer")
            .field("rank", &self.provider.rank())
            .field("size", &self.provider.size())
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl MetricReducer {
    #[must_use]
    pub fn new(provider: Arc<dyn ReductionProvider>, catalog: MetricCatalog) -> Self {
        Self { provider, catalog, last_sums: HashMap::new() }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.provider.size()
    }

    /// Reduce `logs` across workers.
    ///
    /// Unreachable or malformed collectives degrade to the local values with a
    /// warning. Only a step mismatch between workers is returned as an error.
    pub fn reduce(&mut self, step: u64, logs: &BatchLogs) -> Result<ReducedMetrics, CollectiveError> {
        let ordered: BTreeMap<String, f64> = logs.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let size = self.provider.size().max(1);

        // Every worker joins the collective, even with nothing to reduce, so
        // peers are never left waiting.
        let (values, reduced) = if size == 1 {
            (ordered, true)
        } else {
            let local: Vec<f64> = ordered.values().copied().collect();
            let layout = layout_fingerprint(ordered.keys());
            match self.provider.sum(step, layout, &local) {
                Ok(summed) if summed.len() == local.len() => {
                    let divisor = size as f64;
                    let values = ordered.keys().cloned().zip(summed.into_iter().map(|v| v / divisor)).collect();
                    (values, true)
                }
                Ok(summed) => {
                    warn!(
                        step,
                        expected = local.len(),
                        received = summed.len(),
                        "reduction returned the wrong number of values; using local metrics"
                    );
                    (ordered, false)
                }
                Err(e) if e.is_protocol_violation() => return Err(e),
                Err(e) => {
                    warn!(step, error = %error_chain(&e), "metric reduction skipped; using local metrics");
                    (ordered, false)
                }
            }
        };

        let mut sums = BTreeMap::new();
        for (name, value) in &values {
            if self.catalog.kind(name) == ReductionKind::Sum {
                let previous = self.last_sums.insert(name.clone(), *value).unwrap_or(0.0);
                sums.insert(name.clone(), SumSample { current: *value, previous });
            }
        }

        Ok(ReducedMetrics { step, values, sums, reduced })
    }
}
