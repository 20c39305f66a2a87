//! Cross-worker reduction providers.
//!
//! The coordinator is written once against [`ReductionProvider`]. Single
//! worker runs use [`NullProvider`]; multi-worker runs use either the
//! in-process [`LocalGroup`] (workers are threads of one process) or the
//! TCP star collective [`TcpCollective`] (workers are separate processes).

mod local;
mod tcp;

pub use local::{LocalGroup, LocalWorker};
pub use tcp::TcpCollective;

use crate::error::CollectiveError;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Default time a worker waits for its peers inside one collective.
pub const DEFAULT_COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Fingerprint of what each position of a reduced vector means.
///
/// Workers summing metrics pass the fingerprint of their sorted metric
/// names; two workers whose names differ never get their values added.
#[must_use]
pub fn layout_fingerprint<I, S>(names: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Capability to all-reduce a vector of scalars across workers.
///
/// Every worker must call [`sum`](Self::sum) at the same global step with
/// the same `layout` and a vector of the same length, or the call fails.
/// `step` travels with the payload so the provider can reject workers that
/// drifted apart; `layout` (see [`layout_fingerprint`]) lets it reject
/// vectors whose positions mean different things.
pub trait ReductionProvider: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Element-wise sum of `values` over all workers.
    fn sum(&self, step: u64, layout: u64, values: &[f64]) -> Result<Vec<f64>, CollectiveError>;

    fn is_leader(&self) -> bool {
        self.rank() == 0
    }
}

/// Provider for single-worker runs: rank 0 of 1, identity sum.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

impl ReductionProvider for NullProvider {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum(&self, _step: u64, _layout: u64, values: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        Ok(values.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_provider_is_identity() {
        let provider = NullProvider;
        assert_eq!(provider.rank(), 0);
        assert_eq!(provider.size(), 1);
        assert!(provider.is_leader());
        assert_eq!(provider.sum(3, 0, &[1.5, 2.0]).unwrap(), vec![1.5, 2.0]);
    }

    #[test]
    fn test_layout_fingerprint_depends_on_names_and_order() {
        let base = layout_fingerprint(["accuracy", "loss"]);
        assert_eq!(base, layout_fingerprint(vec!["accuracy".to_string(), "loss".to_string()]));
        assert_ne!(base, layout_fingerprint(["loss", "samples"]));
        assert_ne!(base, layout_fingerprint(["loss", "accuracy"]));
        // Separators keep concatenations apart.
        assert_ne!(layout_fingerprint(["ab", "c"]), layout_fingerprint(["a", "bc"]));
    }
}
