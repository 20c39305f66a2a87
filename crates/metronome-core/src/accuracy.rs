//! Token-level accuracy with a configurable padding policy.

use serde::{Deserialize, Serialize};

/// Whether padding positions count towards token accuracy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "padding", rename_all = "snake_case")]
pub enum PaddingPolicy {
    /// Every position counts, padding included.
    #[default]
    Include,
    /// Positions whose target is `pad_id` are ignored.
    Exclude {
        #[serde(default)]
        pad_id: u32,
    },
}

/// Index of the highest logit in each row of a `[positions, vocab_size]`
/// row-major buffer. A trailing partial row is ignored.
#[must_use]
pub fn argmax_tokens(logits: &[f32], vocab_size: usize) -> Vec<u32> {
    if vocab_size == 0 {
        return Vec::new();
    }
    logits
        .chunks_exact(vocab_size)
        .map(|row| {
            let mut best = 0;
            for (i, v) in row.iter().enumerate() {
                if *v > row[best] {
                    best = i;
                }
            }
            best as u32
        })
        .collect()
}

/// Fraction of positions where the prediction equals the target.
///
/// Positions past the shorter of the two slices are ignored. Returns `None`
/// when no position is counted.
#[must_use]
pub fn token_accuracy(predictions: &[u32], targets: &[u32], policy: PaddingPolicy) -> Option<f64> {
    let mut counted = 0_u64;
    let mut correct = 0_u64;
    for (pred, target) in predictions.iter().zip(targets) {
        if let PaddingPolicy::Exclude { pad_id } = policy
            && *target == pad_id
        {
            continue;
        }
        counted += 1;
        if pred == target {
            correct += 1;
        }
    }
    (counted > 0).then(|| correct as f64 / counted as f64)
}
