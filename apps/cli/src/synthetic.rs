//! Synthetic training workload driven through the coordinator by `simulate`.

use metronome_core::{
    token_accuracy, BatchLogs, CheckpointError, CheckpointHandle, CheckpointStore, ModelState, Optimizer,
    PaddingPolicy,
};
use serde_json::json;
use std::path::Path;
use std::sync::Mutex;

const PAD_ID: u32 = 0;

/// Xorshift64 generator; deterministic per seed so runs are reproducible.
#[derive(Debug, Clone)]
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn below(&mut self, bound: u32) -> u32 {
        (self.next_u64() % u64::from(bound.max(1))) as u32
    }
}

/// Produces the per-batch logs of one worker.
///
/// Loss decays towards a floor and predictions agree with targets more often
/// as the step grows. Token and sample counts are running totals, the way a
/// real input pipeline reports them.
#[derive(Debug)]
pub struct SyntheticSource {
    rng: XorShift,
    vocab_size: u32,
    batch_size: u32,
    max_len: u32,
    policy: PaddingPolicy,
    src_tokens: f64,
    trg_tokens: f64,
    samples: f64,
}

impl SyntheticSource {
    pub fn new(rank: usize, policy: PaddingPolicy) -> Self {
        Self {
            rng: XorShift::new(0x9E37_79B9_7F4A_7C15 ^ (rank as u64 + 1)),
            vocab_size: 512,
            batch_size: 8,
            max_len: 32,
            policy,
            src_tokens: 0.0,
            trg_tokens: 0.0,
            samples: 0.0,
        }
    }

    pub fn next_batch(&mut self, step: u64) -> BatchLogs {
        let progress = step as f64;
        let mut targets = Vec::new();
        let mut predictions = Vec::new();
        let hit_rate = 0.9f64.mul_add(-(-progress / 300.0).exp(), 0.95);

        for _ in 0..self.batch_size {
            let len = 8 + self.rng.below(self.max_len - 8);
            self.src_tokens += f64::from(8 + self.rng.below(self.max_len - 8));
            self.trg_tokens += f64::from(len);
            for position in 0..self.max_len {
                if position >= len {
                    targets.push(PAD_ID);
                    predictions.push(self.rng.below(self.vocab_size));
                    continue;
                }
                let target = 1 + self.rng.below(self.vocab_size - 1);
                targets.push(target);
                predictions.push(if self.rng.next_f64() < hit_rate { target } else { self.rng.below(self.vocab_size) });
            }
        }
        self.samples += f64::from(self.batch_size);

        let noise = (self.rng.next_f64() - 0.5) * 0.1;
        let loss = 4.0f64.mul_add((-progress / 500.0).exp(), 0.5) + noise;

        let mut logs = BatchLogs::new();
        logs.insert("loss".to_string(), loss);
        if let Some(accuracy) = token_accuracy(&predictions, &targets, self.policy) {
            logs.insert("accuracy".to_string(), accuracy);
        }
        logs.insert("src_tokens".to_string(), self.src_tokens);
        logs.insert("trg_tokens".to_string(), self.trg_tokens);
        logs.insert("samples".to_string(), self.samples);
        logs
    }
}

/// A handful of weights nudged by every batch so checkpoints differ.
#[derive(Debug)]
pub struct SimulatedModel {
    weights: Mutex<Vec<f64>>,
    hidden: usize,
}

impl SimulatedModel {
    pub fn new(hidden: usize) -> Self {
        Self { weights: Mutex::new(vec![0.5; hidden]), hidden }
    }

    pub fn apply_update(&self, learning_rate: f64) {
        if let Ok(mut weights) = self.weights.lock() {
            for (i, w) in weights.iter_mut().enumerate() {
                *w -= learning_rate * (*w - 0.01 * i as f64);
            }
        }
    }
}

impl ModelState for SimulatedModel {
    fn snapshot(&self) -> Result<serde_json::Value, CheckpointError> {
        let weights = self.weights.lock().map_err(|_| CheckpointError::Io(std::io::Error::other("model lock poisoned")))?;
        Ok(json!({ "weights": *weights }))
    }

    fn structural_config(&self) -> serde_json::Value {
        json!({ "kind": "simulated", "hidden": self.hidden })
    }
}

#[derive(Debug, Default)]
pub struct SimulatedOptimizer {
    pub learning_rate: f64,
}

impl Optimizer for SimulatedOptimizer {
    fn learning_rate_slot(&mut self) -> Option<&mut f64> {
        Some(&mut self.learning_rate)
    }
}

/// Store that refuses to save at chosen steps, for exercising the
/// non-fatal checkpoint failure path.
pub struct FlakyStore<S> {
    inner: S,
    fail_at: Vec<u64>,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S, fail_at: Vec<u64>) -> Self {
        Self { inner, fail_at }
    }
}

impl<S: CheckpointStore> CheckpointStore for FlakyStore<S> {
    fn save(&mut self, step: u64) -> Result<CheckpointHandle, CheckpointError> {
        if self.fail_at.contains(&step) {
            return Err(CheckpointError::Io(std::io::Error::other(format!("injected failure at step {step}"))));
        }
        self.inner.save(step)
    }

    fn retained(&self) -> &[CheckpointHandle] {
        self.inner.retained()
    }

    fn directory(&self) -> &Path {
        self.inner.directory()
    }
}
