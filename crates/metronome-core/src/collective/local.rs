use super::ReductionProvider;
use crate::error::CollectiveError;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// In-process worker group. Each worker runs on its own thread and holds a
/// [`LocalWorker`] handle; collectives rendezvous on shared memory.
///
/// A round that times out is abandoned: every worker already waiting in it
/// gets `Unreachable`, and a worker arriving late for the abandoned step (or
/// an earlier one) is turned away without contributing. The group re-forms at
/// the next step every worker reaches, so a slow interval costs only that
/// interval's reduction.
#[derive(Debug)]
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` worker handles, ranks `0..size`.
    #[must_use]
    pub fn new(size: usize, timeout: Duration) -> Vec<LocalWorker> {
        let size = size.max(1);
        let shared = Arc::new(Rendezvous {
            size,
            timeout,
            state: Mutex::new(RoundState::default()),
            cv: Condvar::new(),
        });
        (0..size).map(|rank| LocalWorker { rank, size, shared: Arc::clone(&shared) }).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LocalWorker {
    rank: usize,
    size: usize,
    shared: Arc<Rendezvous>,
}

#[derive(Debug)]
struct Rendezvous {
    size: usize,
    timeout: Duration,
    state: Mutex<RoundState>,
    cv: Condvar,
}

#[derive(Debug, Clone)]
enum RoundFailure {
    StepMismatch { min: u64, max: u64 },
    Malformed(String),
    Abandoned { step: u64 },
}

#[derive(Debug, Default)]
struct RoundState {
    generation: u64,
    arrived: usize,
    min_step: u64,
    max_step: u64,
    layout: u64,
    acc: Vec<f64>,
    failure: Option<RoundFailure>,
    /// Finished rounds awaiting pickup: outcome plus readers still to collect it.
    completed: HashMap<u64, (Result<Vec<f64>, RoundFailure>, usize)>,
    /// Highest step of a round abandoned after a timeout.
    abandoned_through: Option<u64>,
}

impl RoundState {
    fn contribute(&mut self, rank: usize, step: u64, layout: u64, values: &[f64]) {
        if self.arrived == 0 {
            self.min_step = step;
            self.max_step = step;
            self.layout = layout;
            self.acc = values.to_vec();
            self.failure = None;
            return;
        }
        self.min_step = self.min_step.min(step);
        self.max_step = self.max_step.max(step);
        if self.min_step != self.max_step {
            self.failure = Some(RoundFailure::StepMismatch { min: self.min_step, max: self.max_step });
            return;
        }
        if self.failure.is_some() {
            return;
        }
        if self.layout != layout {
            self.failure =
                Some(RoundFailure::Malformed(format!("rank {rank} reduces a different set of values at step {step}")));
        } else if self.acc.len() != values.len() {
            self.failure = Some(RoundFailure::Malformed(format!(
                "rank {rank} contributed {} values, expected {}",
                values.len(),
                self.acc.len()
            )));
        } else {
            for (acc, v) in self.acc.iter_mut().zip(values) {
                *acc += v;
            }
        }
    }

    /// Give up on the open round. Workers still waiting in it are woken with
    /// the failure; the caller is not one of them.
    fn abandon(&mut self, generation: u64) {
        let waiting = self.arrived.saturating_sub(1);
        if waiting > 0 {
            self.completed.insert(generation, (Err(RoundFailure::Abandoned { step: self.max_step }), waiting));
        }
        self.abandoned_through = Some(self.abandoned_through.map_or(self.max_step, |s| s.max(self.max_step)));
        self.arrived = 0;
        self.acc.clear();
        self.failure = None;
        self.generation += 1;
    }
}

impl ReductionProvider for LocalWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn sum(&self, step: u64, layout: u64, values: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        let shared = &self.shared;
        let mut state = shared
            .state
            .lock()
            .map_err(|_| CollectiveError::Unreachable("local collective state poisoned".to_string()))?;
        if let Some(abandoned) = state.abandoned_through
            && step <= abandoned
        {
            return Err(CollectiveError::Unreachable(format!(
                "rank {} arrived for step {step}, which the group abandoned after a timeout",
                self.rank
            )));
        }

        let generation = state.generation;
        state.contribute(self.rank, step, layout, values);
        state.arrived += 1;

        if state.arrived == shared.size {
            let outcome = match state.failure.take() {
                Some(failure) => Err(failure),
                None => Ok(std::mem::take(&mut state.acc)),
            };
            state.completed.insert(generation, (outcome, shared.size));
            state.arrived = 0;
            state.generation += 1;
            shared.cv.notify_all();
        } else {
            let (guard, _) = shared
                .cv
                .wait_timeout_while(state, shared.timeout, |s| s.generation == generation)
                .map_err(|_| CollectiveError::Unreachable("local collective state poisoned".to_string()))?;
            state = guard;
            if state.generation == generation {
                state.abandon(generation);
                shared.cv.notify_all();
                return Err(CollectiveError::Unreachable(format!(
                    "rank {} timed out after {:?} waiting for peers at step {step}",
                    self.rank, shared.timeout
                )));
            }
        }

        let (outcome, remaining) = state
            .completed
            .get_mut(&generation)
            .map(|(outcome, remaining)| {
                *remaining -= 1;
                (outcome.clone(), *remaining)
            })
            .ok_or_else(|| CollectiveError::Unreachable(format!("round {generation} result missing")))?;
        if remaining == 0 {
            state.completed.remove(&generation);
        }

        outcome.map_err(|failure| match failure {
            RoundFailure::StepMismatch { min, max } => {
                CollectiveError::StepMismatch { local: step, peer: if step == min { max } else { min } }
            }
            RoundFailure::Malformed(msg) => CollectiveError::Malformed(msg),
            RoundFailure::Abandoned { step } => {
                CollectiveError::Unreachable(format!("round at step {step} was abandoned after a peer timed out"))
            }
        })
    }
}
