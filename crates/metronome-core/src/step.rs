//! The authoritative global step.

use crate::error::ContractViolation;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Cloneable handle to the global step of one worker.
///
/// Every component that needs the step receives a clone of the same handle;
/// only the coordinator advances it.
#[derive(Debug, Clone, Default)]
pub struct StepCounter {
    inner: Arc<StepState>,
}

#[derive(Debug, Default)]
struct StepState {
    value: AtomicU64,
    started: AtomicBool,
}

impl StepCounter {
    #[must_use]
    pub fn new(initial: u64) -> Self {
        Self {
            inner: Arc::new(StepState { value: AtomicU64::new(initial), started: AtomicBool::new(false) }),
        }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.inner.value.load(Ordering::SeqCst)
    }

    /// Advance by exactly one and return the new step.
    pub fn advance(&self) -> u64 {
        self.inner.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the counter before training starts.
    pub fn resume_from(&self, step: u64) -> Result<(), ContractViolation> {
        if self.is_started() {
            return Err(ContractViolation::ResumeAfterStart { requested: step, current: self.current() });
        }
        self.inner.value.store(step, Ordering::SeqCst);
        Ok(())
    }

    /// Freeze the starting value; later `resume_from` calls are rejected.
    pub fn mark_started(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }
}
