//! Learning-rate schedules and the updater that pushes them into the optimizer.

use crate::error::ContractViolation;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Maps a global step to a learning rate.
pub trait LearningRateSchedule: Send + Sync {
    fn learning_rate(&self, step: u64) -> f64;
}

impl<F> LearningRateSchedule for F
where
    F: Fn(u64) -> f64 + Send + Sync,
{
    fn learning_rate(&self, step: u64) -> f64 {
        self(step)
    }
}

/// Built-in schedules, selected by `type` in the `[learning_rate]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Constant {
        value: f64,
    },
    /// Linear warmup to `peak`, then decay with the inverse square root of
    /// the step (the transformer "noam" schedule).
    InverseSqrt {
        peak: f64,
        warmup_steps: u64,
    },
    /// Linear warmup to `peak`, then half a cosine down to `min` at `total_steps`.
    WarmupCosine {
        peak: f64,
        min: f64,
        warmup_steps: u64,
        total_steps: u64,
    },
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::Constant { value: 1e-3 }
    }
}

impl ScheduleConfig {
    /// Check parameters; the message names the offending key.
    pub fn validate(&self) -> Result<(), String> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 { Ok(()) } else { Err(format!("learning_rate.{name} must be finite and > 0, got {v}")) }
        };
        match *self {
            Self::Constant { value } => positive("value", value),
            Self::InverseSqrt { peak, warmup_steps } => {
                positive("peak", peak)?;
                if warmup_steps == 0 {
                    return Err("learning_rate.warmup_steps must be >= 1".to_string());
                }
                Ok(())
            }
            Self::WarmupCosine { peak, min, warmup_steps, total_steps } => {
                positive("peak", peak)?;
                if !min.is_finite() || min < 0.0 || min > peak {
                    return Err(format!("learning_rate.min must be within [0, peak], got {min}"));
                }
                if total_steps <= warmup_steps {
                    return Err("learning_rate.total_steps must exceed warmup_steps".to_string());
                }
                Ok(())
            }
        }
    }
}

impl LearningRateSchedule for ScheduleConfig {
    fn learning_rate(&self, step: u64) -> f64 {
        match *self {
            Self::Constant { value } => value,
            Self::InverseSqrt { peak, warmup_steps } => {
                let step = step.max(1) as f64;
                let warmup = warmup_steps.max(1) as f64;
                peak * (step / warmup).min((warmup / step).sqrt())
            }
            Self::WarmupCosine { peak, min, warmup_steps, total_steps } => {
                if step < warmup_steps {
                    return peak * (step.max(1) as f64 / warmup_steps as f64);
                }
                let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
                let progress = ((step - warmup_steps) as f64 / span).min(1.0);
                min + 0.5 * (peak - min) * (1.0 + (PI * progress).cos())
            }
        }
    }
}

/// The part of an optimizer the coordinator touches.
pub trait Optimizer: Send {
    /// Mutable learning-rate slot, or `None` if the optimizer has no
    /// settable learning rate.
    fn learning_rate_slot(&mut self) -> Option<&mut f64>;
}

pub type SharedOptimizer = Arc<Mutex<dyn Optimizer>>;

/// Recomputes the learning rate every `interval` steps and writes it into
/// the optimizer.
pub struct LearningRateUpdater {
    schedule: Arc<dyn LearningRateSchedule>,
    optimizer: SharedOptimizer,
    interval: u64,
}

impl std::fmt::Debug for LearningRateUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningRateUpdater").field("interval", &self.interval).finish_non_exhaustive()
    }
}

impl LearningRateUpdater {
    #[must_use]
    pub fn new(schedule: Arc<dyn LearningRateSchedule>, optimizer: SharedOptimizer, interval: u64) -> Self {
        Self { schedule, optimizer, interval: interval.max(1) }
    }

    /// Scheduled rate at `step`, validated.
    pub fn learning_rate_at(&self, step: u64) -> Result<f64, ContractViolation> {
        let value = self.schedule.learning_rate(step);
        if value.is_finite() { Ok(value) } else { Err(ContractViolation::NonFiniteLearningRate { step, value }) }
    }

    /// Apply the scheduled rate if `step` is on the update interval.
    pub fn on_step(&self, step: u64) -> Result<Option<f64>, ContractViolation> {
        if step % self.interval != 0 {
            return Ok(None);
        }
        self.apply(step).map(Some)
    }

    /// Write `schedule(step)` into the optimizer's slot.
    ///
    /// The rate is validated before the optimizer is locked, so a bad value
    /// never reaches the slot.
    pub fn apply(&self, step: u64) -> Result<f64, ContractViolation> {
        let lr = self.learning_rate_at(step)?;

        let mut optimizer = self.optimizer.lock().map_err(|_| ContractViolation::Poisoned("optimizer"))?;
        let slot = optimizer.learning_rate_slot().ok_or(ContractViolation::MissingLearningRateSlot)?;
        *slot = lr;
        debug!(step, lr, "learning rate updated");
        Ok(lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Adam {
        lr: f64,
    }

    impl Optimizer for Adam {
        fn learning_rate_slot(&mut self) -> Option<&mut f64> {
            Some(&mut self.lr)
        }
    }

    struct Frozen;

    impl Optimizer for Frozen {
        fn learning_rate_slot(&mut self) -> Option<&mut f64> {
            None
        }
    }

    fn adam(lr: f64) -> Arc<Mutex<Adam>> {
        Arc::new(Mutex::new(Adam { lr }))
    }

    #[test]
    fn test_constant_schedule() {
        let schedule = ScheduleConfig::Constant { value: 0.01 };
        assert_eq!(schedule.learning_rate(0), 0.01);
        assert_eq!(schedule.learning_rate(10_000), 0.01);
    }

    #[test]
    fn test_inverse_sqrt_peaks_at_warmup() {
        let schedule = ScheduleConfig::InverseSqrt { peak: 1.0, warmup_steps: 100 };
        assert!((schedule.learning_rate(50) - 0.5).abs() < 1e-12);
        assert!((schedule.learning_rate(100) - 1.0).abs() < 1e-12);
        assert!((schedule.learning_rate(400) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_cosine_reaches_min() {
        let schedule = ScheduleConfig::WarmupCosine { peak: 1.0, min: 0.1, warmup_steps: 10, total_steps: 110 };
        assert!((schedule.learning_rate(5) - 0.5).abs() < 1e-12);
        assert!((schedule.learning_rate(10) - 1.0).abs() < 1e-12);
        assert!((schedule.learning_rate(60) - 0.55).abs() < 1e-12);
        assert!((schedule.learning_rate(500) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert!(ScheduleConfig::Constant { value: f64::NAN }.validate().is_err());
        assert!(ScheduleConfig::Constant { value: 0.0 }.validate().is_err());
        assert!(ScheduleConfig::InverseSqrt { peak: 1.0, warmup_steps: 0 }.validate().is_err());
        assert!(ScheduleConfig::WarmupCosine { peak: 1.0, min: 2.0, warmup_steps: 1, total_steps: 5 }
            .validate()
            .is_err());
        assert!(ScheduleConfig::default().validate().is_ok());
    }

    #[test]
    fn test_schedule_config_from_toml() {
        let schedule: ScheduleConfig = toml::from_str("type = \"inverse_sqrt\"\npeak = 0.002\nwarmup_steps = 4000\n").unwrap();
        assert_eq!(schedule, ScheduleConfig::InverseSqrt { peak: 0.002, warmup_steps: 4000 });
    }

    #[test]
    fn test_updater_writes_slot_on_interval() {
        let optimizer = adam(0.0);
        let updater = LearningRateUpdater::new(Arc::new(|step: u64| step as f64 * 0.1), optimizer.clone(), 2);

        assert_eq!(updater.on_step(3).unwrap(), None);
        assert_eq!(optimizer.lock().unwrap().lr, 0.0);
        assert_eq!(updater.on_step(4).unwrap(), Some(0.4));
        assert!((optimizer.lock().unwrap().lr - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_nan_schedule_leaves_slot_untouched() {
        let optimizer = adam(0.5);
        let updater = LearningRateUpdater::new(Arc::new(|_: u64| f64::NAN), optimizer.clone(), 1);

        let err = updater.on_step(7).unwrap_err();
        assert!(matches!(err, ContractViolation::NonFiniteLearningRate { step: 7, .. }));
        assert_eq!(optimizer.lock().unwrap().lr, 0.5);
    }

    #[test]
    fn test_missing_slot_is_reported() {
        let updater = LearningRateUpdater::new(Arc::new(ScheduleConfig::default()), Arc::new(Mutex::new(Frozen)), 1);
        assert!(matches!(updater.on_step(1), Err(ContractViolation::MissingLearningRateSlot)));
    }
}
