use thiserror::Error;

pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// How the coordinator treats a failure surfaced by one of its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged at warn level; the run continues with the next batch.
    Operational,
    /// Aborts the run.
    Fatal,
}

/// Failures of a cross-worker collective.
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("collective unreachable: {0}")]
    Unreachable(String),

    #[error("malformed collective payload: {0}")]
    Malformed(String),

    /// Workers entered the same collective at different global steps.
    #[error("workers disagree on the global step (local {local}, peer {peer})")]
    StepMismatch { local: u64, peer: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CollectiveError {
    /// A step mismatch means the workers are no longer in lock-step; nothing
    /// reduced from that point on can be trusted.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::StepMismatch { .. })
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to persist checkpoint file")]
    Persist(#[from] tempfile::PersistError),

    #[error("checkpoint {} does not match its recorded digest", path.display())]
    Integrity { path: std::path::PathBuf },
}

#[derive(Debug, Error)]
pub enum MetricLogError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("failed to persist metric log")]
    Persist(#[from] tempfile::PersistError),
}

/// Programming or configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("learning rate schedule returned a non-finite value {value} at step {step}")]
    NonFiniteLearningRate { step: u64, value: f64 },

    #[error("optimizer exposes no mutable learning-rate slot")]
    MissingLearningRateSlot,

    #[error("batch logs at step {step} carry no `loss` value")]
    MissingLoss { step: u64 },

    #[error("loss at step {step} is not a finite scalar: {value}")]
    UnsupportedLossValue { step: u64, value: f64 },

    #[error("cannot resume the step counter to {requested}: training already started at step {current}")]
    ResumeAfterStart { requested: u64, current: u64 },

    #[error("invalid coordinator state: expected {expected}, found {found}")]
    InvalidState { expected: &'static str, found: &'static str },

    #[error("shared state poisoned: {0}")]
    Poisoned(&'static str),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("metric reduction failed")]
    Collective(#[from] CollectiveError),

    #[error("checkpoint failed")]
    Checkpoint(#[from] CheckpointError),

    #[error("metric log failed")]
    MetricLog(#[from] MetricLogError),

    #[error("contract violated")]
    Contract(#[from] ContractViolation),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Failure reported by a user-supplied listener.
    #[error("listener `{listener}` failed: {message}")]
    Listener { listener: String, message: String, severity: Severity },
}

impl CoordinatorError {
    /// Failure of a user-supplied listener, with the severity it asks for.
    pub fn listener(listener: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self::Listener { listener: listener.into(), message: message.into(), severity }
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Collective(e) if e.is_protocol_violation() => Severity::Fatal,
            Self::Collective(_) | Self::Checkpoint(_) | Self::MetricLog(_) => Severity::Operational,
            Self::Contract(_) | Self::Config(_) => Severity::Fatal,
            Self::Listener { severity, .. } => *severity,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Render an error with its full `source()` chain, outermost first.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_mismatch_is_fatal() {
        let err: CoordinatorError = CollectiveError::StepMismatch { local: 10, peer: 11 }.into();
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn test_unreachable_collective_is_operational() {
        let err: CoordinatorError = CollectiveError::Unreachable("timed out".to_string()).into();
        assert_eq!(err.severity(), Severity::Operational);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_checkpoint_io_is_operational() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: CoordinatorError = CheckpointError::from(io).into();
        assert_eq!(err.severity(), Severity::Operational);
    }

    #[test]
    fn test_contract_violation_is_fatal() {
        let err: CoordinatorError = ContractViolation::MissingLearningRateSlot.into();
        assert!(err.is_fatal());
        assert!(error_chain(&err).contains("learning-rate slot"));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let io = std::io::Error::other("disk full");
        let err: CoordinatorError = CheckpointError::from(io).into();
        assert_eq!(error_chain(&err), "checkpoint failed: disk full");
    }

    #[test]
    fn test_wrapped_messages_are_not_repeated() {
        let err: CoordinatorError = ContractViolation::MissingLoss { step: 7 }.into();
        assert_eq!(error_chain(&err), "contract violated: batch logs at step 7 carry no `loss` value");

        let err: CoordinatorError = CollectiveError::Malformed("bad frame".to_string()).into();
        assert_eq!(error_chain(&err), "metric reduction failed: malformed collective payload: bad frame");
    }

    #[test]
    fn test_listener_error_keeps_requested_severity() {
        let err = CoordinatorError::listener("uploader", "bucket offline", Severity::Operational);
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "listener `uploader` failed: bucket offline");
    }
}
