//! Metronome Core
//!
//! Step-driven coordination for data-parallel training loops:
//! - One authoritative global step per worker (`StepCounter`)
//! - Cross-worker metric reduction behind a pluggable `ReductionProvider`
//! - Throughput rates, summary rows and a crash-safe metric log
//! - Checkpoint cadence with bounded retention
//! - Learning-rate schedules pushed into the optimizer
//! - Recovery of the last step reached from durable state

pub mod accuracy;
pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod layout;
pub mod metrics;
pub mod schedule;
pub mod step;

pub use accuracy::{argmax_tokens, token_accuracy, PaddingPolicy};
pub use checkpoint::{
    discover_checkpoints, rescan_checkpoints, verify_checkpoint, CheckpointHandle, CheckpointScheduler, CheckpointStore,
    DirectoryCheckpointStore, ModelState,
};
pub use collective::{layout_fingerprint, LocalGroup, LocalWorker, NullProvider, ReductionProvider, TcpCollective};
pub use config::{ConfigError, CoordinatorConfig, DistributedBackend};
pub use coordinator::{BatchListener, Coordinator, CoordinatorBuilder, RunState};
pub use error::{
    CheckpointError, CollectiveError, ContractViolation, CoordinatorError, CoordinatorResult, MetricLogError, Severity,
};
pub use events::{CoordinatorEvent, EventSink, RecordingEventSink, RunId, SummaryReport, TracingEventSink};
pub use layout::RunLayout;
pub use metrics::{load_last_step, BatchLogs, MetricCatalog, MetricLog, MetricRecord, ReductionKind};
pub use schedule::{LearningRateSchedule, LearningRateUpdater, Optimizer, ScheduleConfig, SharedOptimizer};
pub use step::StepCounter;
