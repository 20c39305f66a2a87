//! Turns "a batch finished" into step bookkeeping, metric reduction,
//! checkpoint cadence and learning-rate updates.
//!
//! One [`Coordinator`] runs per worker. It owns the [`StepCounter`] and an
//! ordered list of [`BatchListener`]s; on every batch end it advances the
//! step once and hands it to each listener in turn:
//!
//! 1. metrics: reduce across workers, compute rates, append the summary row,
//!    flush the metric log on checkpoint cadence (leader only for the
//!    durable parts)
//! 2. checkpoints (leader only)
//! 3. learning rate
//! 4. any extra listeners, in registration order
//!
//! A checkpoint and the metric row of the same step are therefore always
//! produced from the same reduced values.

use crate::checkpoint::{CheckpointScheduler, CheckpointStore, DirectoryCheckpointStore, ModelState};
use crate::collective::{layout_fingerprint, NullProvider, ReductionProvider};
use crate::config::CoordinatorConfig;
use crate::error::{error_chain, CollectiveError, ContractViolation, CoordinatorResult, Severity};
use crate::events::{CoordinatorEvent, EventSink, RunId, SummaryReport, TracingEventSink};
use crate::layout::RunLayout;
use crate::metrics::{
    load_last_step, BatchLogs, MetricCatalog, MetricLog, MetricRecord, MetricReducer, ThroughputTracker, ACCURACY,
    LOSS,
};
use crate::schedule::{LearningRateSchedule, LearningRateUpdater, SharedOptimizer};
use crate::step::StepCounter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// A participant in the per-batch dispatch.
///
/// Listeners never track the step themselves; the coordinator passes the
/// authoritative value into every hook.
pub trait BatchListener: Send {
    fn name(&self) -> &str;

    fn on_run_begin(&mut self, _start_step: u64) -> CoordinatorResult<()> {
        Ok(())
    }

    /// `step` is the step the upcoming batch will complete.
    fn on_batch_begin(&mut self, _step: u64) -> CoordinatorResult<()> {
        Ok(())
    }

    /// `step` is the freshly advanced global step. Listeners may rewrite
    /// `logs`; later listeners see the rewritten values.
    fn on_batch_end(&mut self, step: u64, logs: &mut BatchLogs) -> CoordinatorResult<()>;

    fn on_run_end(&mut self, _final_step: u64) -> CoordinatorResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Complete,
}

impl RunState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Complete => "complete",
        }
    }
}

#[derive(Clone)]
struct Emitter {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Emitter {
    fn emit(&self, event: &CoordinatorEvent) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }
}

struct MetricListener {
    reducer: MetricReducer,
    tracker: ThroughputTracker,
    /// Present on the leader only.
    log: Option<MetricLog>,
    schedule: Option<Arc<dyn LearningRateSchedule>>,
    summary_interval: u64,
    flush_interval: u64,
    emitter: Emitter,
}

impl MetricListener {
    fn summarize(&mut self, step: u64, logs: &mut BatchLogs) -> CoordinatorResult<()> {
        let reduced = self.reducer.reduce(step, logs)?;
        for (name, value) in &reduced.values {
            logs.insert(name.clone(), *value);
        }

        let loss = *reduced.values.get(LOSS).ok_or(ContractViolation::MissingLoss { step })?;
        if !loss.is_finite() {
            return Err(ContractViolation::UnsupportedLossValue { step, value: loss }.into());
        }

        let rates = self.tracker.rates(&reduced.sums, self.reducer.worker_count());
        self.tracker.reset();

        let Some(log) = self.log.as_mut() else {
            return Ok(());
        };

        // The rate in force while the finished batch ran.
        let learning_rate = match &self.schedule {
            Some(schedule) => {
                let at = step.saturating_sub(1);
                let value = schedule.learning_rate(at);
                if !value.is_finite() {
                    return Err(ContractViolation::NonFiniteLearningRate { step: at, value }.into());
                }
                Some(value)
            }
            None => None,
        };

        log.append(MetricRecord { step, loss, learning_rate, accuracy: reduced.values.get(ACCURACY).copied() });
        self.emitter.emit(&CoordinatorEvent::Summary(SummaryReport {
            step,
            metrics: reduced.values,
            per_step: rates.per_step,
            per_second: rates.per_second,
            learning_rate,
            reduced: reduced.reduced,
        }));
        Ok(())
    }

    fn flush(&self, step: u64) -> CoordinatorResult<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        if log.records().is_empty() {
            return Ok(());
        }
        log.flush_to_durable()?;
        self.emitter.emit(&CoordinatorEvent::MetricLogFlushed {
            step,
            rows: log.records().len(),
            path: log.path().to_path_buf(),
        });
        Ok(())
    }
}

impl BatchListener for MetricListener {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_batch_begin(&mut self, _step: u64) -> CoordinatorResult<()> {
        self.tracker.on_trigger_begin();
        Ok(())
    }

    fn on_batch_end(&mut self, step: u64, logs: &mut BatchLogs) -> CoordinatorResult<()> {
        let elapsed = self.tracker.on_trigger_end();
        trace!(step, elapsed_us = elapsed.as_micros() as u64, "batch finished");

        if step % self.summary_interval == 0 {
            self.summarize(step, logs)?;
        }
        if step % self.flush_interval == 0 {
            self.flush(step)?;
        }
        Ok(())
    }

    fn on_run_end(&mut self, final_step: u64) -> CoordinatorResult<()> {
        self.flush(final_step)
    }
}

struct CheckpointListener {
    scheduler: CheckpointScheduler,
    emitter: Emitter,
}

impl BatchListener for CheckpointListener {
    fn name(&self) -> &str {
        "checkpoints"
    }

    fn on_batch_end(&mut self, step: u64, _logs: &mut BatchLogs) -> CoordinatorResult<()> {
        match self.scheduler.on_step(step) {
            Ok(Some(handle)) => {
                let elapsed_ms = self.scheduler.last_save_duration().map_or(0, |d| d.as_millis() as u64);
                self.emitter.emit(&CoordinatorEvent::CheckpointSaved { step, path: handle.path, elapsed_ms });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.emitter.emit(&CoordinatorEvent::CheckpointFailed { step, error: error_chain(&e) });
                Err(e.into())
            }
        }
    }
}

struct LearningRateListener {
    updater: LearningRateUpdater,
    emitter: Emitter,
}

impl BatchListener for LearningRateListener {
    fn name(&self) -> &str {
        "learning_rate"
    }

    /// The first batch of the run trains with `schedule(start_step)`.
    fn on_run_begin(&mut self, start_step: u64) -> CoordinatorResult<()> {
        let learning_rate = self.updater.apply(start_step)?;
        self.emitter.emit(&CoordinatorEvent::LearningRateUpdated { step: start_step, learning_rate });
        Ok(())
    }

    fn on_batch_end(&mut self, step: u64, _logs: &mut BatchLogs) -> CoordinatorResult<()> {
        if let Some(learning_rate) = self.updater.on_step(step)? {
            self.emitter.emit(&CoordinatorEvent::LearningRateUpdated { step, learning_rate });
        }
        Ok(())
    }
}

/// Per-worker dispatcher driven by the training loop.
pub struct Coordinator {
    run_id: RunId,
    counter: StepCounter,
    provider: Arc<dyn ReductionProvider>,
    listeners: Vec<Box<dyn BatchListener>>,
    emitter: Emitter,
    state: RunState,
    initial_step: Option<u64>,
    metric_log_path: PathBuf,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("run_id", &self.run_id)
            .field("step", &self.counter.current())
            .field("rank", &self.provider.rank())
            .field("state", &self.state)
            .field("listeners", &self.listeners.iter().map(|l| l.name().to_string()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    #[must_use]
    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn step(&self) -> u64 {
        self.counter.current()
    }

    /// Handle to the global step, for components outside the dispatch.
    #[must_use]
    pub fn counter(&self) -> StepCounter {
        self.counter.clone()
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.provider.is_leader()
    }

    #[must_use]
    pub fn listener_names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    fn expect_state(&self, expected: RunState) -> CoordinatorResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ContractViolation::InvalidState { expected: expected.as_str(), found: self.state.as_str() }.into())
        }
    }

    /// Explicit resume value, else the last step in the metric log, else 0.
    fn resolve_start_step(&self) -> u64 {
        if let Some(step) = self.initial_step {
            info!(step, "starting from configured initial step");
            return step;
        }
        load_last_step(&self.metric_log_path).unwrap_or(0)
    }

    /// Every worker adopts the leader's start step.
    fn agree_on_start_step(&self, local: u64) -> CoordinatorResult<u64> {
        if self.provider.size() <= 1 {
            return Ok(local);
        }
        let contribution = if self.provider.is_leader() { local as f64 } else { 0.0 };
        let summed = self.provider.sum(0, layout_fingerprint(["start_step"]), &[contribution])?;
        match summed.as_slice() {
            [value] if value.is_finite() && *value >= 0.0 => Ok(*value as u64),
            other => Err(CollectiveError::Malformed(format!("start step broadcast returned {other:?}")).into()),
        }
    }

    /// Resolve the starting step and move to `Running`. Returns the start step.
    pub fn begin_run(&mut self) -> CoordinatorResult<u64> {
        self.expect_state(RunState::Init)?;

        let local = if self.provider.is_leader() { self.resolve_start_step() } else { 0 };
        let start = self.agree_on_start_step(local)?;
        self.counter.resume_from(start)?;
        self.counter.mark_started();

        for listener in &mut self.listeners {
            let result = listener.on_run_begin(start);
            triage(listener.name(), start, "run_begin", result)?;
        }

        self.state = RunState::Running;
        self.emitter.emit(&CoordinatorEvent::RunStarted {
            run_id: self.run_id.clone(),
            start_step: start,
            rank: self.provider.rank(),
            world_size: self.provider.size(),
        });
        Ok(start)
    }

    pub fn on_batch_begin(&mut self) -> CoordinatorResult<()> {
        self.expect_state(RunState::Running)?;
        let step = self.counter.current() + 1;
        for listener in &mut self.listeners {
            let result = listener.on_batch_begin(step);
            triage(listener.name(), step, "batch_begin", result)?;
        }
        Ok(())
    }

    /// Advance the step and dispatch `logs` to every listener. Returns the
    /// new step. On summary steps `logs` holds the reduced values afterwards.
    ///
    /// Operational failures are logged and swallowed; only fatal ones are
    /// returned, and the run should stop.
    pub fn on_batch_end(&mut self, logs: &mut BatchLogs) -> CoordinatorResult<u64> {
        self.expect_state(RunState::Running)?;
        let step = self.counter.advance();
        for listener in &mut self.listeners {
            let result = listener.on_batch_end(step, logs);
            triage(listener.name(), step, "batch_end", result)?;
        }
        Ok(step)
    }

    /// Final flush and move to `Complete`. Returns the final step.
    pub fn finish(&mut self) -> CoordinatorResult<u64> {
        self.expect_state(RunState::Running)?;
        let step = self.counter.current();
        for listener in &mut self.listeners {
            let result = listener.on_run_end(step);
            triage(listener.name(), step, "run_end", result)?;
        }
        self.state = RunState::Complete;
        self.emitter.emit(&CoordinatorEvent::RunFinished { run_id: self.run_id.clone(), final_step: step });
        Ok(step)
    }
}

/// Apply the severity policy to one listener outcome.
fn triage(listener: &str, step: u64, phase: &'static str, result: CoordinatorResult<()>) -> CoordinatorResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => match e.severity() {
            Severity::Operational => {
                warn!(listener, step, phase, error = %error_chain(&e), "listener failed; training continues");
                Ok(())
            }
            Severity::Fatal => {
                error!(listener, step, phase, error = %error_chain(&e), "fatal coordinator error");
                Err(e)
            }
        },
    }
}

/// Wires a [`Coordinator`] from configuration and collaborators.
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    provider: Arc<dyn ReductionProvider>,
    catalog: Option<MetricCatalog>,
    schedule: Option<Arc<dyn LearningRateSchedule>>,
    optimizer: Option<SharedOptimizer>,
    model: Option<Arc<dyn ModelState>>,
    store: Option<Box<dyn CheckpointStore>>,
    model_config: Option<serde_json::Value>,
    sinks: Vec<Arc<dyn EventSink>>,
    listeners: Vec<Box<dyn BatchListener>>,
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("config", &self.config)
            .field("rank", &self.provider.rank())
            .field("size", &self.provider.size())
            .finish_non_exhaustive()
    }
}

impl CoordinatorBuilder {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            provider: Arc::new(NullProvider),
            catalog: None,
            schedule: None,
            optimizer: None,
            model: None,
            store: None,
            model_config: None,
            sinks: vec![Arc::new(TracingEventSink)],
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ReductionProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Reduction kinds; defaults to the `[metrics]` section of the config.
    #[must_use]
    pub fn catalog(mut self, catalog: MetricCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Optimizer whose learning-rate slot follows the schedule.
    #[must_use]
    pub fn optimizer(mut self, optimizer: SharedOptimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Schedule to use instead of the `[learning_rate]` section of the config.
    #[must_use]
    pub fn schedule(mut self, schedule: Arc<dyn LearningRateSchedule>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Model whose state is checkpointed into the run's checkpoint directory.
    #[must_use]
    pub fn model(mut self, model: Arc<dyn ModelState>) -> Self {
        self.model = Some(model);
        self
    }

    /// Checkpoint backend to use instead of the directory store.
    #[must_use]
    pub fn checkpoint_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn model_config(mut self, config: serde_json::Value) -> Self {
        self.model_config = Some(config);
        self
    }

    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Extra listener, dispatched after the built-in ones.
    #[must_use]
    pub fn listener(mut self, listener: Box<dyn BatchListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> CoordinatorResult<Coordinator> {
        self.config.validate()?;
        let config = self.config;
        let layout = RunLayout::from(&config);
        let leader = self.provider.is_leader();
        let emitter = Emitter { sinks: self.sinks };

        let schedule: Option<Arc<dyn LearningRateSchedule>> = match (self.schedule, &self.optimizer) {
            (Some(schedule), _) => Some(schedule),
            (None, Some(_)) => Some(Arc::new(config.learning_rate.clone())),
            (None, None) => None,
        };

        let mut listeners: Vec<Box<dyn BatchListener>> = Vec::new();
        let catalog = self.catalog.unwrap_or_else(|| config.metrics.catalog());
        listeners.push(Box::new(MetricListener {
            reducer: MetricReducer::new(Arc::clone(&self.provider), catalog),
            tracker: ThroughputTracker::new(config.summary_interval_steps),
            log: leader.then(|| MetricLog::open(layout.metric_log_path())),
            schedule: schedule.clone(),
            summary_interval: config.summary_interval_steps,
            flush_interval: config.checkpoint_interval_steps,
            emitter: emitter.clone(),
        }));

        if leader {
            let model_config = self.model_config.or_else(|| self.model.as_ref().map(|m| m.structural_config()));
            let store: Option<Box<dyn CheckpointStore>> = match (self.store, self.model) {
                (Some(store), _) => Some(store),
                (None, Some(model)) => Some(Box::new(DirectoryCheckpointStore::open(
                    layout.checkpoints_dir(),
                    config.checkpoints_max_to_keep,
                    model,
                )?)),
                (None, None) => None,
            };
            match store {
                Some(store) => {
                    let mut scheduler = CheckpointScheduler::new(store, config.checkpoint_interval_steps);
                    if let Some(model_config) = model_config {
                        scheduler = scheduler.with_model_config(model_config);
                    }
                    listeners.push(Box::new(CheckpointListener { scheduler, emitter: emitter.clone() }));
                }
                None => debug!("no checkpoint store configured; checkpoints disabled"),
            }
        }

        if let (Some(schedule), Some(optimizer)) = (schedule, self.optimizer) {
            let updater = LearningRateUpdater::new(schedule, optimizer, config.lr_update_interval_steps);
            listeners.push(Box::new(LearningRateListener { updater, emitter: emitter.clone() }));
        }

        listeners.extend(self.listeners);

        Ok(Coordinator {
            run_id: RunId::new(),
            counter: StepCounter::new(0),
            provider: self.provider,
            listeners,
            emitter,
            state: RunState::Init,
            initial_step: config.initial_global_step,
            metric_log_path: layout.metric_log_path(),
        })
    }
}
