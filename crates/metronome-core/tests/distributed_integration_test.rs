//! Multi-worker runs: every worker drives its own coordinator.

use metronome_core::{
    BatchLogs, CollectiveError, Coordinator, CoordinatorConfig, CoordinatorError, LocalGroup, MetricLog,
    RecordingEventSink, ReductionProvider, TcpCollective,
};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(dir: &Path, summary: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        summary_interval_steps: summary,
        checkpoint_interval_steps: 10,
        output_dir: dir.to_path_buf(),
        ..CoordinatorConfig::default()
    }
}

/// Worker `rank` reports loss `1 + 2 * rank` and a running token count of
/// `100 * (1 + 2 * rank)` per step.
fn worker_logs(rank: usize, step: u64, reversed: bool) -> BatchLogs {
    let scale = 1.0 + 2.0 * rank as f64;
    let mut entries = vec![
        ("loss".to_string(), scale),
        ("accuracy".to_string(), 0.25 * scale),
        ("trg_tokens".to_string(), 100.0 * scale * step as f64),
    ];
    if reversed {
        entries.reverse();
    }
    entries.into_iter().collect()
}

fn drive(
    provider: Arc<dyn ReductionProvider>,
    config: CoordinatorConfig,
    sink: Arc<RecordingEventSink>,
    steps: u64,
) -> Result<Vec<BatchLogs>, CoordinatorError> {
    let rank = provider.rank();
    let mut coordinator = Coordinator::builder(config).provider(provider).event_sink(sink).build()?;
    let start = coordinator.begin_run()?;
    let mut seen = Vec::new();
    for step in start + 1..=start + steps {
        let mut logs = worker_logs(rank, step, rank % 2 == 1);
        coordinator.on_batch_begin()?;
        coordinator.on_batch_end(&mut logs)?;
        seen.push(logs);
    }
    coordinator.finish()?;
    Ok(seen)
}

#[test]
fn test_local_workers_agree_on_reduced_metrics() {
    let temp = TempDir::new().unwrap();
    let sinks: Vec<Arc<RecordingEventSink>> = (0..2).map(|_| Arc::new(RecordingEventSink::new())).collect();
    let workers = LocalGroup::new(2, TIMEOUT);

    let results: Vec<Vec<BatchLogs>> = thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .zip(&sinks)
            .map(|(worker, sink)| {
                let config = config(temp.path(), 5);
                let sink = sink.clone();
                scope.spawn(move || drive(Arc::new(worker), config, sink, 10).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Summary steps carry the reduced values on every worker.
    for worker in &results {
        assert_eq!(worker[4]["loss"], 2.0);
        assert_eq!(worker[4]["accuracy"], 0.5);
    }
    assert_eq!(results[0][4], results[1][4]);
    // Off-interval steps keep the local values.
    assert_eq!(results[1][0]["loss"], 3.0);

    // Only the leader emits summaries.
    let summaries = sinks[0].summaries();
    assert_eq!(summaries.iter().map(|s| s.step).collect::<Vec<_>>(), vec![5, 10]);
    assert!(sinks[1].summaries().is_empty());

    // 100 + 300 tokens per step across both workers.
    assert_eq!(summaries[0].per_step["trg_tokens"], 400.0);
    assert_eq!(summaries[1].per_step["trg_tokens"], 400.0);
    assert!(summaries.iter().all(|s| s.reduced));

    let log = MetricLog::open(temp.path().join("training_data.csv"));
    assert_eq!(log.records().iter().map(|r| r.step).collect::<Vec<_>>(), vec![5, 10]);
}

#[test]
fn test_workers_adopt_leader_start_step() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("training_data.csv"), "step,loss,lr,accuracy\n30,1.0,,\n").unwrap();
    let workers = LocalGroup::new(3, TIMEOUT);

    let starts: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| {
                let config = config(temp.path(), 5);
                scope.spawn(move || {
                    let mut coordinator =
                        Coordinator::builder(config).provider(Arc::new(worker)).build().unwrap();
                    coordinator.begin_run().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(starts, vec![30, 30, 30]);
}

#[test]
fn test_step_mismatch_between_workers_is_fatal() {
    let temp = TempDir::new().unwrap();
    let workers = LocalGroup::new(2, TIMEOUT);

    let errors: Vec<CoordinatorError> = thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| {
                // Rank 0 reduces on even steps, rank 1 on every step: their
                // first reductions happen at different steps.
                let summary = if worker.rank() == 0 { 2 } else { 1 };
                let config = config(temp.path(), summary);
                let sink = Arc::new(RecordingEventSink::new());
                scope.spawn(move || drive(Arc::new(worker), config, sink, 4).unwrap_err())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for err in &errors {
        assert!(err.is_fatal(), "{err}");
        assert!(matches!(err, CoordinatorError::Collective(CollectiveError::StepMismatch { .. })));
    }
}

#[test]
fn test_tcp_workers_reduce_over_sockets() {
    let temp = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let leader_sink = Arc::new(RecordingEventSink::new());

    thread::scope(|scope| {
        let leader = {
            let config = config(temp.path(), 5);
            let sink = leader_sink.clone();
            scope.spawn(move || {
                let host = TcpCollective::host_on(listener, 2, TIMEOUT).unwrap();
                drive(Arc::new(host), config, sink, 10).unwrap()
            })
        };
        let peer = {
            let config = config(temp.path(), 5);
            scope.spawn(move || {
                let peer = TcpCollective::join(address, 1, 2, TIMEOUT).unwrap();
                drive(Arc::new(peer), config, Arc::new(RecordingEventSink::new()), 10).unwrap()
            })
        };
        let leader_logs = leader.join().unwrap();
        let peer_logs = peer.join().unwrap();
        assert_eq!(leader_logs[9]["loss"], 2.0);
        assert_eq!(peer_logs[9]["loss"], 2.0);
    });

    let summaries = leader_sink.summaries();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[1].per_step["trg_tokens"], 400.0);
}
