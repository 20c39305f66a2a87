//! Star-topology collective over TCP.
//!
//! Rank 0 hosts: it accepts one connection per peer, gathers every
//! contribution, sums, and broadcasts the result. Frames are newline
//! delimited JSON. Every reply names the step it answers, so a peer that gave
//! up on a round can discard the late answer instead of taking it for the next
//! one.

use super::ReductionProvider;
use crate::error::CollectiveError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Hello { rank: usize, world_size: usize },
    /// Non-finite values travel as `null`.
    Contribute { step: u64, layout: u64, values: Vec<Option<f64>> },
    Reduced { step: u64, values: Vec<Option<f64>> },
    Abort { step: u64, reason: AbortReason },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AbortReason {
    StepMismatch { min: u64, max: u64 },
    Malformed { message: String },
    Unreachable { message: String },
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Host side: highest step this peer was given up on. Contributions for
    /// it or earlier steps are stale.
    abandoned_through: Option<u64>,
}

impl Connection {
    fn new(stream: TcpStream, timeout: Duration) -> Result<Self, CollectiveError> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self { reader: BufReader::new(stream), writer, abandoned_through: None })
    }

    fn send(&mut self, frame: &Frame) -> Result<(), CollectiveError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.writer.write_all(&line).map_err(map_io)?;
        self.writer.flush().map_err(map_io)
    }

    fn recv(&mut self) -> Result<Frame, CollectiveError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(map_io)?;
        if read == 0 {
            return Err(CollectiveError::Unreachable("peer closed the connection".to_string()));
        }
        serde_json::from_str(&line).map_err(|e| CollectiveError::Malformed(format!("undecodable frame: {e}")))
    }
}

fn map_io(err: std::io::Error) -> CollectiveError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => CollectiveError::Unreachable(format!("peer timed out: {err}")),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
            CollectiveError::Unreachable(format!("peer connection lost: {err}"))
        }
        _ => CollectiveError::Io(err),
    }
}

fn encode(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().map(|v| v.is_finite().then_some(*v)).collect()
}

fn decode(values: &[Option<f64>]) -> Vec<f64> {
    values.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
}

enum Role {
    /// Connections to ranks `1..world_size`, in rank order.
    Host(Vec<Connection>),
    Peer(Connection),
}

/// One worker's endpoint of the TCP collective.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    role: Mutex<Role>,
}

impl std::fmt::Debug for TcpCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl TcpCollective {
    /// Bind `address` as rank 0 and wait for `world_size - 1` peers.
    pub fn host(address: SocketAddr, world_size: usize, timeout: Duration) -> Result<Self, CollectiveError> {
        let listener = TcpListener::bind(address)?;
        Self::host_on(listener, world_size, timeout)
    }

    /// Host on an already bound listener.
    pub fn host_on(listener: TcpListener, world_size: usize, timeout: Duration) -> Result<Self, CollectiveError> {
        let world_size = world_size.max(1);
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<Connection>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < world_size - 1 {
            match listener.accept() {
                Ok((stream, remote)) => {
                    stream.set_nonblocking(false)?;
                    let mut conn = Connection::new(stream, timeout)?;
                    let Frame::Hello { rank, world_size: peer_size } = conn.recv()? else {
                        return Err(CollectiveError::Malformed(format!("{remote} did not open with hello")));
                    };
                    if peer_size != world_size || rank == 0 || rank >= world_size {
                        return Err(CollectiveError::Malformed(format!(
                            "{remote} announced rank {rank} of {peer_size}, expected a rank in 1..{world_size}"
                        )));
                    }
                    if slots[rank - 1].is_some() {
                        return Err(CollectiveError::Malformed(format!("rank {rank} joined twice")));
                    }
                    debug!(rank, %remote, "peer joined collective");
                    slots[rank - 1] = Some(conn);
                    joined += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(CollectiveError::Unreachable(format!(
                            "only {joined} of {} peers joined within {timeout:?}",
                            world_size - 1
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let peers = slots.into_iter().flatten().collect();
        info!(world_size, "collective host ready");
        Ok(Self { rank: 0, world_size, role: Mutex::new(Role::Host(peers)) })
    }

    /// Connect to the host as `rank`, retrying until `timeout` elapses.
    pub fn join(address: SocketAddr, rank: usize, world_size: usize, timeout: Duration) -> Result<Self, CollectiveError> {
        if rank == 0 || rank >= world_size {
            return Err(CollectiveError::Malformed(format!("cannot join as rank {rank} of {world_size}")));
        }
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    debug!(rank, %address, error = %e, "collective host not reachable yet");
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(CollectiveError::Unreachable(format!("cannot reach collective host {address}: {e}")));
                }
            }
        };
        let mut conn = Connection::new(stream, timeout)?;
        conn.send(&Frame::Hello { rank, world_size })?;
        Ok(Self { rank, world_size, role: Mutex::new(Role::Peer(conn)) })
    }

    /// Read `conn`'s contribution for the current round, skipping any it sent
    /// for a round the host already gave up on.
    fn next_contribution(conn: &mut Connection, rank: usize) -> Result<(u64, u64, Vec<Option<f64>>), CollectiveError> {
        loop {
            match conn.recv()? {
                Frame::Contribute { step, .. } if conn.abandoned_through.is_some_and(|through| step <= through) => {
                    debug!(rank, step, "discarding stale contribution");
                }
                Frame::Contribute { step, layout, values } => return Ok((step, layout, values)),
                other => {
                    return Err(CollectiveError::Malformed(format!("rank {rank} sent an unexpected frame: {other:?}")));
                }
            }
        }
    }

    fn host_sum(peers: &mut [Connection], step: u64, layout: u64, values: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        let mut acc = values.to_vec();
        let mut min = step;
        let mut max = step;
        let mut malformed = None;
        let mut unreachable = None;

        for (idx, conn) in peers.iter_mut().enumerate() {
            let rank = idx + 1;
            let (peer_step, peer_layout, peer_values) = match Self::next_contribution(conn, rank) {
                Ok(contribution) => contribution,
                Err(CollectiveError::Malformed(message)) => {
                    malformed.get_or_insert(message);
                    continue;
                }
                Err(e) => {
                    conn.abandoned_through = Some(step);
                    unreachable.get_or_insert_with(|| format!("rank {rank} at step {step}: {e}"));
                    continue;
                }
            };
            min = min.min(peer_step);
            max = max.max(peer_step);
            if peer_layout != layout {
                malformed
                    .get_or_insert_with(|| format!("rank {rank} reduces a different set of values at step {peer_step}"));
            } else if peer_values.len() != acc.len() {
                malformed.get_or_insert_with(|| {
                    format!("rank {rank} contributed {} values, expected {}", peer_values.len(), acc.len())
                });
            } else {
                for (a, v) in acc.iter_mut().zip(decode(&peer_values)) {
                    *a += v;
                }
            }
        }

        let abort = if min != max {
            Some(AbortReason::StepMismatch { min, max })
        } else if let Some(message) = malformed {
            Some(AbortReason::Malformed { message })
        } else {
            unreachable.map(|message| AbortReason::Unreachable { message })
        };

        let (reply, result) = match abort {
            Some(reason) => {
                let err = abort_error(&reason, step);
                (Frame::Abort { step, reason }, Err(err))
            }
            None => (Frame::Reduced { step, values: encode(&acc) }, Ok(acc)),
        };
        for (idx, conn) in peers.iter_mut().enumerate() {
            if let Err(e) = conn.send(&reply) {
                debug!(rank = idx + 1, step, error = %e, "could not deliver collective reply");
            }
        }
        result
    }

    fn peer_sum(conn: &mut Connection, step: u64, layout: u64, values: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        conn.send(&Frame::Contribute { step, layout, values: encode(values) })?;
        loop {
            let (reply_step, outcome) = match conn.recv()? {
                Frame::Reduced { step: reply_step, values } => (reply_step, Ok(decode(&values))),
                Frame::Abort { step: reply_step, reason } => (reply_step, Err(abort_error(&reason, step))),
                other => return Err(CollectiveError::Malformed(format!("unexpected frame from host: {other:?}"))),
            };
            match reply_step.cmp(&step) {
                std::cmp::Ordering::Less => debug!(step, reply_step, "discarding reply for an earlier round"),
                std::cmp::Ordering::Equal => return outcome,
                std::cmp::Ordering::Greater => {
                    return Err(CollectiveError::Malformed(format!(
                        "host answered step {reply_step} while this worker is at step {step}"
                    )));
                }
            }
        }
    }
}

fn abort_error(reason: &AbortReason, step: u64) -> CollectiveError {
    match reason {
        AbortReason::StepMismatch { min, max } => {
            CollectiveError::StepMismatch { local: step, peer: if step == *min { *max } else { *min } }
        }
        AbortReason::Malformed { message } => CollectiveError::Malformed(message.clone()),
        AbortReason::Unreachable { message } => CollectiveError::Unreachable(message.clone()),
    }
}

impl ReductionProvider for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world_size
    }

    fn sum(&self, step: u64, layout: u64, values: &[f64]) -> Result<Vec<f64>, CollectiveError> {
        let mut role = self
            .role
            .lock()
            .map_err(|_| CollectiveError::Unreachable("tcp collective state poisoned".to_string()))?;
        match &mut *role {
            Role::Host(peers) => Self::host_sum(peers, step, layout, values),
            Role::Peer(conn) => Self::peer_sum(conn, step, layout, values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::layout_fingerprint;
    use std::thread;

    const LAYOUT: u64 = 0x5eed;

    fn bind_local() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_tcp_collective_sums_three_workers() {
        let (listener, addr) = bind_local();
        let timeout = Duration::from_secs(5);

        let peers: Vec<_> = (1..3)
            .map(|rank| {
                thread::spawn(move || {
                    let peer = TcpCollective::join(addr, rank, 3, timeout).unwrap();
                    assert_eq!(peer.rank(), rank);
                    let first = peer.sum(5, LAYOUT, &[rank as f64, 1.0]).unwrap();
                    let second = peer.sum(10, LAYOUT, &[rank as f64, 2.0]).unwrap();
                    (first, second)
                })
            })
            .collect();

        let host = TcpCollective::host_on(listener, 3, timeout).unwrap();
        assert!(host.is_leader());
        assert_eq!(host.sum(5, LAYOUT, &[0.0, 1.0]).unwrap(), vec![3.0, 3.0]);
        assert_eq!(host.sum(10, LAYOUT, &[0.0, 2.0]).unwrap(), vec![3.0, 6.0]);

        for handle in peers {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, vec![3.0, 3.0]);
            assert_eq!(second, vec![3.0, 6.0]);
        }
    }

    #[test]
    fn test_tcp_collective_aborts_on_step_mismatch() {
        let (listener, addr) = bind_local();
        let timeout = Duration::from_secs(5);

        let peer = thread::spawn(move || {
            let peer = TcpCollective::join(addr, 1, 2, timeout).unwrap();
            peer.sum(11, LAYOUT, &[1.0]).unwrap_err()
        });

        let host = TcpCollective::host_on(listener, 2, timeout).unwrap();
        let err = host.sum(10, LAYOUT, &[1.0]).unwrap_err();
        assert!(matches!(err, CollectiveError::StepMismatch { local: 10, peer: 11 }));

        let peer_err = peer.join().unwrap();
        assert!(matches!(peer_err, CollectiveError::StepMismatch { local: 11, peer: 10 }));
    }

    #[test]
    fn test_tcp_collective_carries_non_finite_values() {
        let (listener, addr) = bind_local();
        let timeout = Duration::from_secs(5);

        let peer = thread::spawn(move || {
            let peer = TcpCollective::join(addr, 1, 2, timeout).unwrap();
            peer.sum(1, LAYOUT, &[f64::NAN, 1.0]).unwrap()
        });

        let host = TcpCollective::host_on(listener, 2, timeout).unwrap();
        let reduced = host.sum(1, LAYOUT, &[1.0, 1.0]).unwrap();
        assert!(reduced[0].is_nan());
        assert_eq!(reduced[1], 2.0);
        assert!(peer.join().unwrap()[0].is_nan());
    }

    #[test]
    fn test_tcp_host_times_out_without_peers() {
        let (listener, _addr) = bind_local();
        let err = TcpCollective::host_on(listener, 2, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CollectiveError::Unreachable(_)));
    }

    #[test]
    fn test_tcp_join_rejects_rank_zero() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = TcpCollective::join(addr, 0, 2, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CollectiveError::Malformed(_)));
    }

    #[test]
    fn test_late_reply_is_not_taken_for_the_next_round() {
        let (listener, addr) = bind_local();
        let (gave_up_tx, gave_up_rx) = std::sync::mpsc::channel();

        let peer = thread::spawn(move || {
            let peer = TcpCollective::join(addr, 1, 2, Duration::from_millis(300)).unwrap();
            let first = peer.sum(5, LAYOUT, &[1.0]);
            gave_up_tx.send(()).unwrap();
            (first, peer.sum(10, LAYOUT, &[100.0]))
        });

        let host = TcpCollective::host_on(listener, 2, Duration::from_secs(5)).unwrap();
        gave_up_rx.recv().unwrap();
        // The peer's step-5 contribution is still queued, so the host completes
        // the round the peer already gave up on.
        assert_eq!(host.sum(5, LAYOUT, &[2.0]).unwrap(), vec![3.0]);
        assert_eq!(host.sum(10, LAYOUT, &[200.0]).unwrap(), vec![300.0]);

        let (first, second) = peer.join().unwrap();
        assert!(matches!(first, Err(CollectiveError::Unreachable(_))));
        assert_eq!(second.unwrap(), vec![300.0]);
    }

    #[test]
    fn test_host_keeps_serving_after_a_peer_times_out() {
        let (listener, addr) = bind_local();
        let timeout = Duration::from_millis(300);
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();

        let slow = thread::spawn(move || {
            let peer = TcpCollective::join(addr, 2, 3, Duration::from_secs(5)).unwrap();
            go_rx.recv().unwrap();
            // Too late for step 1; the host has already given up on this rank.
            let late = peer.sum(1, LAYOUT, &[50.0]);
            (late, peer.sum(2, LAYOUT, &[20.0]))
        });
        let prompt = thread::spawn(move || {
            let peer = TcpCollective::join(addr, 1, 3, Duration::from_secs(5)).unwrap();
            (peer.sum(1, LAYOUT, &[10.0]), peer.sum(2, LAYOUT, &[10.0]))
        });

        let host = TcpCollective::host_on(listener, 3, timeout).unwrap();
        let err = host.sum(1, LAYOUT, &[1.0]).unwrap_err();
        assert!(matches!(err, CollectiveError::Unreachable(msg) if msg.contains("rank 2")));
        go_tx.send(()).unwrap();
        assert_eq!(host.sum(2, LAYOUT, &[1.0]).unwrap(), vec![31.0]);

        let (first, second) = prompt.join().unwrap();
        assert!(matches!(first, Err(CollectiveError::Unreachable(_))));
        assert_eq!(second.unwrap(), vec![31.0]);
        let (late, second) = slow.join().unwrap();
        assert!(matches!(late, Err(CollectiveError::Unreachable(_))));
        assert_eq!(second.unwrap(), vec![31.0]);
    }

    #[test]
    fn test_tcp_collective_rejects_different_layouts() {
        let (listener, addr) = bind_local();
        let timeout = Duration::from_secs(5);

        let peer = thread::spawn(move || {
            let peer = TcpCollective::join(addr, 1, 2, timeout).unwrap();
            peer.sum(4, layout_fingerprint(["loss", "samples"]), &[3.0, 64.0]).unwrap_err()
        });

        let host = TcpCollective::host_on(listener, 2, timeout).unwrap();
        let err = host.sum(4, layout_fingerprint(["accuracy", "loss"]), &[0.5, 1.0]).unwrap_err();
        assert!(matches!(err, CollectiveError::Malformed(msg) if msg.contains("different set of values")));
        assert!(matches!(peer.join().unwrap(), CollectiveError::Malformed(_)));
    }
}
