//! Per-second throughput reporting.
//!
//! A dedicated thread sums the worker counters once a second and prints
//! the deltas. Ring Rx drop counts come from PACKET_STATISTICS, which is
//! clear-on-read, so each read is already the per-interval figure.

use std::os::fd::BorrowedFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::ring::RingVersion;
use crate::sock;
use crate::worker::{CancelToken, WorkerShared};

/// Sleep granularity; the cancel token is rechecked every tick.
const TICK: Duration = Duration::from_millis(200);
const TICKS_PER_CYCLE: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    tx_bytes: u64,
    tx_frames: u64,
    rx_bytes: u64,
    rx_frames: u64,
}

fn gather(workers: &[Arc<WorkerShared>]) -> Totals {
    let mut totals = Totals::default();
    for w in workers {
        totals.tx_bytes += w.tx_bytes.load(Ordering::Relaxed);
        totals.tx_frames += w.tx_frames.load(Ordering::Relaxed);
        totals.rx_bytes += w.rx_bytes.load(Ordering::Relaxed);
        totals.rx_frames += w.rx_frames.load(Ordering::Relaxed);
    }
    totals
}

/// Decimal gigabits for one second's worth of bytes.
fn gbps(bytes: u64) -> f64 {
    bytes as f64 * 8.0 / 1_000_000_000.0
}

/// Per-interval Rx ring drops and queue freezes across the workers.
fn ring_drops(workers: &[Arc<WorkerShared>]) -> (u64, u64) {
    let mut drops = 0u64;
    let mut freezes = 0u64;
    for w in workers {
        if w.quit.load(Ordering::Acquire) {
            continue;
        }
        let raw = w.stats_fd.load(Ordering::Acquire);
        if raw < 0 {
            continue;
        }
        let version = if w.stats_v3.load(Ordering::Acquire) {
            RingVersion::V3
        } else {
            RingVersion::V2
        };
        // The worker nulls stats_fd before closing the socket; a lost
        // race only costs one sample.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        if let Ok(stats) = sock::ring_rx_stats(fd, version) {
            drops += stats.drops;
            freezes += stats.freezes;
        }
    }
    (drops, freezes)
}

pub fn spawn(
    workers: Vec<Arc<WorkerShared>>,
    verbose: bool,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stats".to_string())
        .spawn(move || run(&workers, verbose, &cancel))
}

fn run(workers: &[Arc<WorkerShared>], verbose: bool, cancel: &CancelToken) {
    // Hold off until a worker is actually moving frames, otherwise the
    // first line reports a fraction of a second.
    loop {
        if cancel.is_cancelled() || should_stop(workers) {
            return;
        }
        if workers
            .iter()
            .any(|w| w.started.load(Ordering::Acquire))
        {
            break;
        }
        thread::sleep(TICK);
    }

    let mut previous = gather(workers);
    let mut seconds = 0u64;

    loop {
        for _ in 0..TICKS_PER_CYCLE {
            if cancel.is_cancelled() || should_stop(workers) {
                return;
            }
            thread::sleep(TICK);
        }
        seconds += 1;

        for (id, w) in workers.iter().enumerate() {
            if w.stalling.swap(false, Ordering::Relaxed) {
                warn!(worker = id, "socket is stalling");
            }
        }

        let now = gather(workers);
        let (drops, freezes) = ring_drops(workers);

        let rx_gbps = gbps(now.rx_bytes - previous.rx_bytes);
        let rx_fps = now.rx_frames - previous.rx_frames;
        let tx_gbps = gbps(now.tx_bytes - previous.tx_bytes);
        let tx_fps = now.tx_frames - previous.tx_frames;

        if verbose {
            println!(
                "{seconds}.\tRx: {rx_gbps:.2} Gbps ({rx_fps} fps) {drops} Drops {freezes} Q-Freeze\tTx: {tx_gbps:.2} Gbps ({tx_fps} fps)"
            );
        } else {
            println!(
                "{seconds}.\tRx: {rx_gbps:.2} Gbps ({rx_fps} fps)\tTx: {tx_gbps:.2} Gbps ({tx_fps} fps)"
            );
        }

        previous = now;
    }
}

/// The reporter stops once every worker has quit, or as soon as one has
/// quit because of an error. A worker failing on its own does not stop
/// its siblings, only the reporting for them ends with the run.
fn should_stop(workers: &[Arc<WorkerShared>]) -> bool {
    let mut all = true;
    for w in workers {
        if w.quit.load(Ordering::Acquire) {
            if w.failed.load(Ordering::Acquire) {
                return true;
            }
        } else {
            all = false;
        }
    }
    all
}
