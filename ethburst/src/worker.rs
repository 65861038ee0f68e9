//! Worker threads.
//!
//! One thread per worker: pin to a CPU, bring up its socket, flip the
//! `started` flag, then spin in the transport loop until cancelled or
//! failed. The stats thread watches the shared counter block.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use clap::ValueEnum;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::ring::RingVersion;
use crate::sock::{self, SockConfig};
use crate::transport;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    Tx,
    Rx,
    /// Send and receive on the same socket in one loop. Syscall
    /// transports only; a PACKET_MMAP ring maps one direction.
    Bidi,
}

/// The five ways a worker can move frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Plain send()/read(), one frame per syscall.
    Simple,
    /// sendmsg()/recvmsg().
    Msg,
    /// sendmmsg()/recvmmsg() batches.
    Mmsg,
    /// TPACKET_V2 PACKET_MMAP ring.
    RingV2,
    /// TPACKET_V3 PACKET_MMAP ring. Tx needs kernel 4.11 or later.
    RingV3,
}

impl TransportKind {
    pub fn ring_version(self) -> Option<RingVersion> {
        match self {
            TransportKind::RingV2 => Some(RingVersion::V2),
            TransportKind::RingV3 => Some(RingVersion::V3),
            _ => None,
        }
    }

    /// Whether this transport can serve the given direction. The ring
    /// transports map a socket for one direction only.
    pub fn supports(self, direction: Direction) -> bool {
        direction != Direction::Bidi || self.ring_version().is_none()
    }
}

/// Counters one worker publishes for the stats thread. Each is written by
/// exactly one thread, so relaxed ordering is enough; the reader only ever
/// takes deltas.
#[derive(Debug)]
pub struct WorkerShared {
    pub tx_bytes: AtomicU64,
    pub tx_frames: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_frames: AtomicU64,
    /// Set on ENOBUFS, cleared by the next successful send.
    pub stalling: AtomicBool,
    /// Socket is up and the hot loop is about to start.
    pub started: AtomicBool,
    /// Worker has stopped, cleanly or not.
    pub quit: AtomicBool,
    /// Worker stopped because of an error, not cancellation.
    pub failed: AtomicBool,
    /// Raw socket fd for PACKET_STATISTICS polling on ring Rx workers,
    /// -1 until the socket exists. The worker owns the fd; the stats
    /// thread stops using it once `quit` is set.
    pub stats_fd: AtomicI32,
    /// Ring version behind `stats_fd`.
    pub stats_v3: AtomicBool,
}

impl WorkerShared {
    pub fn new() -> Self {
        WorkerShared {
            tx_bytes: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
            stalling: AtomicBool::new(false),
            started: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stats_fd: AtomicI32::new(-1),
            stats_v3: AtomicBool::new(false),
        }
    }
}

impl Default for WorkerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative stop flag, checked at every blocking-syscall checkpoint.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: u32,
    pub sock: SockConfig,
    /// Frame to transmit, `frame_sz` bytes. Rx workers ignore it.
    pub frame: Arc<Vec<u8>>,
    /// Pin the thread to its own CPU.
    pub pin: bool,
}

/// CPU for worker `idx`: CPU 0 is left for the stats thread and everything
/// else, the rest are handed out round-robin.
pub fn affinity_slot(idx: u32, ncpus: u32) -> usize {
    if ncpus <= 1 {
        0
    } else {
        (1 + idx % (ncpus - 1)) as usize
    }
}

fn pin_to_cpu(id: u32) {
    let ncpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ncpus < 1 {
        return;
    }
    let slot = affinity_slot(id, ncpus as u32);
    let mut set = CpuSet::new();
    if set.set(slot).is_ok() {
        match sched_setaffinity(Pid::from_raw(0), &set) {
            Ok(()) => debug!(worker = id, cpu = slot, "pinned"),
            Err(errno) => warn!(worker = id, cpu = slot, %errno, "cannot set CPU affinity"),
        }
    }
}

/// Flips `quit` exactly once when the worker unwinds, so the stats thread
/// stops reading its fd no matter how the loop exits.
struct QuitGuard(Arc<WorkerShared>);

impl Drop for QuitGuard {
    fn drop(&mut self) {
        self.0.quit.swap(true, Ordering::AcqRel);
    }
}

pub fn spawn(
    cfg: WorkerConfig,
    shared: Arc<WorkerShared>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name(format!("burst{}", cfg.id))
        .spawn(move || {
            let _guard = QuitGuard(Arc::clone(&shared));
            let res = run(&cfg, &shared, &cancel);
            if let Err(ref err) = res {
                error!(worker = cfg.id, %err, "worker failed");
                // Only this worker dies; the siblings keep running.
                shared.failed.store(true, Ordering::Release);
            }
            res
        })
}

fn run(cfg: &WorkerConfig, shared: &WorkerShared, cancel: &CancelToken) -> Result<()> {
    if cfg.pin {
        pin_to_cpu(cfg.id);
    }

    if !cfg.sock.transport.supports(cfg.sock.direction) {
        return Err(Error::Unsupported(format!(
            "{:?} maps one direction only, bidirectional runs need a syscall transport",
            cfg.sock.transport
        )));
    }

    let mut sock = sock::configure(&cfg.sock)?;

    if cfg.sock.direction == Direction::Rx && cfg.sock.transport.ring_version().is_some() {
        use std::os::fd::AsRawFd;
        shared.stats_v3.store(
            cfg.sock.transport == TransportKind::RingV3,
            Ordering::Release,
        );
        shared
            .stats_fd
            .store(sock.fd.as_raw_fd(), Ordering::Release);
    }

    shared.started.store(true, Ordering::Release);
    let res = transport::run_worker(cfg, &mut sock, shared, cancel);

    // Withdraw the fd from the stats thread before the socket closes.
    shared.stats_fd.store(-1, Ordering::Release);
    drop(sock);
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_reserves_cpu_zero() {
        assert_eq!(affinity_slot(0, 4), 1);
        assert_eq!(affinity_slot(1, 4), 2);
        assert_eq!(affinity_slot(2, 4), 3);
        assert_eq!(affinity_slot(3, 4), 1);
        assert_eq!(affinity_slot(0, 1), 0);
        assert_eq!(affinity_slot(7, 1), 0);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn ring_versions_match_transports() {
        assert_eq!(TransportKind::RingV2.ring_version(), Some(RingVersion::V2));
        assert_eq!(TransportKind::RingV3.ring_version(), Some(RingVersion::V3));
        assert_eq!(TransportKind::Simple.ring_version(), None);
        assert_eq!(TransportKind::Mmsg.ring_version(), None);
    }

    #[test]
    fn rings_cannot_run_both_directions() {
        for kind in [TransportKind::Simple, TransportKind::Msg, TransportKind::Mmsg] {
            assert!(kind.supports(Direction::Bidi));
        }
        for kind in [TransportKind::RingV2, TransportKind::RingV3] {
            assert!(kind.supports(Direction::Tx));
            assert!(kind.supports(Direction::Rx));
            assert!(!kind.supports(Direction::Bidi));
        }
    }
}
