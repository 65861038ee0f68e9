//! Worker failure isolation.
//!
//! A worker that cannot bring up its socket dies alone: it logs, flags
//! `failed`, flips `quit`, and leaves the cancel token untouched so its
//! siblings and the stats thread keep running.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serial_test::serial;

use ethburst::sock::SockConfig;
use ethburst::worker::{self, CancelToken, Direction, TransportKind, WorkerConfig, WorkerShared};

/// A config no kernel will accept: the interface index does not exist,
/// so bind fails even as root, and unprivileged runs fail at socket().
fn doomed_cfg() -> WorkerConfig {
    WorkerConfig {
        id: 0,
        sock: SockConfig {
            ifindex: libc::c_int::MAX,
            ifname: "does-not-exist".to_string(),
            direction: Direction::Tx,
            transport: TransportKind::Simple,
            frame_sz: 64,
            frame_sz_max: 10_000,
            batch: 8,
            block_frm_sz: 0,
            block_sz: 4096,
            block_nr: 64,
            fanout_group: None,
        },
        frame: Arc::new(vec![0u8; 64]),
        pin: false,
    }
}

#[test]
#[serial]
fn failed_worker_leaves_its_siblings_running() {
    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();

    let handle = worker::spawn(doomed_cfg(), Arc::clone(&shared), cancel.clone())
        .expect("spawn");
    let res = handle.join().expect("join");
    assert!(res.is_err());

    assert!(!cancel.is_cancelled());
    assert!(shared.quit.load(Ordering::Acquire));
    assert!(shared.failed.load(Ordering::Acquire));
    // The fd was never published, or was withdrawn before the close.
    assert_eq!(shared.stats_fd.load(Ordering::Acquire), -1);
}

#[test]
#[serial]
fn ring_transports_refuse_bidirectional_workers() {
    let mut cfg = doomed_cfg();
    cfg.sock.transport = TransportKind::RingV2;
    cfg.sock.direction = Direction::Bidi;

    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();
    let handle = worker::spawn(cfg, Arc::clone(&shared), cancel.clone()).expect("spawn");
    let err = handle.join().expect("join").expect_err("bidi ring");
    assert!(err.to_string().contains("syscall transport"));
    assert!(!cancel.is_cancelled());
}
