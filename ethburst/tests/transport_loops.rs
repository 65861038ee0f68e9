//! Hot-loop behavior over Unix datagram socket pairs.
//!
//! A socketpair stands in for the packet socket: the loops only need a
//! datagram fd that send/recv/poll work on, so counter accounting, stall
//! handling, and cancellation can all be checked without privileges.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use serial_test::serial;

use ethburst::transport::{mmsg, simple};
use ethburst::worker::{CancelToken, WorkerShared};

fn pair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )
    .expect("socketpair")
}

const FRAME: [u8; 64] = [0xab; 64];

fn push_frame(fd: &OwnedFd) {
    let rc = unsafe {
        libc::send(
            fd.as_raw_fd(),
            FRAME.as_ptr() as *const libc::c_void,
            FRAME.len(),
            0,
        )
    };
    assert_eq!(rc, FRAME.len() as isize);
}

#[test]
#[serial]
fn tx_counts_frames_and_stops_on_cancel() {
    let (near, _far) = pair();
    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();

    let handle = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        thread::spawn(move || simple::tx(near.as_fd(), &FRAME, &shared, &cancel))
    };

    thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    handle.join().expect("join").expect("tx loop");

    // The peer never reads, so the loop fills the queue and then parks
    // until cancelled; whatever went out must be accounted exactly.
    let frames = shared.tx_frames.load(Ordering::Relaxed);
    assert!(frames > 0);
    assert_eq!(shared.tx_bytes.load(Ordering::Relaxed), frames * 64);
    // A full Unix socket reports EAGAIN, not ENOBUFS, so no stall.
    assert!(!shared.stalling.load(Ordering::Relaxed));
}

#[test]
#[serial]
fn rx_counts_exactly_what_was_sent() {
    let (near, far) = pair();
    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();

    let handle = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        thread::spawn(move || simple::rx(near.as_fd(), 10_000, &shared, &cancel))
    };

    for _ in 0..5 {
        push_frame(&far);
    }
    thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    handle.join().expect("join").expect("rx loop");

    assert_eq!(shared.rx_frames.load(Ordering::Relaxed), 5);
    assert_eq!(shared.rx_bytes.load(Ordering::Relaxed), 5 * 64);
}

#[test]
#[serial]
fn bidi_moves_frames_both_ways() {
    let (near, far) = pair();
    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();

    let handle = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        thread::spawn(move || simple::bidi(near.as_fd(), &FRAME, 10_000, &shared, &cancel))
    };

    for _ in 0..3 {
        push_frame(&far);
    }
    thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    handle.join().expect("join").expect("bidi loop");

    assert_eq!(shared.rx_frames.load(Ordering::Relaxed), 3);
    assert!(shared.tx_frames.load(Ordering::Relaxed) > 0);
    let frames = shared.tx_frames.load(Ordering::Relaxed);
    assert_eq!(shared.tx_bytes.load(Ordering::Relaxed), frames * 64);
}

#[test]
#[serial]
fn batched_bidi_moves_frames_both_ways() {
    let (near, far) = pair();
    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();

    let handle = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        thread::spawn(move || mmsg::bidi(near.as_fd(), &FRAME, 10_000, 4, &shared, &cancel))
    };

    for _ in 0..3 {
        push_frame(&far);
    }
    thread::sleep(Duration::from_millis(100));
    cancel.cancel();
    handle.join().expect("join").expect("bidi loop");

    assert_eq!(shared.rx_frames.load(Ordering::Relaxed), 3);
    assert_eq!(shared.rx_bytes.load(Ordering::Relaxed), 3 * 64);
    assert!(shared.tx_frames.load(Ordering::Relaxed) > 0);
}

#[test]
#[serial]
fn cancellation_releases_the_socket() {
    let (near, _far) = pair();
    let raw = near.as_raw_fd();
    let shared = Arc::new(WorkerShared::new());
    let cancel = CancelToken::new();

    let handle = {
        let shared = Arc::clone(&shared);
        let cancel = cancel.clone();
        // The thread owns the fd, like a worker owns its socket.
        thread::spawn(move || {
            let res = simple::rx(near.as_fd(), 10_000, &shared, &cancel);
            drop(near);
            res
        })
    };

    thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    handle.join().expect("join").expect("rx loop");

    // No other fds are opened while this runs (#[serial]), so the raw
    // number must now be closed.
    let rc = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    assert_eq!(rc, -1);
}
