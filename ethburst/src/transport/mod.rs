//! Frame-moving hot loops.
//!
//! Each transport is a pair of Tx/Rx loops over one configured socket.
//! Blocking waits are bounded by short polls so every loop notices the
//! cancel token promptly; no thread is ever killed from outside.

pub mod mmsg;
pub mod msg;
pub mod ring_v2;
pub mod ring_v3;
pub mod simple;

use std::os::fd::{AsFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::sock::ConfiguredSocket;
use crate::worker::{CancelToken, Direction, TransportKind, WorkerConfig, WorkerShared};
use crate::{Error, Result};

/// How long one poll() may block before the cancel token is rechecked.
const POLL_INTERVAL_MS: u16 = 100;

pub fn run_worker(
    cfg: &WorkerConfig,
    sock: &mut ConfiguredSocket,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    match (cfg.sock.transport, cfg.sock.direction) {
        (TransportKind::Simple, Direction::Tx) => {
            simple::tx(sock.fd.as_fd(), &cfg.frame, shared, cancel)
        }
        (TransportKind::Simple, Direction::Rx) => {
            simple::rx(sock.fd.as_fd(), cfg.sock.frame_sz_max, shared, cancel)
        }
        (TransportKind::Msg, Direction::Tx) => {
            msg::tx(sock.fd.as_fd(), &cfg.frame, shared, cancel)
        }
        (TransportKind::Msg, Direction::Rx) => {
            msg::rx(sock.fd.as_fd(), cfg.sock.frame_sz_max, shared, cancel)
        }
        (TransportKind::Mmsg, Direction::Tx) => {
            mmsg::tx(sock.fd.as_fd(), &cfg.frame, cfg.sock.batch, shared, cancel)
        }
        (TransportKind::Mmsg, Direction::Rx) => mmsg::rx(
            sock.fd.as_fd(),
            cfg.sock.frame_sz_max,
            cfg.sock.batch,
            shared,
            cancel,
        ),
        (TransportKind::Simple, Direction::Bidi) => {
            simple::bidi(sock.fd.as_fd(), &cfg.frame, cfg.sock.frame_sz_max, shared, cancel)
        }
        (TransportKind::Msg, Direction::Bidi) => {
            msg::bidi(sock.fd.as_fd(), &cfg.frame, cfg.sock.frame_sz_max, shared, cancel)
        }
        (TransportKind::Mmsg, Direction::Bidi) => mmsg::bidi(
            sock.fd.as_fd(),
            &cfg.frame,
            cfg.sock.frame_sz_max,
            cfg.sock.batch,
            shared,
            cancel,
        ),
        (TransportKind::RingV2 | TransportKind::RingV3, Direction::Bidi) => {
            Err(Error::Unsupported(format!(
                "{:?} maps one direction only, bidirectional runs need a syscall transport",
                cfg.sock.transport
            )))
        }
        (TransportKind::RingV2, Direction::Tx) => {
            let map = take_map(sock)?;
            ring_v2::tx(sock.fd.as_fd(), map, &cfg.frame, shared, cancel)
        }
        (TransportKind::RingV2, Direction::Rx) => {
            let map = take_map(sock)?;
            ring_v2::rx(sock.fd.as_fd(), map, shared, cancel)
        }
        (TransportKind::RingV3, Direction::Tx) => {
            ring_v3::check_tx_support()?;
            let map = take_map(sock)?;
            ring_v3::tx(sock.fd.as_fd(), map, &cfg.frame, shared, cancel)
        }
        (TransportKind::RingV3, Direction::Rx) => {
            let map = take_map(sock)?;
            ring_v3::rx(sock.fd.as_fd(), map, shared, cancel)
        }
    }
}

fn take_map(sock: &mut ConfiguredSocket) -> Result<crate::sock::RingMap> {
    sock.map
        .take()
        .ok_or_else(|| Error::Unsupported("ring transport without a mapped ring".to_string()))
}

/// What to do after a send-path syscall failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Queue full; note the stall and keep going, the frames are not lost.
    Stall,
    /// Interrupted or would block; try again.
    Retry,
    /// Anything else kills the worker.
    Fatal,
}

pub fn classify_send_errno(errno: Errno) -> SendDisposition {
    match errno {
        Errno::ENOBUFS => SendDisposition::Stall,
        Errno::EINTR | Errno::EAGAIN => SendDisposition::Retry,
        _ => SendDisposition::Fatal,
    }
}

/// Book-keep one failed send: a full queue flags the stall (the counters
/// stay untouched, nothing was moved), a retryable errno is passed back
/// to the caller, anything else is fatal.
pub(crate) fn apply_send_failure(
    shared: &WorkerShared,
    errno: Errno,
    op: &'static str,
) -> Result<SendDisposition> {
    match classify_send_errno(errno) {
        SendDisposition::Stall => {
            note_stall(shared, true);
            Ok(SendDisposition::Stall)
        }
        SendDisposition::Retry => Ok(SendDisposition::Retry),
        SendDisposition::Fatal => Err(Error::Sys { op, errno }),
    }
}

fn wait_for(fd: BorrowedFd<'_>, flags: PollFlags, cancel: &CancelToken) -> Result<bool> {
    loop {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let mut fds = [PollFd::new(fd, flags)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(Error::Sys { op: "poll", errno }),
        }
    }
}

/// Wait until the socket is readable or the token cancels. `Ok(false)`
/// means cancelled; POLLERR also reads as ready so the next syscall
/// surfaces the error.
pub fn wait_readable(fd: BorrowedFd<'_>, cancel: &CancelToken) -> Result<bool> {
    wait_for(fd, PollFlags::POLLIN | PollFlags::POLLERR, cancel)
}

/// Wait until the socket accepts more frames or the token cancels.
pub fn wait_writable(fd: BorrowedFd<'_>, cancel: &CancelToken) -> Result<bool> {
    wait_for(fd, PollFlags::POLLOUT | PollFlags::POLLERR, cancel)
}

/// Wait until either direction can make progress, for the bidirectional
/// loops.
pub(crate) fn wait_duplex(fd: BorrowedFd<'_>, cancel: &CancelToken) -> Result<bool> {
    wait_for(
        fd,
        PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLERR,
        cancel,
    )
}

/// Flag or clear a Tx stall without dirtying the cache line on every
/// frame.
pub(crate) fn note_stall(shared: &WorkerShared, stalled: bool) {
    use std::sync::atomic::Ordering;
    if shared.stalling.load(Ordering::Relaxed) != stalled {
        shared.stalling.store(stalled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enobufs_is_a_stall() {
        assert_eq!(classify_send_errno(Errno::ENOBUFS), SendDisposition::Stall);
    }

    #[test]
    fn interrupts_retry() {
        assert_eq!(classify_send_errno(Errno::EINTR), SendDisposition::Retry);
        assert_eq!(classify_send_errno(Errno::EAGAIN), SendDisposition::Retry);
    }

    #[test]
    fn network_errors_are_fatal() {
        assert_eq!(classify_send_errno(Errno::ENETDOWN), SendDisposition::Fatal);
        assert_eq!(classify_send_errno(Errno::EMSGSIZE), SendDisposition::Fatal);
        assert_eq!(classify_send_errno(Errno::EBADF), SendDisposition::Fatal);
    }

    #[test]
    fn full_queue_stalls_without_counting() {
        use std::sync::atomic::Ordering;

        let shared = WorkerShared::new();
        let res = apply_send_failure(&shared, Errno::ENOBUFS, "send");
        assert_eq!(res.unwrap(), SendDisposition::Stall);
        assert!(shared.stalling.load(Ordering::Relaxed));
        assert_eq!(shared.tx_bytes.load(Ordering::Relaxed), 0);
        assert_eq!(shared.tx_frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn retryable_errors_leave_the_stall_flag_alone() {
        use std::sync::atomic::Ordering;

        let shared = WorkerShared::new();
        let res = apply_send_failure(&shared, Errno::EAGAIN, "send");
        assert_eq!(res.unwrap(), SendDisposition::Retry);
        assert!(!shared.stalling.load(Ordering::Relaxed));
    }

    #[test]
    fn fatal_errors_carry_the_syscall_and_errno() {
        let shared = WorkerShared::new();
        let err = apply_send_failure(&shared, Errno::ENETDOWN, "sendmsg").unwrap_err();
        assert!(err.to_string().contains("sendmsg"));
    }
}
