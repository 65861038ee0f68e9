//! One frame per syscall with plain send()/read(). The baseline the
//! batched and ring transports are measured against.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;

use nix::errno::Errno;

use super::{
    apply_send_failure, note_stall, wait_duplex, wait_readable, wait_writable, SendDisposition,
};
use crate::worker::{CancelToken, WorkerShared};
use crate::{Error, Result};

pub fn tx(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    while !cancel.is_cancelled() {
        let rc = unsafe {
            libc::send(
                fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc == -1 {
            if apply_send_failure(shared, Errno::last(), "send")? == SendDisposition::Retry
                && !wait_writable(fd, cancel)?
            {
                return Ok(());
            }
            continue;
        }
        note_stall(shared, false);
        shared.tx_bytes.fetch_add(rc as u64, Ordering::Relaxed);
        shared.tx_frames.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

pub fn rx(
    fd: BorrowedFd<'_>,
    frame_sz_max: u32,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut buf = vec![0u8; frame_sz_max as usize];
    loop {
        if !wait_readable(fd, cancel)? {
            return Ok(());
        }
        let rc = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                _ => return Err(Error::sys("read")),
            }
        }
        if rc > 0 {
            shared.rx_bytes.fetch_add(rc as u64, Ordering::Relaxed);
            shared.rx_frames.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Alternate one non-blocking send and one non-blocking receive on the
/// same socket. When neither direction can move, park in poll() until
/// one can.
pub fn bidi(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    frame_sz_max: u32,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut buf = vec![0u8; frame_sz_max as usize];
    while !cancel.is_cancelled() {
        let mut idle = true;

        let rc = unsafe {
            libc::send(
                fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc == -1 {
            apply_send_failure(shared, Errno::last(), "send")?;
        } else {
            note_stall(shared, false);
            shared.tx_bytes.fetch_add(rc as u64, Ordering::Relaxed);
            shared.tx_frames.fetch_add(1, Ordering::Relaxed);
            idle = false;
        }

        let rc = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => {}
                _ => return Err(Error::sys("recv")),
            }
        } else if rc > 0 {
            shared.rx_bytes.fetch_add(rc as u64, Ordering::Relaxed);
            shared.rx_frames.fetch_add(1, Ordering::Relaxed);
            idle = false;
        }

        if idle && !wait_duplex(fd, cancel)? {
            return Ok(());
        }
    }
    Ok(())
}
