//! sendmsg()/recvmsg(), still one frame per syscall but through the
//! scatter-gather path the batched transport builds on.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;

use nix::errno::Errno;

use super::{
    apply_send_failure, note_stall, wait_duplex, wait_readable, wait_writable, SendDisposition,
};
use crate::worker::{CancelToken, WorkerShared};
use crate::{Error, Result};

fn msghdr_for(iov: &mut libc::iovec) -> libc::msghdr {
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = iov;
    hdr.msg_iovlen = 1;
    hdr
}

pub fn tx(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: frame.as_ptr() as *mut libc::c_void,
        iov_len: frame.len(),
    };
    let hdr = msghdr_for(&mut iov);

    while !cancel.is_cancelled() {
        let rc = unsafe { libc::sendmsg(fd.as_raw_fd(), &hdr, libc::MSG_DONTWAIT) };
        if rc == -1 {
            if apply_send_failure(shared, Errno::last(), "sendmsg")? == SendDisposition::Retry
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
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut hdr = msghdr_for(&mut iov);

    loop {
        if !wait_readable(fd, cancel)? {
            return Ok(());
        }
        let rc = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut hdr, 0) };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                _ => return Err(Error::sys("recvmsg")),
            }
        }
        if rc > 0 {
            shared.rx_bytes.fetch_add(rc as u64, Ordering::Relaxed);
            shared.rx_frames.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One sendmsg and one recvmsg per pass, both non-blocking, parking in
/// poll() when neither direction moves.
pub fn bidi(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    frame_sz_max: u32,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut tx_iov = libc::iovec {
        iov_base: frame.as_ptr() as *mut libc::c_void,
        iov_len: frame.len(),
    };
    let tx_hdr = msghdr_for(&mut tx_iov);

    let mut buf = vec![0u8; frame_sz_max as usize];
    let mut rx_iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut rx_hdr = msghdr_for(&mut rx_iov);

    while !cancel.is_cancelled() {
        let mut idle = true;

        let rc = unsafe { libc::sendmsg(fd.as_raw_fd(), &tx_hdr, libc::MSG_DONTWAIT) };
        if rc == -1 {
            apply_send_failure(shared, Errno::last(), "sendmsg")?;
        } else {
            note_stall(shared, false);
            shared.tx_bytes.fetch_add(rc as u64, Ordering::Relaxed);
            shared.tx_frames.fetch_add(1, Ordering::Relaxed);
            idle = false;
        }

        let rc = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut rx_hdr, libc::MSG_DONTWAIT) };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => {}
                _ => return Err(Error::sys("recvmsg")),
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
