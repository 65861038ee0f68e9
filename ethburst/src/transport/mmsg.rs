//! sendmmsg()/recvmmsg() batches: one syscall moves up to `batch` frames.
//!
//! sendmmsg() only fails when nothing at all was sent; a partial batch
//! returns the count and per-message byte totals in `msg_len`.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;

use nix::errno::Errno;

use super::{
    apply_send_failure, note_stall, wait_duplex, wait_readable, wait_writable, SendDisposition,
};
use crate::worker::{CancelToken, WorkerShared};
use crate::{Error, Result};

/// Bytes actually sent across a partial batch.
fn batch_bytes(lens: impl Iterator<Item = u32>) -> u64 {
    lens.map(u64::from).sum()
}

/// Frame and byte totals for a receive batch; zero-length slots were not
/// filled.
fn batch_received(lens: impl Iterator<Item = u32>) -> (u64, u64) {
    let mut frames = 0u64;
    let mut bytes = 0u64;
    for len in lens {
        if len > 0 {
            frames += 1;
            bytes += u64::from(len);
        }
    }
    (frames, bytes)
}

fn batch_headers(iovs: &mut [libc::iovec]) -> Vec<libc::mmsghdr> {
    iovs.iter_mut()
        .map(|iov| {
            let mut mmsg: libc::mmsghdr = unsafe { std::mem::zeroed() };
            mmsg.msg_hdr.msg_iov = iov;
            mmsg.msg_hdr.msg_iovlen = 1;
            mmsg
        })
        .collect()
}

pub fn tx(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    batch: u32,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    // Every message points at the same frame.
    let mut iovs = vec![
        libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        batch as usize
    ];
    let mut hdrs = batch_headers(&mut iovs);

    while !cancel.is_cancelled() {
        let rc = unsafe {
            libc::sendmmsg(
                fd.as_raw_fd(),
                hdrs.as_mut_ptr(),
                hdrs.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
            )
        };
        if rc == -1 {
            if apply_send_failure(shared, Errno::last(), "sendmmsg")? == SendDisposition::Retry
                && !wait_writable(fd, cancel)?
            {
                return Ok(());
            }
            continue;
        }
        note_stall(shared, false);
        let sent = rc as usize;
        let bytes = batch_bytes(hdrs[..sent].iter().map(|h| h.msg_len));
        shared.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        shared.tx_frames.fetch_add(sent as u64, Ordering::Relaxed);
    }
    Ok(())
}

pub fn rx(
    fd: BorrowedFd<'_>,
    frame_sz_max: u32,
    batch: u32,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut bufs = vec![vec![0u8; frame_sz_max as usize]; batch as usize];
    let mut iovs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect();
    let mut hdrs = batch_headers(&mut iovs);

    loop {
        if !wait_readable(fd, cancel)? {
            return Ok(());
        }
        // A blocking recvmmsg() waits for the whole batch; take whatever
        // is queued right now instead.
        let rc = unsafe {
            libc::recvmmsg(
                fd.as_raw_fd(),
                hdrs.as_mut_ptr(),
                hdrs.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            )
        };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                _ => return Err(Error::sys("recvmmsg")),
            }
        }
        let (frames, bytes) = batch_received(hdrs[..rc as usize].iter().map(|h| h.msg_len));
        shared.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        shared.rx_frames.fetch_add(frames, Ordering::Relaxed);
    }
}

/// One send batch and one receive batch per pass, both non-blocking,
/// parking in poll() when neither direction moves.
pub fn bidi(
    fd: BorrowedFd<'_>,
    frame: &[u8],
    frame_sz_max: u32,
    batch: u32,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut tx_iovs = vec![
        libc::iovec {
            iov_base: frame.as_ptr() as *mut libc::c_void,
            iov_len: frame.len(),
        };
        batch as usize
    ];
    let mut tx_hdrs = batch_headers(&mut tx_iovs);

    let mut bufs = vec![vec![0u8; frame_sz_max as usize]; batch as usize];
    let mut rx_iovs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect();
    let mut rx_hdrs = batch_headers(&mut rx_iovs);

    while !cancel.is_cancelled() {
        let mut idle = true;

        let rc = unsafe {
            libc::sendmmsg(
                fd.as_raw_fd(),
                tx_hdrs.as_mut_ptr(),
                tx_hdrs.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
            )
        };
        if rc == -1 {
            apply_send_failure(shared, Errno::last(), "sendmmsg")?;
        } else {
            note_stall(shared, false);
            let sent = rc as usize;
            let bytes = batch_bytes(tx_hdrs[..sent].iter().map(|h| h.msg_len));
            shared.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
            shared.tx_frames.fetch_add(sent as u64, Ordering::Relaxed);
            idle = false;
        }

        let rc = unsafe {
            libc::recvmmsg(
                fd.as_raw_fd(),
                rx_hdrs.as_mut_ptr(),
                rx_hdrs.len() as libc::c_uint,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            )
        };
        if rc == -1 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => {}
                _ => return Err(Error::sys("recvmmsg")),
            }
        } else if rc > 0 {
            let (frames, bytes) = batch_received(rx_hdrs[..rc as usize].iter().map(|h| h.msg_len));
            shared.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
            shared.rx_frames.fetch_add(frames, Ordering::Relaxed);
            idle = false;
        }

        if idle && !wait_duplex(fd, cancel)? {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_batch_sums_only_sent_messages() {
        let lens = [1514u32, 1514, 1514, 0, 0];
        assert_eq!(batch_bytes(lens[..3].iter().copied()), 3 * 1514);
        assert_eq!(batch_bytes(lens[..0].iter().copied()), 0);
    }

    #[test]
    fn receive_skips_empty_slots() {
        let lens = [60u32, 0, 1514, 0];
        assert_eq!(batch_received(lens.iter().copied()), (2, 1574));
    }
}
