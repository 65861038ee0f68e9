//! TPACKET_V2 PACKET_MMAP ring: frame-level slots shared with the kernel.
//!
//! Tx fills every free slot, flags them SEND_REQUEST, then kicks the
//! kernel with a zero-length send. Rx walks the slots in order, handing
//! each back with TP_STATUS_KERNEL once counted.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;

use nix::errno::Errno;

use super::{apply_send_failure, note_stall, wait_readable, wait_writable, SendDisposition};
use crate::linux;
use crate::sock::RingMap;
use crate::worker::{CancelToken, WorkerShared};
use crate::{Error, Result};

/// Tx payload offset inside a v2 slot. The kernel reads frame data at
/// `tp_hdrlen - sizeof(sockaddr_ll)`, which is exactly the struct size.
const DATA_OFFSET: usize = size_of::<linux::tpacket2_hdr>();

/// Offset of `tp_len` in `tpacket2_hdr`.
const LEN_OFFSET: usize = std::mem::offset_of!(linux::tpacket2_hdr, tp_len);

/// Offset of `tp_snaplen` in `tpacket2_hdr`.
const SNAPLEN_OFFSET: usize = std::mem::offset_of!(linux::tpacket2_hdr, tp_snaplen);

/// Stage one frame into a free Tx slot. The status word is written by the
/// caller afterwards so the kernel never sees a half-written slot.
fn fill_tx_slot(slot: &mut [u8], frame: &[u8]) {
    slot[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&(frame.len() as u32).to_ne_bytes());
    slot[DATA_OFFSET..DATA_OFFSET + frame.len()].copy_from_slice(frame);
}

fn frame_snaplen(slot: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&slot[SNAPLEN_OFFSET..SNAPLEN_OFFSET + 4]);
    u32::from_ne_bytes(buf)
}

pub fn tx(
    fd: BorrowedFd<'_>,
    mut map: RingMap,
    frame: &[u8],
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    if frame.is_empty() {
        return Err(Error::Unsupported("cannot transmit an empty frame".to_string()));
    }

    while !cancel.is_cancelled() {
        for i in 0..map.slots() {
            if map.status(i) == linux::TP_STATUS_AVAILABLE {
                fill_tx_slot(map.slot_bytes_mut(i), frame);
                map.set_status(i, linux::TP_STATUS_SEND_REQUEST);
            }
        }

        // Zero-length send flushes every SEND_REQUEST slot and reports the
        // total bytes moved out of the ring.
        let rc = unsafe {
            libc::send(
                fd.as_raw_fd(),
                std::ptr::null::<libc::c_void>(),
                0,
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
        shared
            .tx_frames
            .fetch_add(rc as u64 / frame.len() as u64, Ordering::Relaxed);
    }
    Ok(())
}

pub fn rx(
    fd: BorrowedFd<'_>,
    mut map: RingMap,
    shared: &WorkerShared,
    cancel: &CancelToken,
) -> Result<()> {
    let mut idx = 0usize;
    loop {
        if map.status(idx) & linux::TP_STATUS_USER == 0 {
            if !wait_readable(fd, cancel)? {
                return Ok(());
            }
            continue;
        }

        let snaplen = frame_snaplen(map.slot_bytes(idx));
        shared.rx_bytes.fetch_add(snaplen as u64, Ordering::Relaxed);
        shared.rx_frames.fetch_add(1, Ordering::Relaxed);

        map.set_status(idx, linux::TP_STATUS_KERNEL);
        idx = (idx + 1) % map.slots();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_places_length_and_payload() {
        let mut slot = vec![0u8; 2048];
        let frame = vec![0xabu8; 1514];
        fill_tx_slot(&mut slot, &frame);
        assert_eq!(&slot[LEN_OFFSET..LEN_OFFSET + 4], &1514u32.to_ne_bytes());
        assert_eq!(&slot[DATA_OFFSET..DATA_OFFSET + 1514], frame.as_slice());
        // Status word untouched.
        assert_eq!(&slot[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn snaplen_reads_back() {
        let mut slot = vec![0u8; 2048];
        slot[SNAPLEN_OFFSET..SNAPLEN_OFFSET + 4].copy_from_slice(&60u32.to_ne_bytes());
        assert_eq!(frame_snaplen(&slot), 60);
    }
}
