//! TPACKET_V3 PACKET_MMAP ring.
//!
//! Rx hands over whole blocks: the block descriptor carries a frame
//! count and the frames chain through `tp_next_offset`. Tx keeps v2's
//! frame-level slots but with the v3 header, and only works on kernels
//! with commit-era 4.11 support, so it is checked up front.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::Ordering;

use nix::errno::Errno;
use nix::sys::utsname::uname;

use super::{apply_send_failure, note_stall, wait_readable, wait_writable, SendDisposition};
use crate::linux;
use crate::sock::RingMap;
use crate::worker::{CancelToken, WorkerShared};
use crate::{Error, Result};

/// Tx payload offset inside a v3 slot, `tp_hdrlen - sizeof(sockaddr_ll)`.
const DATA_OFFSET: usize = size_of::<linux::tpacket3_hdr>();

const LEN_OFFSET: usize = std::mem::offset_of!(linux::tpacket3_hdr, tp_len);
const NEXT_OFFSET: usize = std::mem::offset_of!(linux::tpacket3_hdr, tp_next_offset);
const SNAPLEN_OFFSET: usize = std::mem::offset_of!(linux::tpacket3_hdr, tp_snaplen);

const NUM_PKTS_OFFSET: usize = std::mem::offset_of!(linux::tpacket_block_desc, bh1)
    + std::mem::offset_of!(linux::tpacket_hdr_v1, num_pkts);
const FIRST_PKT_OFFSET: usize = std::mem::offset_of!(linux::tpacket_block_desc, bh1)
    + std::mem::offset_of!(linux::tpacket_hdr_v1, offset_to_first_pkt);

/// TPACKET_V3 Tx rings landed in kernel 4.11.
pub fn kernel_supports_tx(release: &str) -> bool {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major: u32 = match parts.next().and_then(|s| s.parse().ok()) {
        Some(v) => v,
        None => return false,
    };
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    major > 4 || (major == 4 && minor >= 11)
}

pub fn check_tx_support() -> Result<()> {
    let uts = uname().map_err(|errno| Error::Sys { op: "uname", errno })?;
    let release = uts.release().to_string_lossy();
    if kernel_supports_tx(&release) {
        Ok(())
    } else {
        Err(Error::Unsupported(format!(
            "TPACKET_V3 Tx requires kernel 4.11 or later, running {release}"
        )))
    }
}

/// Stage one frame into a free v3 Tx slot. `tp_next_offset` must be zero
/// or the kernel drops the frame as variable-sized.
fn fill_tx_slot(slot: &mut [u8], frame: &[u8]) {
    slot[NEXT_OFFSET..NEXT_OFFSET + 4].copy_from_slice(&0u32.to_ne_bytes());
    slot[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&(frame.len() as u32).to_ne_bytes());
    slot[DATA_OFFSET..DATA_OFFSET + frame.len()].copy_from_slice(frame);
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

/// Frame and byte totals of one retired Rx block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSummary {
    pub frames: u64,
    pub bytes: u64,
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Some(u32::from_ne_bytes(arr))
}

/// Walk a kernel-retired block and total its frames. Stops early if the
/// offset chain runs outside the block rather than trusting it.
pub fn walk_block(block: &[u8]) -> BlockSummary {
    let mut summary = BlockSummary::default();
    let num_pkts = match read_u32(block, NUM_PKTS_OFFSET) {
        Some(n) => n,
        None => return summary,
    };
    let mut off = match read_u32(block, FIRST_PKT_OFFSET) {
        Some(o) => o as usize,
        None => return summary,
    };

    for _ in 0..num_pkts {
        let snaplen = match read_u32(block, off + SNAPLEN_OFFSET) {
            Some(len) => len,
            None => break,
        };
        summary.frames += 1;
        summary.bytes += u64::from(snaplen);

        match read_u32(block, off + NEXT_OFFSET) {
            Some(0) | None => break,
            Some(next) => off += next as usize,
        }
    }
    summary
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

        let summary = walk_block(map.slot_bytes(idx));
        shared.rx_bytes.fetch_add(summary.bytes, Ordering::Relaxed);
        shared.rx_frames.fetch_add(summary.frames, Ordering::Relaxed);

        map.set_status(idx, linux::TP_STATUS_KERNEL);
        idx = (idx + 1) % map.slots();
    }
}
