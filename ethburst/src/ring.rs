//! PACKET_MMAP ring geometry.
//!
//! The kernel ring allocator (`packet_set_ring()` in af_packet.c) slices
//! each block into frames with truncating integer division and rejects the
//! request unless the numbers line up exactly. [`compute`] derives a
//! request the allocator will accept from whatever the user asked for.

use crate::linux::{self, tpacket_align};
use crate::{Error, Result};

/// The two ring generations this tool drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingVersion {
    /// TPACKET_V2: per-frame headers, frame-level Rx.
    V2,
    /// TPACKET_V3: per-block headers, block-level Rx. Tx needs kernel 4.11.
    V3,
}

impl RingVersion {
    /// Value for the PACKET_VERSION socket option.
    pub fn wire(self) -> libc::c_int {
        match self {
            RingVersion::V2 => linux::TPACKET_V2,
            RingVersion::V3 => linux::TPACKET_V3,
        }
    }

    /// Per-frame metadata overhead inside a ring slot: the generation's
    /// header aligned up, plus the trailing `sockaddr_ll` (TPACKETn_HDRLEN).
    pub fn header_overhead(self) -> u32 {
        let hdr = match self {
            RingVersion::V2 => size_of::<linux::tpacket2_hdr>(),
            RingVersion::V3 => size_of::<linux::tpacket3_hdr>(),
        };
        tpacket_align(hdr as u32) + size_of::<libc::sockaddr_ll>() as u32
    }
}

/// What the user asked for. `block_frm_sz == 0` means "derive from the
/// frame size".
#[derive(Debug, Clone, Copy)]
pub struct RingRequest {
    pub frame_sz: u32,
    pub block_frm_sz: u32,
    pub block_sz: u32,
    pub block_nr: u32,
}

/// A ring layout the kernel allocator accepts as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Bytes per block; a multiple of the page size.
    pub block_sz: u32,
    /// Bytes per frame slot; a multiple of TPACKET_ALIGNMENT and an exact
    /// divisor of `block_sz`.
    pub block_frm_sz: u32,
    pub block_nr: u32,
    /// Total frame slots: `frames_per_block * block_nr`.
    pub frame_nr: u32,
}

impl RingGeometry {
    pub fn frames_per_block(&self) -> u32 {
        self.block_sz / self.block_frm_sz
    }

    /// Total bytes of the mapped region.
    pub fn map_len(&self) -> usize {
        self.block_sz as usize * self.block_nr as usize
    }
}

/// System page size.
pub fn page_size() -> u32 {
    // _SC_PAGESIZE cannot fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}

/// Derive a kernel-legal ring geometry. Pure: the caller supplies the
/// header overhead (see [`RingVersion::header_overhead`]) and page size.
///
/// The slot size is only grown when it cannot hold one aligned header plus
/// the frame; an explicit larger request is honored. Blocks are then
/// rounded up to whole pages, and the frames-per-block count is forced to
/// 1 or a power of two with no remainder, because the allocator's
/// block-to-frame division truncates.
pub fn compute(req: &RingRequest, header_overhead: u32, page_sz: u32) -> Result<RingGeometry> {
    let min_frm_sz = req.frame_sz + tpacket_align(header_overhead);
    let mut block_frm_sz = req.block_frm_sz.max(min_frm_sz);

    // A block must hold at least one whole frame; frames never span blocks.
    let mut block_sz = req.block_sz.max(block_frm_sz);

    // Blocks are allocated in whole pages.
    if block_sz < page_sz || block_sz % page_sz != 0 {
        block_sz = (block_sz / page_sz + 1) * page_sz;
    }

    let mut frames_per_block = block_sz / block_frm_sz;

    if frames_per_block != 1 && !frames_per_block.is_power_of_two() {
        // Round the count up to the next power of two, grow the block to
        // fit, re-page-align, then stretch the slot to fill it exactly.
        let next_power = frames_per_block.next_power_of_two();
        block_sz = next_power * block_frm_sz;
        if block_sz % page_sz != 0 {
            block_sz = (block_sz / page_sz + 1) * page_sz;
        }
        block_frm_sz = block_sz / next_power;
        frames_per_block = block_sz / block_frm_sz;
    } else if block_sz / block_frm_sz != 1 || block_sz % block_frm_sz != 0 {
        // Count is already 1 or a power of two but the slots leave slack;
        // stretch the slot size so the division comes out exact.
        block_frm_sz = block_sz / frames_per_block;
        frames_per_block = block_sz / block_frm_sz;
    }

    let frame_nr = ((block_sz as u64 * req.block_nr as u64) / block_frm_sz as u64) as u32;

    if frames_per_block as u64 * req.block_nr as u64 != frame_nr as u64 {
        return Err(Error::Geometry(format!(
            "{frames_per_block} frames/block * {} blocks != {frame_nr} frames",
            req.block_nr
        )));
    }

    Ok(RingGeometry {
        block_sz,
        block_frm_sz,
        block_nr: req.block_nr,
        frame_nr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 4096;

    fn compute_v2(frame_sz: u32, block_frm_sz: u32, block_sz: u32, block_nr: u32) -> RingGeometry {
        let req = RingRequest {
            frame_sz,
            block_frm_sz,
            block_sz,
            block_nr,
        };
        compute(&req, RingVersion::V2.header_overhead(), PAGE).unwrap()
    }

    fn assert_invariants(geo: &RingGeometry) {
        assert_eq!(geo.block_sz % PAGE, 0);
        assert_eq!(geo.block_frm_sz % linux::TPACKET_ALIGNMENT, 0);
        let fpb = geo.block_sz / geo.block_frm_sz;
        assert!(fpb == 1 || fpb.is_power_of_two(), "fpb = {fpb}");
        assert_eq!(geo.block_sz % geo.block_frm_sz, 0);
        assert_eq!(fpb * geo.block_nr, geo.frame_nr);
    }

    #[test]
    fn v2_overhead_is_52_bytes() {
        assert_eq!(RingVersion::V2.header_overhead(), 52);
        assert_eq!(RingVersion::V3.header_overhead(), 68);
    }

    #[test]
    fn default_ethernet_frame_two_per_block() {
        // 1514 + TPACKET_ALIGN(52) = 1578; 4096 / 1578 = 2 (a power of
        // two), so the slot stretches to 2048 and the ring holds 512.
        let geo = compute_v2(1514, 0, 4096, 256);
        assert_eq!(geo.block_frm_sz, 2048);
        assert_eq!(geo.block_sz, 4096);
        assert_eq!(geo.frames_per_block(), 2);
        assert_eq!(geo.frame_nr, 512);
        assert_invariants(&geo);
    }

    #[test]
    fn block_smaller_than_frame_is_raised() {
        // 1024-byte blocks cannot hold a 1578-byte frame; the block grows
        // to the frame and then to a whole page.
        let geo = compute_v2(1514, 0, 1024, 64);
        assert_eq!(geo.block_sz, 4096);
        assert!(geo.block_frm_sz >= 1578);
        assert_invariants(&geo);
    }

    #[test]
    fn non_power_of_two_count_rounds_up() {
        // 1360 + 64 = 1424 -> 4096 / 1424 = 2 remainder; still a power of
        // two so only the slot stretches. Force the other branch with a
        // small slot: 4096 / 1280 = 3 -> next power 4.
        let geo = compute_v2(1216, 0, 4096, 16);
        assert_invariants(&geo);
        assert_eq!(geo.frames_per_block(), 4);
    }

    #[test]
    fn one_frame_per_block_survives_page_rounding() {
        let geo = compute_v2(4000, 0, 4096, 8);
        // 4000 + 64 = 4064 fits one per 4096-byte block; slot stretches to
        // fill the block exactly.
        assert_eq!(geo.frames_per_block(), 1);
        assert_eq!(geo.block_frm_sz, geo.block_sz);
        assert_invariants(&geo);
    }

    #[test]
    fn oversized_frame_spans_pages() {
        let geo = compute_v2(9000, 0, 4096, 32);
        assert!(geo.block_sz >= 9064);
        assert_invariants(&geo);
    }

    #[test]
    fn explicit_slot_request_is_honored() {
        let geo = compute_v2(1514, 2096, 4096, 256);
        // 4096 / 2096 = 1 with slack: slot stretches to the whole block.
        assert_eq!(geo.frames_per_block(), 1);
        assert_eq!(geo.block_frm_sz, 4096);
        assert_invariants(&geo);
    }

    #[test]
    fn compute_is_idempotent() {
        for frame_sz in [64, 128, 512, 1514, 4000, 9000] {
            let first = compute_v2(frame_sz, 0, 4096, 256);
            let again = compute_v2(frame_sz, first.block_frm_sz, first.block_sz, first.block_nr);
            assert_eq!(first, again, "frame_sz = {frame_sz}");
        }
    }
}
