//! AF_PACKET socket setup.
//!
//! [`configure`] runs the full option sequence for one worker socket:
//! bind, qdisc bypass, lossy Tx, buffer sizing, timestamping, fanout,
//! and for the ring transports the PACKET_VERSION / ring / mmap trio.
//! Options the kernel or NIC may refuse degrade with a logged warning;
//! bind and fanout failures are fatal.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};
use tracing::{debug, warn};

use crate::linux;
use crate::ring::{self, RingGeometry, RingVersion};
use crate::worker::{Direction, TransportKind};
use crate::{Error, Result};

/// Everything needed to bring up one worker socket.
#[derive(Debug, Clone)]
pub struct SockConfig {
    pub ifindex: libc::c_int,
    pub ifname: String,
    pub direction: Direction,
    pub transport: TransportKind,
    pub frame_sz: u32,
    pub frame_sz_max: u32,
    /// sendmmsg/recvmmsg batch depth, used for buffer sizing.
    pub batch: u32,
    pub block_frm_sz: u32,
    pub block_sz: u32,
    pub block_nr: u32,
    /// PACKET_FANOUT group, set when more than one worker shares the
    /// interface.
    pub fanout_group: Option<u16>,
}

/// A socket with all options applied. `geometry` and `map` are present
/// only for the ring transports.
pub struct ConfiguredSocket {
    pub fd: OwnedFd,
    pub geometry: Option<RingGeometry>,
    pub map: Option<RingMap>,
}

pub fn configure(cfg: &SockConfig) -> Result<ConfiguredSocket> {
    let fd = open()?;
    bind_interface(fd.as_fd(), cfg.ifindex)?;

    if cfg.direction != Direction::Rx {
        if let Err(err) = set_flag(fd.as_fd(), linux::PACKET_QDISC_BYPASS, "PACKET_QDISC_BYPASS") {
            warn!(%err, "qdisc bypass unavailable, sending through the qdisc layer");
        }
        if let Err(err) = set_flag(fd.as_fd(), linux::PACKET_LOSS, "PACKET_LOSS") {
            warn!(%err, "lossy Tx ring unavailable, malformed frames will stall the ring");
        }
    }

    let geometry = match cfg.transport.ring_version() {
        Some(version) => Some(ring::compute(
            &ring::RingRequest {
                frame_sz: cfg.frame_sz,
                block_frm_sz: cfg.block_frm_sz,
                block_sz: cfg.block_sz,
                block_nr: cfg.block_nr,
            },
            version.header_overhead(),
            ring::page_size(),
        )?),
        None => None,
    };

    if let Some(desired) = desired_buffer_bytes(cfg, geometry.as_ref()) {
        if cfg.direction != Direction::Rx {
            set_buffer_size(fd.as_fd(), Direction::Tx, desired)?;
        }
        if cfg.direction != Direction::Tx {
            set_buffer_size(fd.as_fd(), Direction::Rx, desired)?;
        }
    }

    if let Err(err) = request_hw_timestamps(fd.as_fd(), &cfg.ifname) {
        debug!(%err, ifname = %cfg.ifname, "hardware timestamping unavailable");
    }

    if let Some(group) = cfg.fanout_group {
        join_cpu_fanout(fd.as_fd(), group)?;
    }

    let map = match (cfg.transport.ring_version(), geometry) {
        (Some(version), Some(geo)) => {
            set_tpacket_version(fd.as_fd(), version)?;
            create_ring(fd.as_fd(), cfg.direction, version, &geo)?;
            Some(map_ring(fd.as_fd(), cfg.direction, version, &geo)?)
        }
        _ => None,
    };

    Ok(ConfiguredSocket { fd, geometry, map })
}

/// Raw AF_PACKET socket capturing every ethertype.
pub fn open() -> Result<OwnedFd> {
    socket(
        AddressFamily::Packet,
        SockType::Raw,
        SockFlag::empty(),
        SockProtocol::EthAll,
    )
    .map_err(|errno| Error::Sys { op: "socket", errno })
}

pub fn bind_interface(fd: BorrowedFd<'_>, ifindex: libc::c_int) -> Result<()> {
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    sll.sll_ifindex = ifindex;

    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(Error::sys("bind"));
    }
    Ok(())
}

fn set_packet_opt<T>(
    fd: BorrowedFd<'_>,
    name: libc::c_int,
    value: &T,
    op: &'static str,
) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            name,
            value as *const T as *const libc::c_void,
            size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(Error::sys(op));
    }
    Ok(())
}

fn set_flag(fd: BorrowedFd<'_>, name: libc::c_int, op: &'static str) -> Result<()> {
    set_packet_opt(fd, name, &1i32, op)
}

/// Bytes of socket buffer a transport wants queued. The ring transports
/// size for the whole mapped region; the msg transports for one full
/// batch. Plain send/read sockets keep the kernel default.
fn desired_buffer_bytes(cfg: &SockConfig, geometry: Option<&RingGeometry>) -> Option<i32> {
    let bytes = match cfg.transport {
        TransportKind::Simple => return None,
        TransportKind::Msg | TransportKind::Mmsg => match cfg.direction {
            Direction::Tx => cfg.batch as u64 * cfg.frame_sz as u64,
            Direction::Rx | Direction::Bidi => cfg.batch as u64 * cfg.frame_sz_max as u64,
        },
        TransportKind::RingV2 | TransportKind::RingV3 => geometry?.map_len() as u64,
    };
    Some(bytes.min(i32::MAX as u64) as i32)
}

/// Grow the socket send or receive buffer to at least `desired` bytes.
///
/// The kernel doubles whatever is set to account for sk_buff overhead, so
/// the read-back value is compared against `desired` directly. A plain
/// setsockopt is clamped to `net.core.{w,r}mem_max`; if that falls short
/// the FORCE variant (CAP_NET_ADMIN) is tried. Still falling short is not
/// fatal, only logged, since the socket works with a small buffer.
pub fn set_buffer_size(fd: BorrowedFd<'_>, direction: Direction, desired: i32) -> Result<i32> {
    let (opt, force_opt, label) = match direction {
        Direction::Rx => (libc::SO_RCVBUF, libc::SO_RCVBUFFORCE, "read"),
        _ => (libc::SO_SNDBUF, libc::SO_SNDBUFFORCE, "write"),
    };

    let current = get_sol_socket_i32(fd, opt)?;
    if current >= desired {
        return Ok(current);
    }

    set_sol_socket_i32(fd, opt, desired)?;
    let mut achieved = get_sol_socket_i32(fd, opt)?;

    if achieved < desired {
        debug!(
            desired,
            achieved, "{label} buffer clamped by rmem_max/wmem_max, forcing"
        );
        match set_sol_socket_i32(fd, force_opt, desired) {
            Ok(()) => achieved = get_sol_socket_i32(fd, opt)?,
            Err(err) => warn!(%err, "cannot force the socket {label} buffer size"),
        }
        if achieved < desired {
            warn!(
                desired,
                achieved, "socket {label} buffer smaller than desired"
            );
        }
    }

    Ok(achieved)
}

fn get_sol_socket_i32(fd: BorrowedFd<'_>, name: libc::c_int) -> Result<i32> {
    let mut value: i32 = 0;
    let mut len = size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            &mut value as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(Error::sys("getsockopt(SOL_SOCKET)"));
    }
    Ok(value)
}

fn set_sol_socket_i32(fd: BorrowedFd<'_>, name: libc::c_int, value: i32) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            &value as *const i32 as *const libc::c_void,
            size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(Error::sys("setsockopt(SOL_SOCKET)"));
    }
    Ok(())
}

/// Push Rx timestamping to the NIC where the driver supports it.
///
/// The Rx ring always stamps frames; without this the stamp is taken in
/// software when the frame is copied into the ring. The SIOCSHWTSTAMP
/// ioctl clears any Tx stamping, then PACKET_TIMESTAMP asks for raw
/// hardware stamps on Rx.
pub fn request_hw_timestamps(fd: BorrowedFd<'_>, ifname: &str) -> Result<()> {
    let mut hwconfig: linux::hwtstamp_config = unsafe { std::mem::zeroed() };
    hwconfig.tx_type = linux::HWTSTAMP_TX_OFF;
    hwconfig.rx_filter = linux::HWTSTAMP_FILTER_NONE;

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_data = &mut hwconfig as *mut linux::hwtstamp_config as *mut libc::c_char;

    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), linux::SIOCSHWTSTAMP, &mut ifr) };
    if rc == -1 {
        return Err(Error::sys("ioctl(SIOCSHWTSTAMP)"));
    }

    let source: i32 =
        (linux::SOF_TIMESTAMPING_RX_HARDWARE | linux::SOF_TIMESTAMPING_RAW_HARDWARE) as i32;
    set_packet_opt(fd, linux::PACKET_TIMESTAMP, &source, "PACKET_TIMESTAMP")
}

/// Join a CPU-steered fanout group so the kernel spreads flows across the
/// workers' sockets instead of duplicating every frame to each.
pub fn join_cpu_fanout(fd: BorrowedFd<'_>, group: u16) -> Result<()> {
    let arg: u32 = group as u32 | ((linux::PACKET_FANOUT_CPU as u32) << 16);
    set_packet_opt(fd, linux::PACKET_FANOUT, &arg, "PACKET_FANOUT")
}

pub fn set_tpacket_version(fd: BorrowedFd<'_>, version: RingVersion) -> Result<()> {
    set_packet_opt(fd, linux::PACKET_VERSION, &version.wire(), "PACKET_VERSION")
}

/// Ask the kernel to allocate the Tx or Rx ring.
///
/// The v3 extras stay zero: af_packet.c rejects non-zero retire timeout,
/// private area, and feature word on a Tx ring.
pub fn create_ring(
    fd: BorrowedFd<'_>,
    direction: Direction,
    version: RingVersion,
    geo: &RingGeometry,
) -> Result<()> {
    let name = match direction {
        Direction::Rx => linux::PACKET_RX_RING,
        _ => linux::PACKET_TX_RING,
    };

    match version {
        RingVersion::V2 => {
            let req = linux::tpacket_req {
                tp_block_size: geo.block_sz,
                tp_block_nr: geo.block_nr,
                tp_frame_size: geo.block_frm_sz,
                tp_frame_nr: geo.frame_nr,
            };
            set_packet_opt(fd, name, &req, "PACKET_TX_RING/PACKET_RX_RING")
        }
        RingVersion::V3 => {
            let req = linux::tpacket_req3 {
                tp_block_size: geo.block_sz,
                tp_block_nr: geo.block_nr,
                tp_frame_size: geo.block_frm_sz,
                tp_frame_nr: geo.frame_nr,
                tp_retire_blk_tov: 0,
                tp_sizeof_priv: 0,
                tp_feature_req_word: 0,
            };
            set_packet_opt(fd, name, &req, "PACKET_TX_RING/PACKET_RX_RING")
        }
    }
}

/// Map the allocated ring into this process.
pub fn map_ring(
    fd: BorrowedFd<'_>,
    direction: Direction,
    version: RingVersion,
    geo: &RingGeometry,
) -> Result<RingMap> {
    let len = geo.map_len();
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_LOCKED | libc::MAP_POPULATE,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::sys("mmap"));
    }

    // v2 and v3 Tx walk frame slots; v3 Rx walks whole blocks. The status
    // word sits at a different offset in each slot header.
    let (stride, slots, status_offset) = match (version, direction) {
        (RingVersion::V2, _) => (geo.block_frm_sz as usize, geo.frame_nr as usize, 0),
        (RingVersion::V3, Direction::Rx) => (
            geo.block_sz as usize,
            geo.block_nr as usize,
            std::mem::offset_of!(linux::tpacket_block_desc, bh1),
        ),
        (RingVersion::V3, _) => (
            geo.block_frm_sz as usize,
            geo.frame_nr as usize,
            std::mem::offset_of!(linux::tpacket3_hdr, tp_status),
        ),
    };

    Ok(RingMap {
        ptr: NonNull::new(ptr as *mut u8).ok_or_else(|| Error::sys("mmap"))?,
        len,
        stride,
        slots,
        status_offset,
    })
}

/// A mapped PACKET_MMAP region, carved into fixed-size slots (frames for
/// v2 and v3 Tx, blocks for v3 Rx). Slot status words are shared with the
/// kernel and accessed volatilely with acquire/release fences.
pub struct RingMap {
    ptr: NonNull<u8>,
    len: usize,
    stride: usize,
    slots: usize,
    status_offset: usize,
}

// The map is private to the worker thread that owns it; the kernel side
// is synchronized through the status words.
unsafe impl Send for RingMap {}

impl RingMap {
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        assert!(idx < self.slots);
        unsafe { self.ptr.as_ptr().add(idx * self.stride) }
    }

    pub fn slot_bytes(&self, idx: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_ptr(idx), self.stride) }
    }

    pub fn slot_bytes_mut(&mut self, idx: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(idx), self.stride) }
    }

    /// Volatile read of a slot's status word, ordered before any read of
    /// the slot's contents.
    pub fn status(&self, idx: usize) -> u32 {
        let status = unsafe { (self.slot_ptr(idx).add(self.status_offset) as *const u32).read_volatile() };
        fence(Ordering::Acquire);
        status
    }

    /// Volatile write of a slot's status word, ordered after any write to
    /// the slot's contents.
    pub fn set_status(&mut self, idx: usize, status: u32) {
        fence(Ordering::Release);
        unsafe {
            (self.slot_ptr(idx).add(self.status_offset) as *mut u32).write_volatile(status);
        }
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Ring Rx drop counters. PACKET_STATISTICS clears on read, so callers
/// accumulate the deltas.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingRxStats {
    pub drops: u64,
    pub freezes: u64,
}

pub fn ring_rx_stats(fd: BorrowedFd<'_>, version: RingVersion) -> Result<RingRxStats> {
    match version {
        RingVersion::V2 => {
            let mut stats: linux::tpacket_stats = unsafe { std::mem::zeroed() };
            get_packet_opt(fd, linux::PACKET_STATISTICS, &mut stats)?;
            Ok(RingRxStats {
                drops: stats.tp_drops as u64,
                freezes: 0,
            })
        }
        RingVersion::V3 => {
            let mut stats: linux::tpacket_stats_v3 = unsafe { std::mem::zeroed() };
            get_packet_opt(fd, linux::PACKET_STATISTICS, &mut stats)?;
            Ok(RingRxStats {
                drops: stats.tp_drops as u64,
                freezes: stats.tp_freeze_q_cnt as u64,
            })
        }
    }
}

fn get_packet_opt<T>(fd: BorrowedFd<'_>, name: libc::c_int, value: &mut T) -> Result<()> {
    let mut len = size_of::<T>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            name,
            value as *mut T as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(Error::sys("getsockopt(SOL_PACKET)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingGeometry;

    fn cfg(transport: TransportKind, direction: Direction) -> SockConfig {
        SockConfig {
            ifindex: 1,
            ifname: "lo".to_string(),
            direction,
            transport,
            frame_sz: 1514,
            frame_sz_max: 10000,
            batch: 256,
            block_frm_sz: 0,
            block_sz: 4096,
            block_nr: 256,
            fanout_group: None,
        }
    }

    #[test]
    fn simple_transport_keeps_default_buffers() {
        assert_eq!(
            desired_buffer_bytes(&cfg(TransportKind::Simple, Direction::Tx), None),
            None
        );
    }

    #[test]
    fn msg_buffers_cover_one_batch() {
        assert_eq!(
            desired_buffer_bytes(&cfg(TransportKind::Msg, Direction::Tx), None),
            Some(256 * 1514)
        );
        // Rx sizes for the largest receivable frame, not the Tx size.
        assert_eq!(
            desired_buffer_bytes(&cfg(TransportKind::Mmsg, Direction::Rx), None),
            Some(256 * 10000)
        );
        // Bidirectional sockets size both buffers like Rx.
        assert_eq!(
            desired_buffer_bytes(&cfg(TransportKind::Mmsg, Direction::Bidi), None),
            Some(256 * 10000)
        );
    }

    #[test]
    fn ring_buffers_cover_the_map() {
        let geo = RingGeometry {
            block_sz: 4096,
            block_frm_sz: 2048,
            block_nr: 256,
            frame_nr: 512,
        };
        assert_eq!(
            desired_buffer_bytes(&cfg(TransportKind::RingV2, Direction::Tx), Some(&geo)),
            Some(4096 * 256)
        );
    }
}
