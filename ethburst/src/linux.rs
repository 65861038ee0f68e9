//! Kernel ABI definitions not exported by libc.
//!
//! Mirrors of <linux/if_packet.h>, <linux/net_tstamp.h> and
//! <linux/sockios.h>. These are wire contracts with the kernel ring
//! allocator and must match the C layouts bit for bit, including the
//! reserved fields.

#![allow(non_camel_case_types)]

use libc::{c_int, c_uint, c_ulong};

// PACKET_* socket options (SOL_PACKET level).
pub const PACKET_RX_RING: c_int = 5;
pub const PACKET_STATISTICS: c_int = 6;
pub const PACKET_VERSION: c_int = 10;
pub const PACKET_TX_RING: c_int = 13;
pub const PACKET_LOSS: c_int = 14;
pub const PACKET_TIMESTAMP: c_int = 17;
pub const PACKET_FANOUT: c_int = 18;
pub const PACKET_QDISC_BYPASS: c_int = 20;

// Fanout distribution modes (upper 16 bits of the PACKET_FANOUT arg).
pub const PACKET_FANOUT_CPU: c_uint = 2;

// enum tpacket_versions
pub const TPACKET_V2: c_int = 1;
pub const TPACKET_V3: c_int = 2;

// Ring frame/block ownership statuses. Rx and Tx reuse the same field:
// 0 means kernel-owned (Rx) or free-for-userspace (Tx).
pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1;
pub const TP_STATUS_AVAILABLE: u32 = 0;
pub const TP_STATUS_SEND_REQUEST: u32 = 1;

/// Every offset handed to the kernel ring allocator is rounded up to this.
pub const TPACKET_ALIGNMENT: u32 = 16;

/// `TPACKET_ALIGN()` from <linux/if_packet.h>.
pub const fn tpacket_align(len: u32) -> u32 {
    (len + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Ring request for TPACKET_V2 (`struct tpacket_req`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_req {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
}

/// Ring request for TPACKET_V3 (`struct tpacket_req3`). The kernel
/// rejects a Tx ring unless the three trailing fields are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_req3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

/// Per-frame metadata header for TPACKET_V2 (`struct tpacket2_hdr`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket2_hdr {
    pub tp_status: u32,
    pub tp_len: u32,
    pub tp_snaplen: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_vlan_tci: u16,
    pub tp_vlan_tpid: u16,
    pub tp_padding: [u8; 4],
}

/// Per-frame metadata header for TPACKET_V3 (`struct tpacket3_hdr`).
/// `tp_next_offset` links frames inside one block; it must be zero on Tx.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket3_hdr {
    pub tp_next_offset: u32,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_snaplen: u32,
    pub tp_len: u32,
    pub tp_status: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub hv1: tpacket_hdr_variant1,
    pub tp_padding: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_hdr_variant1 {
    pub tp_rxhash: u32,
    pub tp_vlan_tci: u32,
    pub tp_vlan_tpid: u16,
    pub tp_padding: u16,
}

/// Per-block descriptor for TPACKET_V3 (`struct tpacket_block_desc` with
/// the `bh1` union variant inlined; the kernel defines no other variant).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_block_desc {
    pub version: u32,
    pub offset_to_priv: u32,
    pub bh1: tpacket_hdr_v1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_hdr_v1 {
    pub block_status: u32,
    pub num_pkts: u32,
    pub offset_to_first_pkt: u32,
    pub blk_len: u32,
    pub seq_num: u64,
    pub ts_first_pkt: tpacket_bd_ts,
    pub ts_last_pkt: tpacket_bd_ts,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_bd_ts {
    pub ts_sec: c_uint,
    pub ts_usec: c_uint,
}

/// Clear-on-read Rx counters (`struct tpacket_stats`, TPACKET_V2).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_stats {
    pub tp_packets: c_uint,
    pub tp_drops: c_uint,
}

/// Clear-on-read Rx counters (`struct tpacket_stats_v3`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct tpacket_stats_v3 {
    pub tp_packets: c_uint,
    pub tp_drops: c_uint,
    pub tp_freeze_q_cnt: c_uint,
}

// <linux/net_tstamp.h>
pub const SOF_TIMESTAMPING_RX_HARDWARE: c_int = 1 << 2;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: c_int = 1 << 6;
pub const HWTSTAMP_TX_OFF: c_int = 0;
pub const HWTSTAMP_FILTER_NONE: c_int = 0;

/// Device timestamping request (`struct hwtstamp_config`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct hwtstamp_config {
    pub flags: c_int,
    pub tx_type: c_int,
    pub rx_filter: c_int,
}

// <linux/sockios.h>
pub const SIOCSHWTSTAMP: c_ulong = 0x89b0;
pub const SIOCGIFTXQLEN: c_ulong = 0x8942;
