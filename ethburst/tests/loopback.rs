//! Socket bring-up checks against the loopback interface.
//!
//! Anything needing CAP_NET_RAW is skipped when the suite is not run as
//! root, so `cargo test` stays green on an unprivileged box.

use std::os::fd::AsFd;

use nix::unistd::Uid;
use serial_test::serial;

use ethburst::iface;
use ethburst::ring::{self, RingRequest, RingVersion};
use ethburst::sock::{self, SockConfig};
use ethburst::worker::{Direction, TransportKind};

fn is_root() -> bool {
    Uid::effective().is_root()
}

fn loopback_cfg(transport: TransportKind, direction: Direction) -> SockConfig {
    let ifindex = iface::index_by_name("lo").expect("no loopback interface");
    SockConfig {
        ifindex: ifindex as libc::c_int,
        ifname: "lo".to_string(),
        direction,
        transport,
        frame_sz: 1514,
        frame_sz_max: 10_000,
        batch: 8,
        block_frm_sz: 0,
        block_sz: ring::page_size(),
        block_nr: 64,
        fanout_group: None,
    }
}

#[test]
fn raw_sockets_need_privileges() {
    match sock::open() {
        Ok(_) => assert!(is_root(), "unprivileged open succeeded"),
        Err(_) => assert!(!is_root(), "open failed as root"),
    }
}

#[test]
#[serial]
fn simple_socket_configures_on_loopback() {
    if !is_root() {
        eprintln!("skipped: requires root");
        return;
    }
    let sock = sock::configure(&loopback_cfg(TransportKind::Simple, Direction::Tx))
        .expect("simple Tx socket");
    assert!(sock.geometry.is_none());
    assert!(sock.map.is_none());
}

#[test]
#[serial]
fn v2_rx_ring_maps_on_loopback() {
    if !is_root() {
        eprintln!("skipped: requires root");
        return;
    }
    let sock = sock::configure(&loopback_cfg(TransportKind::RingV2, Direction::Rx))
        .expect("v2 Rx ring socket");
    let geo = sock.geometry.expect("ring geometry");
    let map = sock.map.as_ref().expect("mapped ring");
    assert_eq!(map.slots(), geo.frame_nr as usize);
    assert_eq!(map.stride(), geo.block_frm_sz as usize);

    // Fresh Rx ring: every slot still belongs to the kernel.
    for i in 0..map.slots() {
        assert_eq!(map.status(i), 0);
    }

    let stats = sock::ring_rx_stats(sock.fd.as_fd(), RingVersion::V2).expect("ring stats");
    assert_eq!(stats.drops, 0);
}

#[test]
#[serial]
fn v3_rx_ring_walks_blocks_on_loopback() {
    if !is_root() {
        eprintln!("skipped: requires root");
        return;
    }
    let sock = sock::configure(&loopback_cfg(TransportKind::RingV3, Direction::Rx))
        .expect("v3 Rx ring socket");
    let geo = sock.geometry.expect("ring geometry");
    let map = sock.map.as_ref().expect("mapped ring");
    assert_eq!(map.slots(), geo.block_nr as usize);
    assert_eq!(map.stride(), geo.block_sz as usize);
}

#[test]
fn derived_geometry_matches_the_kernel_contract() {
    // The same derivation the sockets use, with the real page size.
    let geo = ring::compute(
        &RingRequest {
            frame_sz: 1514,
            block_frm_sz: 0,
            block_sz: ring::page_size(),
            block_nr: 64,
        },
        RingVersion::V2.header_overhead(),
        ring::page_size(),
    )
    .expect("geometry");
    assert_eq!(geo.block_sz % ring::page_size(), 0);
    assert_eq!(geo.block_sz % geo.block_frm_sz, 0);
    let fpb = geo.block_sz / geo.block_frm_sz;
    assert!(fpb == 1 || fpb.is_power_of_two());
    assert_eq!(geo.frame_nr, fpb * geo.block_nr);
}
