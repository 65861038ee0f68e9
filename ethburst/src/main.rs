//! Multi-threaded AF_PACKET Ethernet throughput exerciser.
//!
//! Saturates a link (or shows where the kernel path tops out) by blasting
//! or draining raw Ethernet frames from a pool of worker threads, one
//! socket each, with a choice of five send/receive methods from plain
//! send()/read() up to PACKET_MMAP TPACKET_V3 rings.
//!
//! # Usage
//!
//! ```bash
//! # List candidate interfaces
//! sudo ethburst -l
//!
//! # Blast random 1514-byte frames out of eth0 with 4 ring workers
//! sudo ethburst -i eth0 -c 4 -p ring-v2
//!
//! # Count them on the far end
//! sudo ethburst -i eth1 -c 4 -p ring-v2 -r
//! ```
//!
//! Requires root for the raw sockets; stats print once a second until
//! interrupted with ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nix::unistd::Uid;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ethburst::worker::{self, CancelToken, Direction, TransportKind, WorkerConfig, WorkerShared};
use ethburst::{frame, iface, ring, sock, stats};

// BSD sysexits kept for script compatibility.
const EX_SOFTWARE: i32 = 70;
const EX_NOPERM: i32 = 77;

/// Largest frame any transport will move; Rx buffers are sized to this.
const FRAME_SZ_MAX: u32 = 10_000;

#[derive(Debug, Parser)]
#[command(
    name = "ethburst",
    version,
    about = "Multi-threaded AF_PACKET Ethernet throughput exerciser"
)]
struct Args {
    /// Interface to test, by name
    #[arg(short = 'i', long = "interface", conflicts_with = "ifindex")]
    ifname: Option<String>,

    /// Interface to test, by index
    #[arg(short = 'I', long = "ifindex")]
    ifindex: Option<u32>,

    /// List AF_PACKET-capable interfaces and exit
    #[arg(short = 'l', long = "list", exclusive = true)]
    list: bool,

    /// Run the workers in receive mode (default is transmit)
    #[arg(short = 'r', long = "rx")]
    rx: bool,

    /// Transmit and receive on the same sockets; syscall transports only
    #[arg(long = "bidi", conflicts_with = "rx")]
    bidi: bool,

    /// Kernel send/receive method
    #[arg(short = 'p', long = "transport", value_enum, default_value = "simple")]
    transport: TransportKind,

    /// Worker thread count; a stats thread is started in addition
    #[arg(short = 'c', long = "workers", default_value_t = 1)]
    workers: u16,

    /// Frame size in bytes, excluding preamble/SFD/CRC/IFG; ignored with
    /// --frame-file
    #[arg(short = 'f', long = "frame-size", default_value_t = frame::STD_FRAME_SZ)]
    frame_sz: u32,

    /// Transmit a frame loaded from a file of hex octets instead of
    /// random data
    #[arg(short = 'C', long = "frame-file")]
    frame_file: Option<PathBuf>,

    /// Frames per sendmmsg()/recvmmsg() batch
    #[arg(short = 'm', long = "batch", default_value_t = 256)]
    batch: u32,

    /// Ring slot size per frame including metadata, 0 to derive from the
    /// frame size (PACKET_MMAP only)
    #[arg(short = 'a', long = "slot-size", default_value_t = 0)]
    slot_sz: u32,

    /// Ring block size in bytes (PACKET_MMAP only); defaults to one page
    #[arg(short = 'b', long = "block-size")]
    block_sz: Option<u32>,

    /// Ring block count (PACKET_MMAP only)
    #[arg(short = 'B', long = "block-count", default_value_t = 256)]
    block_nr: u32,

    /// Pin each worker thread to its own CPU
    #[arg(short = 'x', long = "pin")]
    pin: bool,

    /// Include per-second drop and queue-freeze counters in the stats
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // --verbose raises the default filter; RUST_LOG still wins.
    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_ansi(false)
        .init();

    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    if !Uid::effective().is_root() {
        error!("must be root to open AF_PACKET sockets");
        return EX_NOPERM;
    }

    if args.list {
        return match iface::print_list() {
            Ok(()) => 0,
            Err(err) => {
                error!(%err, "cannot list interfaces");
                1
            }
        };
    }

    let (ifname, ifindex) = match resolve_interface(&args) {
        Some(pair) => pair,
        None => return EX_SOFTWARE,
    };
    info!(ifname = %ifname, ifindex, "using interface");

    let direction = direction_of(&args);
    if !args.transport.supports(direction) {
        error!(
            transport = ?args.transport,
            "PACKET_MMAP rings map one direction only, --bidi needs a syscall transport"
        );
        return EX_SOFTWARE;
    }

    let frame = match build_frame(&args) {
        Ok(frame) => frame,
        Err(code) => return code,
    };
    let frame_sz = frame.len() as u32;
    info!(
        frame_sz,
        transport = ?args.transport,
        direction = ?direction,
        workers = args.workers,
        "starting"
    );
    if frame_sz > frame::STD_FRAME_SZ {
        warn!("frames above {} bytes need baby giant or jumbo support", frame::STD_FRAME_SZ);
    } else if frame_sz < frame::MIN_FRAME_SZ {
        warn!("frames below {} bytes get padded by the kernel", frame::MIN_FRAME_SZ);
    }

    let _promisc = match iface::PromiscGuard::enable(&ifname) {
        Ok(guard) => guard,
        Err(err) => {
            error!(%err, ifname = %ifname, "cannot set promiscuous mode");
            return 1;
        }
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            info!("quitting");
            cancel.cancel();
        }) {
            warn!(%err, "cannot install the signal handler");
        }
    }

    // CPU steering only matters with competing sockets.
    let fanout_group = if args.workers > 1 {
        Some((std::process::id() & 0xffff) as u16)
    } else {
        None
    };

    let sock_cfg = sock::SockConfig {
        ifindex: ifindex as libc::c_int,
        ifname,
        direction,
        transport: args.transport,
        frame_sz,
        frame_sz_max: FRAME_SZ_MAX,
        batch: args.batch,
        block_frm_sz: args.slot_sz,
        block_sz: args.block_sz.unwrap_or_else(ring::page_size),
        block_nr: args.block_nr,
        fanout_group,
    };

    let frame = Arc::new(frame);
    let mut shared = Vec::with_capacity(args.workers as usize);
    let mut handles = Vec::with_capacity(args.workers as usize);

    for id in 0..args.workers {
        let ws = Arc::new(WorkerShared::new());
        let cfg = WorkerConfig {
            id: id as u32,
            sock: sock_cfg.clone(),
            frame: Arc::clone(&frame),
            pin: args.pin,
        };
        match worker::spawn(cfg, Arc::clone(&ws), cancel.clone()) {
            Ok(handle) => {
                shared.push(ws);
                handles.push(handle);
            }
            Err(err) => {
                error!(worker = id, %err, "cannot spawn worker");
                cancel.cancel();
                break;
            }
        }
    }

    let stats_handle = match stats::spawn(shared, args.verbose, cancel.clone()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!(%err, "cannot spawn the stats thread");
            cancel.cancel();
            None
        }
    };

    let mut failed = handles.is_empty();
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed = true, // already logged by the worker
            Err(_) => {
                error!("worker panicked");
                failed = true;
            }
        }
    }

    cancel.cancel();
    if let Some(handle) = stats_handle {
        if handle.join().is_err() {
            error!("stats thread panicked");
        }
    }

    if failed { 1 } else { 0 }
}

fn direction_of(args: &Args) -> Direction {
    if args.bidi {
        Direction::Bidi
    } else if args.rx {
        Direction::Rx
    } else {
        Direction::Tx
    }
}

fn resolve_interface(args: &Args) -> Option<(String, u32)> {
    match (&args.ifname, args.ifindex) {
        (Some(name), _) => match iface::index_by_name(name) {
            Some(index) => Some((name.clone(), index)),
            None => {
                error!(ifname = %name, "no interface with that name");
                None
            }
        },
        (None, Some(index)) => match iface::name_by_index(index) {
            Some(name) => Some((name, index)),
            None => {
                error!(ifindex = index, "no interface with that index");
                None
            }
        },
        (None, None) => {
            error!("no interface chosen, see --list");
            None
        }
    }
}

/// The Tx payload: custom hex file or random bytes. The file's length
/// overrides --frame-size.
fn build_frame(args: &Args) -> Result<Vec<u8>, i32> {
    if let Some(path) = &args.frame_file {
        let frame = frame::load_hex_frame(path, FRAME_SZ_MAX as usize).map_err(|err| {
            error!(%err, path = %path.display(), "cannot load the frame file");
            EX_SOFTWARE
        })?;
        info!(octets = frame.len(), "using custom frame");
        return Ok(frame);
    }
    if args.frame_sz == 0 {
        error!("frame size must be at least one byte");
        return Err(EX_SOFTWARE);
    }
    if args.frame_sz > FRAME_SZ_MAX {
        error!(
            frame_sz = args.frame_sz,
            "frame size exceeds the {FRAME_SZ_MAX}-byte buffer"
        );
        return Err(EX_SOFTWARE);
    }
    Ok(frame::random_frame(args.frame_sz as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_oversized_frames_are_rejected() {
        let args = Args::parse_from(["ethburst", "-i", "lo", "-f", "0"]);
        assert_eq!(build_frame(&args), Err(EX_SOFTWARE));
        let args = Args::parse_from(["ethburst", "-i", "lo", "-f", "10001"]);
        assert_eq!(build_frame(&args), Err(EX_SOFTWARE));
        let args = Args::parse_from(["ethburst", "-i", "lo"]);
        assert_eq!(
            build_frame(&args).map(|f| f.len()),
            Ok(frame::STD_FRAME_SZ as usize)
        );
    }

    #[test]
    fn bidi_and_rx_are_exclusive() {
        assert!(Args::try_parse_from(["ethburst", "-i", "lo", "--bidi", "-r"]).is_err());
        let args = Args::parse_from(["ethburst", "-i", "lo", "--bidi"]);
        assert_eq!(direction_of(&args), Direction::Bidi);
        let args = Args::parse_from(["ethburst", "-i", "lo", "-r"]);
        assert_eq!(direction_of(&args), Direction::Rx);
        let args = Args::parse_from(["ethburst", "-i", "lo"]);
        assert_eq!(direction_of(&args), Direction::Tx);
    }
}
