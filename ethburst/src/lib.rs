//! AF_PACKET throughput testing building blocks.
//!
//! The binary wires these together: [`sock`] brings up one raw socket per
//! worker, [`transport`] moves frames over it, [`worker`] owns the thread
//! and its counters, [`stats`] reports once a second. [`ring`] and
//! [`linux`] carry the PACKET_MMAP geometry math and kernel ABI.

pub mod frame;
pub mod iface;
pub mod linux;
pub mod ring;
pub mod sock;
pub mod stats;
pub mod transport;
pub mod worker;

pub use nix::errno::Errno;

/// Error type for ethburst operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A syscall failed; carries the operation name and the OS error.
    #[error("{op}: {errno}")]
    Sys { op: &'static str, errno: Errno },
    /// Ring geometry that the kernel ring allocator would reject.
    #[error("invalid ring geometry: {0}")]
    Geometry(String),
    /// A transport/direction/kernel combination that cannot work.
    #[error("{0}")]
    Unsupported(String),
    #[error("frame file: {0}")]
    FrameFile(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Capture `errno` for a failed syscall under the operation name `op`.
    pub(crate) fn sys(op: &'static str) -> Self {
        Error::Sys {
            op,
            errno: Errno::last(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
