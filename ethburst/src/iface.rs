//! Interface lookup, listing and promiscuous mode.

use std::fmt::Write as _;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::ifaddrs::getifaddrs;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use tracing::{info, warn};

use crate::linux;
use crate::{Error, Result};

pub fn index_by_name(name: &str) -> Option<libc::c_uint> {
    let cname = std::ffi::CString::new(name).ok()?;
    match unsafe { libc::if_nametoindex(cname.as_ptr()) } {
        0 => None,
        idx => Some(idx),
    }
}

pub fn name_by_index(index: libc::c_uint) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Some(cstr.to_string_lossy().into_owned())
}

fn ifreq_for(name: &str) -> libc::ifreq {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr
}

/// Throwaway socket for interface ioctls; no privileges needed.
fn ioctl_socket() -> Result<OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(|errno| Error::Sys { op: "socket", errno })
}

fn txqueuelen(fd: &OwnedFd, name: &str) -> Result<i32> {
    let mut ifr = ifreq_for(name);
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), linux::SIOCGIFTXQLEN, &mut ifr) };
    if rc == -1 {
        return Err(Error::sys("ioctl(SIOCGIFTXQLEN)"));
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_metric })
}

/// One line per AF_PACKET-capable interface: name, index, MAC, txqueuelen.
pub fn print_list() -> Result<()> {
    let fd = ioctl_socket()?;
    let addrs = getifaddrs().map_err(|errno| Error::Sys {
        op: "getifaddrs",
        errno,
    })?;

    for ifa in addrs {
        let Some(link) = ifa.address.as_ref().and_then(|a| a.as_link_addr()) else {
            continue;
        };
        let mut mac = String::new();
        if let Some(addr) = link.addr() {
            for (i, byte) in addr.iter().enumerate() {
                let sep = if i == 0 { "" } else { ":" };
                let _ = write!(mac, "{sep}{byte:02x}");
            }
        }
        let qlen = txqueuelen(&fd, &ifa.interface_name).unwrap_or(-1);
        println!(
            "{}\tindex {}\tMAC {}\ttxqueuelen {}",
            ifa.interface_name,
            link.ifindex(),
            mac,
            qlen
        );
    }
    Ok(())
}

/// Puts the interface into promiscuous mode and restores the previous
/// flags on drop. If the interface was already promiscuous nothing is
/// changed either way.
pub struct PromiscGuard {
    name: String,
    was_promisc: bool,
}

impl PromiscGuard {
    pub fn enable(name: &str) -> Result<PromiscGuard> {
        let fd = ioctl_socket()?;
        let mut ifr = ifreq_for(name);
        if unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) } == -1 {
            return Err(Error::sys("ioctl(SIOCGIFFLAGS)"));
        }

        let flags = unsafe { ifr.ifr_ifru.ifru_flags };
        let was_promisc = flags & libc::IFF_PROMISC as libc::c_short != 0;
        if !was_promisc {
            ifr.ifr_ifru.ifru_flags = flags | libc::IFF_PROMISC as libc::c_short;
            if unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCSIFFLAGS, &mut ifr) } == -1 {
                return Err(Error::sys("ioctl(SIOCSIFFLAGS)"));
            }
            info!(ifname = name, "interface set to promiscuous mode");
        }

        Ok(PromiscGuard {
            name: name.to_string(),
            was_promisc,
        })
    }
}

impl Drop for PromiscGuard {
    fn drop(&mut self) {
        if self.was_promisc {
            return;
        }
        let restore = || -> Result<()> {
            let fd = ioctl_socket()?;
            let mut ifr = ifreq_for(&self.name);
            if unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) } == -1 {
                return Err(Error::sys("ioctl(SIOCGIFFLAGS)"));
            }
            unsafe {
                ifr.ifr_ifru.ifru_flags &= !(libc::IFF_PROMISC as libc::c_short);
            }
            if unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCSIFFLAGS, &mut ifr) } == -1 {
                return Err(Error::sys("ioctl(SIOCSIFFLAGS)"));
            }
            Ok(())
        };
        match restore() {
            Ok(()) => info!(ifname = %self.name, "promiscuous mode removed"),
            Err(err) => warn!(ifname = %self.name, %err, "cannot remove promiscuous mode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_resolves_both_ways() {
        let idx = index_by_name("lo").expect("no loopback interface");
        assert_eq!(name_by_index(idx).as_deref(), Some("lo"));
    }

    #[test]
    fn unknown_names_and_indexes_are_none() {
        assert_eq!(index_by_name("definitely-not-an-iface"), None);
        assert_eq!(name_by_index(u32::MAX), None);
    }
}
