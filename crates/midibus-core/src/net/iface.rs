//! Interface lookup and the multicast socket options std doesn't expose
//!
//! `std::net::UdpSocket` covers group membership and loopback; choosing the
//! outgoing multicast interface needs a raw `setsockopt`.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::AsRawFd;
use std::ptr;

use crate::error::{Error, Result};

/// Owned `getifaddrs` list, freed on drop
struct IfAddrs(*mut libc::ifaddrs);

impl IfAddrs {
    fn new() -> io::Result<Self> {
        let mut head: *mut libc::ifaddrs = ptr::null_mut();
        // SAFETY: getifaddrs writes a list head we free in Drop.
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(head))
    }

    fn iter(&self) -> impl Iterator<Item = &libc::ifaddrs> {
        let mut cur = self.0;
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            // SAFETY: non-null entries of the list stay valid until freeifaddrs.
            let entry = unsafe { &*cur };
            cur = entry.ifa_next;
            Some(entry)
        })
    }
}

impl Drop for IfAddrs {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: pointer came from a successful getifaddrs.
            unsafe { libc::freeifaddrs(self.0) };
        }
    }
}

/// IPv4 address of a named interface that is up
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    let addrs = IfAddrs::new()?;
    let mut exists = false;
    let mut up = false;
    let mut address = None;

    for entry in addrs.iter() {
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let entry_name = unsafe { CStr::from_ptr(entry.ifa_name) };
        if entry_name.to_bytes() != name.as_bytes() {
            continue;
        }
        exists = true;
        if entry.ifa_flags & (libc::IFF_UP as libc::c_uint) != 0 {
            up = true;
        }
        if entry.ifa_addr.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is non-null and points at a sockaddr header.
        let family = unsafe { (*entry.ifa_addr).sa_family } as libc::c_int;
        if family == libc::AF_INET && address.is_none() {
            // SAFETY: AF_INET entries are sockaddr_in.
            let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
            address = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        }
    }

    if !exists {
        return Err(Error::Interface(format!("interface {} not found", name)));
    }
    if !up {
        return Err(Error::Interface(format!("interface {} is down", name)));
    }
    address.ok_or_else(|| Error::Interface(format!("interface {} has no IPv4 address", name)))
}

/// Kernel index of a named interface (for IPv6 membership)
pub fn interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| Error::Interface(format!("invalid interface name {:?}", name)))?;
    // SAFETY: c_name is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(Error::Interface(format!("interface {} not found", name)));
    }
    Ok(index)
}

fn setsockopt<T>(socket: &UdpSocket, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: value points at a live T of the size we pass.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `IP_MULTICAST_IF`: send IPv4 multicast through the interface owning `addr`
pub fn set_multicast_if_v4(socket: &UdpSocket, addr: Ipv4Addr) -> io::Result<()> {
    let in_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    setsockopt(socket, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &in_addr)
}

/// `IPV6_MULTICAST_IF`: send IPv6 multicast through interface `index`
pub fn set_multicast_if_v6(socket: &UdpSocket, index: u32) -> io::Result<()> {
    let index = index as libc::c_uint;
    setsockopt(socket, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_IF, &index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_interface() {
        let err = interface_ipv4("nosuchif0").unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
        assert!(matches!(interface_index("nosuchif0"), Err(Error::Interface(_))));
    }

    #[test]
    fn test_loopback_lookup() {
        // "lo" is present and up on any Linux host, including containers
        if cfg!(target_os = "linux") {
            assert_eq!(interface_ipv4("lo").unwrap(), Ipv4Addr::LOCALHOST);
            assert!(interface_index("lo").unwrap() > 0);
        }
    }

    #[test]
    fn test_multicast_if_on_loopback() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert!(set_multicast_if_v4(&socket, Ipv4Addr::LOCALHOST).is_ok());
    }
}
