//! Thin wrappers around the platform calls the crate is built on.
//!
//! Every `unsafe` syscall invocation lives here, behind small `sys_*`
//! functions that translate failure into `io::Error` (or a raw count where
//! the caller needs to inspect `errno` itself). Nothing in this module knows
//! about engines or devices.

use libc::{
    accept, bind, c_char, c_int, c_uint, close, connect, fcntl, freeaddrinfo, freeifaddrs,
    getaddrinfo, getifaddrs, getsockname, if_nametoindex, listen, poll, pollfd, read, recvfrom,
    sendto, setsockopt, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socket, socklen_t,
    timerfd_create, timerfd_settime, write, AF_INET, AF_INET6, AF_UNSPEC, CLOCK_MONOTONIC,
    F_GETFL, F_SETFL, O_NONBLOCK, SOL_SOCKET, SO_REUSEADDR, TFD_NONBLOCK,
};
use std::ffi::{CStr, CString};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::time::Duration;
use std::{io, mem, ptr};

/// Reads from a file descriptor into the given buffer.
///
/// Returns the raw count; negative means failure with `errno` set.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a file descriptor.
///
/// Returns the raw count; negative means failure with `errno` set.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Sets a file descriptor to non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Polls a single descriptor for the requested events.
///
/// Returns `Ok(None)` when the wait timed out, otherwise the reported
/// `revents`. `timeout_ms` of `-1` blocks indefinitely.
pub(crate) fn sys_poll_one(fd: RawFd, events: i16, timeout_ms: i32) -> io::Result<Option<i16>> {
    let mut entry = pollfd { fd, events, revents: 0 };

    let rc = unsafe { poll(&mut entry, 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(None);
    }

    Ok(Some(entry.revents))
}

/// Polls a whole descriptor set in place.
///
/// Returns the number of descriptors with pending events, `0` on timeout.
pub(crate) fn sys_poll(entries: &mut [pollfd], timeout_ms: i32) -> io::Result<usize> {
    let rc = unsafe { poll(entries.as_mut_ptr(), entries.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(rc as usize)
}

/// Creates a socket of the given family and type.
pub(crate) fn sys_socket(family: c_int, socktype: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = unsafe { socket(family, socktype, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Binds a socket to an address.
pub(crate) fn sys_bind(fd: RawFd, addr: &sockaddr_storage, len: socklen_t) -> io::Result<()> {
    let rc = unsafe { bind(fd, addr as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Connects a socket to an address.
pub(crate) fn sys_connect(fd: RawFd, addr: &sockaddr_storage, len: socklen_t) -> io::Result<()> {
    let rc = unsafe { connect(fd, addr as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Marks a socket as a listening socket.
pub(crate) fn sys_listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    let rc = unsafe { listen(fd, backlog) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Accepts a pending connection, returning the new descriptor and the peer
/// address in its binary form.
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, sockaddr_storage, socklen_t)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let peer = unsafe { accept(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if peer < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((peer, storage, len))
}

/// Returns the local address a socket is bound or connected on.
pub(crate) fn sys_getsockname(fd: RawFd) -> io::Result<(sockaddr_storage, socklen_t)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((storage, len))
}

/// Sets an arbitrary socket option from a plain value.
pub(crate) fn sys_setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        setsockopt(
            fd,
            level,
            name,
            value as *const T as *const _,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Enables `SO_REUSEADDR` on a socket.
pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let yes: c_int = 1;
    sys_setsockopt(fd, SOL_SOCKET, SO_REUSEADDR, &yes)
}

/// Receives one datagram, returning the byte count and the sender address.
pub(crate) fn sys_recvfrom(
    fd: RawFd,
    buffer: &mut [u8],
) -> io::Result<(usize, sockaddr_storage, socklen_t)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe {
        recvfrom(
            fd,
            buffer.as_mut_ptr() as *mut _,
            buffer.len(),
            0,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((rc as usize, storage, len))
}

/// Sends a datagram to an explicit address.
pub(crate) fn sys_sendto(
    fd: RawFd,
    buffer: &[u8],
    addr: &sockaddr_storage,
    len: socklen_t,
) -> io::Result<usize> {
    let rc = unsafe {
        sendto(
            fd,
            buffer.as_ptr() as *const _,
            buffer.len(),
            0,
            addr as *const _ as *const sockaddr,
            len,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(rc as usize)
}

/// Converts a binary socket address to a Rust `SocketAddr`.
pub(crate) fn sockaddr_storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }

        AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Converts a Rust `SocketAddr` to its binary form.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}

/// One address produced by name resolution, ready to hand to `socket(2)`
/// and `connect(2)`/`bind(2)`.
#[derive(Clone)]
pub(crate) struct ResolvedAddr {
    pub(crate) family: c_int,
    pub(crate) socktype: c_int,
    pub(crate) protocol: c_int,
    pub(crate) storage: sockaddr_storage,
    pub(crate) len: socklen_t,
}

/// Address family selector used during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveFamily {
    Any,
    V4,
    V6,
}

impl ResolveFamily {
    fn as_af(self) -> c_int {
        match self {
            ResolveFamily::Any => AF_UNSPEC,
            ResolveFamily::V4 => AF_INET,
            ResolveFamily::V6 => AF_INET6,
        }
    }
}

/// Resolves a textual host and port into a list of candidate addresses.
///
/// On failure the resolver's diagnostic string is returned so it can be
/// recorded on the device that asked.
pub(crate) fn sys_resolve(
    ip: &str,
    port: u16,
    family: ResolveFamily,
    socktype: c_int,
) -> Result<Vec<ResolvedAddr>, String> {
    let node = CString::new(ip).map_err(|_| "host contains an interior NUL".to_string())?;
    let service = CString::new(port.to_string()).map_err(|_| "invalid service".to_string())?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family.as_af();
    hints.ai_socktype = socktype;

    let mut info: *mut libc::addrinfo = ptr::null_mut();

    let status = unsafe { getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut info) };
    if status != 0 {
        let diag = unsafe { CStr::from_ptr(libc::gai_strerror(status)) };
        return Err(diag.to_string_lossy().into_owned());
    }

    let mut resolved = Vec::new();
    let mut current = info;

    while !current.is_null() {
        let entry = unsafe { &*current };
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let len = entry.ai_addrlen.min(mem::size_of::<sockaddr_storage>() as socklen_t);

        unsafe {
            ptr::copy_nonoverlapping(
                entry.ai_addr as *const u8,
                &mut storage as *mut _ as *mut u8,
                len as usize,
            );
        }

        resolved.push(ResolvedAddr {
            family: entry.ai_family,
            socktype: entry.ai_socktype,
            protocol: entry.ai_protocol,
            storage,
            len,
        });

        current = entry.ai_next;
    }

    unsafe { freeaddrinfo(info) };

    if resolved.is_empty() {
        return Err("resolution produced no addresses".to_string());
    }

    Ok(resolved)
}

/// Enumerates the local interfaces that carry an IP address.
pub(crate) fn sys_interface_addrs() -> io::Result<Vec<(String, IpAddr)>> {
    let mut head: *mut libc::ifaddrs = ptr::null_mut();

    let rc = unsafe { getifaddrs(&mut head) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut found = Vec::new();
    let mut current = head;

    while !current.is_null() {
        let entry = unsafe { &*current };
        current = entry.ifa_next;

        if entry.ifa_addr.is_null() {
            continue;
        }

        let family = unsafe { (*entry.ifa_addr).sa_family } as c_int;
        if family != AF_INET && family != AF_INET6 {
            continue;
        }

        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let len = if family == AF_INET {
            mem::size_of::<sockaddr_in>()
        } else {
            mem::size_of::<sockaddr_in6>()
        };

        unsafe {
            ptr::copy_nonoverlapping(
                entry.ifa_addr as *const u8,
                &mut storage as *mut _ as *mut u8,
                len,
            );
        }

        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        if let Ok(addr) = sockaddr_storage_to_socketaddr(&storage) {
            found.push((name, addr.ip()));
        }
    }

    unsafe { freeifaddrs(head) };

    Ok(found)
}

/// Returns the kernel index of a named interface, `0` if unknown.
pub(crate) fn sys_interface_index(name: &str) -> c_uint {
    let Ok(name) = CString::new(name) else {
        return 0;
    };

    unsafe { if_nametoindex(name.as_ptr()) }
}

/// Creates a non-blocking monotonic timer descriptor.
pub(crate) fn sys_timerfd_create() -> io::Result<RawFd> {
    let fd = unsafe { timerfd_create(CLOCK_MONOTONIC, TFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Arms a timer descriptor with the given initial expiry and repeat
/// interval. Passing zero durations disarms it.
pub(crate) fn sys_timerfd_arm(fd: RawFd, initial: Duration, interval: Duration) -> io::Result<()> {
    fn to_timespec(duration: Duration) -> libc::timespec {
        libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as _,
        }
    }

    let value = libc::itimerspec {
        it_value: to_timespec(initial),
        it_interval: to_timespec(interval),
    };

    let rc = unsafe { timerfd_settime(fd, 0, &value, ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Converts a Rust string into a NUL-terminated C string.
pub(crate) fn c_string(value: &str) -> io::Result<CString> {
    CString::new(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string contains interior NUL"))
}

/// Opens a path with the given flags, for character devices.
pub(crate) fn sys_open(path: &str, flags: c_int) -> io::Result<RawFd> {
    let path = c_string(path)?;

    let fd = unsafe { libc::open(path.as_ptr() as *const c_char, flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}
