//! Datagram and connection addressing on top of the I/O device: host
//! resolution, socket creation, and per-packet peer attribution.
//!
//! Transports live in the [`tcp`] and [`udp`] submodules. The
//! [`NetworkDevice`] trait provides what they share: the resolution walk
//! over `getaddrinfo` candidates, connect/bind socket creation where the
//! first working candidate wins, datagram send/receive with explicit peer
//! addresses, and a network outgoing queue drained ahead of the plain
//! byte-stream queue.

pub mod tcp;
pub mod udp;

use crate::error::{DeviceError, DeviceErrorKind, Status};
use crate::io::{IoData, IoDevice, IoPayload};
use crate::sys::{self, ResolveFamily};

use libc::c_int;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::RawFd;

/// Size of the per-thread scratch buffer used for one datagram.
const DATAGRAM_BUFFER_LEN: usize = 65536;

thread_local! {
    /// Scratch buffer reused by every datagram receive on this thread.
    static RECV_SCRATCH: RefCell<Box<[u8]>> =
        RefCell::new(vec![0; DATAGRAM_BUFFER_LEN].into_boxed_slice());
}

/// A peer or local endpoint as a textual IP plus a host-order port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HostAddr {
    pub ip: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Address family preference applied during resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpHint {
    #[default]
    Any,
    V4,
    V6,
}

impl IpHint {
    pub(crate) fn family(self) -> ResolveFamily {
        match self {
            IpHint::Any => ResolveFamily::Any,
            IpHint::V4 => ResolveFamily::V4,
            IpHint::V6 => ResolveFamily::V6,
        }
    }
}

/// A host address together with the hint it was resolved under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectedHost {
    pub addr: HostAddr,
    pub hint: IpHint,
}

impl ConnectedHost {
    pub fn new(addr: HostAddr, hint: IpHint) -> Self {
        Self { addr, hint }
    }
}

/// A received payload together with the peer it came from.
#[derive(Debug, Clone, Default)]
pub struct NetworkMessage {
    pub data: IoData,
    pub peer: HostAddr,
}

/// A queued outgoing datagram: payload plus destination.
pub(crate) struct NetOutgoing {
    pub(crate) payload: IoPayload,
    pub(crate) dest: HostAddr,
    pub(crate) hint: IpHint,
}

type MessageCallback = Box<dyn FnMut(&NetworkMessage)>;

/// Callback and queue state embedded in every network transport.
#[derive(Default)]
pub struct NetCore {
    callback: Option<MessageCallback>,
    outgoing: VecDeque<NetOutgoing>,
}

impl NetCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_callback(&mut self, callback: MessageCallback) {
        self.callback = Some(callback);
    }

    pub(crate) fn notify(&mut self, message: &NetworkMessage) {
        if let Some(callback) = self.callback.as_mut() {
            callback(message);
        }
    }
}

/// The wildcard bind address for a port-only bind under the given hint.
pub(crate) fn wildcard_host(port: u16, hint: IpHint) -> (HostAddr, IpHint) {
    if hint == IpHint::V4 {
        (HostAddr::new("0.0.0.0", port), IpHint::V4)
    } else {
        (HostAddr::new("::", port), IpHint::V6)
    }
}

/// Converts a binary peer address to a [`HostAddr`].
pub(crate) fn storage_to_host(
    storage: &libc::sockaddr_storage,
) -> Result<HostAddr, DeviceError> {
    match sys::sockaddr_storage_to_socketaddr(storage) {
        Ok(addr) => Ok(HostAddr::new(addr.ip().to_string(), addr.port())),
        Err(_) => Err(DeviceError::internal(
            DeviceErrorKind::GeneralError,
            "unable to extract a peer address: unknown address family",
        )),
    }
}

/// Resolves a destination and sends one datagram to the first candidate.
pub(crate) fn sync_send_to_fd(
    fd: RawFd,
    dest: &HostAddr,
    hint: IpHint,
    data: &[u8],
) -> Result<(), DeviceError> {
    let resolved = sys::sys_resolve(&dest.ip, dest.port, hint.family(), libc::SOCK_DGRAM)
        .map_err(|diag| {
            DeviceError::internal(
                DeviceErrorKind::GeneralError,
                format!("unable to resolve {dest}: {diag}"),
            )
        })?;

    let first = &resolved[0];

    let sent = sys::sys_sendto(fd, data, &first.storage, first.len).map_err(|error| {
        DeviceError::os(
            error.raw_os_error().unwrap_or(0),
            format!("unable to send a datagram to {dest}"),
        )
    })?;

    if sent < data.len() {
        return Err(DeviceError::internal(
            DeviceErrorKind::GeneralError,
            format!("short datagram write: {sent} of {} bytes", data.len()),
        ));
    }

    Ok(())
}

/// Address resolution, socket creation and datagram semantics shared by the
/// network transports.
pub trait NetworkDevice: IoDevice {
    fn net(&self) -> &NetCore;
    fn net_mut(&mut self) -> &mut NetCore;

    /// Installs the callback invoked with every received message.
    fn set_message_callback(&mut self, callback: impl FnMut(&NetworkMessage) + 'static) {
        self.net_mut().set_callback(Box::new(callback));
    }

    /// Creates a socket of the given type and connects it to `host`.
    ///
    /// The resolution candidates are tried in order; the first that both
    /// creates and connects wins and becomes the device handle.
    fn create_and_connect(&mut self, host: &HostAddr, hint: IpHint, socktype: c_int) -> Status {
        let resolved = match sys::sys_resolve(&host.ip, host.port, hint.family(), socktype) {
            Ok(resolved) => resolved,
            Err(diag) => {
                self.core_mut().set_error(
                    DeviceErrorKind::GeneralError,
                    format!("unable to resolve {host}: {diag}"),
                );
                return Status::Nok;
            }
        };

        let mut last_errno = 0;

        for candidate in &resolved {
            let fd = match sys::sys_socket(candidate.family, candidate.socktype, candidate.protocol)
            {
                Ok(fd) => fd,
                Err(error) => {
                    last_errno = error.raw_os_error().unwrap_or(0);
                    continue;
                }
            };

            match sys::sys_connect(fd, &candidate.storage, candidate.len) {
                Ok(()) => {
                    self.register_io_handle(Some(fd));
                    return Status::Ok;
                }
                Err(error) => {
                    last_errno = error.raw_os_error().unwrap_or(0);
                    sys::sys_close(fd);
                }
            }
        }

        self.core_mut()
            .set_error(last_errno, format!("unable to connect to {host} on any resolved address"));
        Status::Nok
    }

    /// Creates a socket of the given type and binds it to `host`.
    ///
    /// After a successful bind the socket gets `SO_REUSEADDR`; failing to
    /// set it discards that candidate.
    fn create_and_bind(&mut self, host: &HostAddr, hint: IpHint, socktype: c_int) -> Status {
        let resolved = match sys::sys_resolve(&host.ip, host.port, hint.family(), socktype) {
            Ok(resolved) => resolved,
            Err(diag) => {
                self.core_mut().set_error(
                    DeviceErrorKind::GeneralError,
                    format!("unable to resolve {host}: {diag}"),
                );
                return Status::Nok;
            }
        };

        let mut last_errno = 0;

        for candidate in &resolved {
            let fd = match sys::sys_socket(candidate.family, candidate.socktype, candidate.protocol)
            {
                Ok(fd) => fd,
                Err(error) => {
                    last_errno = error.raw_os_error().unwrap_or(0);
                    continue;
                }
            };

            if let Err(error) = sys::sys_bind(fd, &candidate.storage, candidate.len) {
                last_errno = error.raw_os_error().unwrap_or(0);
                sys::sys_close(fd);
                continue;
            }

            if let Err(error) = sys::sys_set_reuseaddr(fd) {
                last_errno = error.raw_os_error().unwrap_or(0);
                sys::sys_close(fd);
                continue;
            }

            self.register_io_handle(Some(fd));
            return Status::Ok;
        }

        self.core_mut()
            .set_error(last_errno, format!("unable to bind {host} on any resolved address"));
        Status::Nok
    }

    /// Receives exactly one buffered datagram and the peer it came from.
    ///
    /// A would-block failure means the kernel buffer is drained; callers
    /// looping on this should stop there.
    fn receive_message(&mut self) -> Result<NetworkMessage, DeviceError> {
        let Some(fd) = self.core().handle() else {
            return Err(DeviceError::internal(
                DeviceErrorKind::DeviceNotReady,
                "the device has not been configured yet; unable to receive",
            ));
        };

        RECV_SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();

            let (count, storage, _len) = sys::sys_recvfrom(fd, &mut scratch[..])
                .map_err(|error| {
                    DeviceError::os(error.raw_os_error().unwrap_or(0), "datagram read error")
                })?;

            let peer = storage_to_host(&storage)?;

            Ok(NetworkMessage { data: scratch[..count].to_vec(), peer })
        })
    }

    /// Queues a datagram for the readiness-driven drain.
    ///
    /// Same preconditions as [`IoDevice::async_send`].
    fn send_to(&mut self, dest: HostAddr, data: impl Into<IoPayload>, hint: IpHint) -> Status {
        if !self.core().is_attached() {
            self.core_mut().set_error(
                DeviceErrorKind::InvalidLogic,
                "asynchronous sends require the device to be registered with an engine; \
                 the message will be dropped",
            );
            return Status::Nok;
        }

        if !self.device_is_ready() {
            self.core_mut().set_error(
                DeviceErrorKind::InvalidLogic,
                "the device is not ready; the message will be dropped",
            );
            return Status::Nok;
        }

        self.net_mut()
            .outgoing
            .push_back(NetOutgoing { payload: data.into(), dest, hint });
        self.core().request_write();

        Status::Ok
    }

    /// Resolves the destination and sends one datagram immediately.
    fn sync_send_to(&mut self, dest: &HostAddr, data: &IoPayload, hint: IpHint) -> Status {
        if !self.device_is_ready() {
            self.core_mut()
                .set_error(DeviceErrorKind::InvalidLogic, "the device is not ready");
            return Status::Nok;
        }

        let Some(fd) = self.core().handle() else {
            self.core_mut().set_error(
                DeviceErrorKind::DeviceNotReady,
                "the device has not been configured yet; unable to send",
            );
            return Status::Nok;
        };

        if let Err(error) = sync_send_to_fd(fd, dest, hint, data.as_slice()) {
            self.core_mut().set_error(error.code, error.description);
            return Status::Nok;
        }

        Status::Ok
    }

    /// Default writable behavior for network transports: the datagram queue
    /// drains ahead of the byte-stream queue, one item per tick.
    fn net_drain_outgoing(&mut self) {
        let Some(item) = self.net_mut().outgoing.pop_front() else {
            self.drain_outgoing();
            return;
        };

        if self.sync_send_to(&item.dest, &item.payload, item.hint).is_nok() {
            log::error!(
                "unable to send queued datagram: {}",
                self.core().last_error()
            );
        }

        self.core().request_write();
    }

    /// Default readable behavior for datagram transports: deliver every
    /// buffered datagram to the message callback.
    fn net_ready_read(&mut self) {
        loop {
            let message = match self.receive_message() {
                Ok(message) => message,
                Err(error) if error.is_would_block() => break,
                Err(error) => {
                    log::error!("error reading descriptor: {error}");
                    break;
                }
            };

            self.net_mut().notify(&message);
        }
    }

    /// The local address the socket is bound or connected on.
    fn local_address(&mut self) -> Result<HostAddr, DeviceError> {
        let Some(fd) = self.core().handle() else {
            let error = DeviceError::internal(
                DeviceErrorKind::DeviceNotReady,
                "the device has not been configured yet; it has no local address",
            );
            self.core_mut().set_error(error.code, error.description.clone());
            return Err(error);
        };

        let storage = match sys::sys_getsockname(fd) {
            Ok((storage, _len)) => storage,
            Err(os) => {
                let error = DeviceError::os(
                    os.raw_os_error().unwrap_or(0),
                    "unable to query the local socket address",
                );
                self.core_mut().set_error(error.code, error.description.clone());
                return Err(error);
            }
        };

        match storage_to_host(&storage) {
            Ok(addr) => Ok(addr),
            Err(error) => {
                self.core_mut().set_error(error.code, error.description.clone());
                Err(error)
            }
        }
    }
}
