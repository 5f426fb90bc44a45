//! The multicast publisher/subscriber with its explicit two-phase
//! lifecycle: initialise for one address family, pick an interface, then
//! publish and/or subscribe to a group.

use crate::device::{Device, DeviceCore};
use crate::error::{DeviceErrorKind, Status};
use crate::io::{IoCore, IoDevice};
use crate::net::{HostAddr, IpHint, NetCore, NetworkDevice};
use crate::sys;

use libc::{
    c_int, c_uint, socklen_t, IPPROTO_IP, IPPROTO_IPV6, IPPROTO_UDP, IPV6_ADD_MEMBERSHIP,
    IPV6_MULTICAST_IF, IPV6_MULTICAST_LOOP, IP_ADD_MEMBERSHIP, IP_MULTICAST_IF,
    IP_MULTICAST_LOOP, SOCK_DGRAM,
};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// IPv4 multicast range: `224.0.0.0/4`.
const V4_GROUP_NETMASK: u32 = 0xF000_0000;
const V4_GROUP_NETWORK: u32 = 0xE000_0000;

/// IPv6 multicast range: `FF00::/8`.
const V6_GROUP_MAJOR_BYTE: u8 = 0xFF;

#[derive(Clone)]
struct Interface {
    name: String,
    v4_addr: Option<Ipv4Addr>,
}

/// A datagram socket configured for multicast publication and group
/// membership.
///
/// The sender side is ready once a group has been published; publication
/// caches a kernel-ready destination address so the write drain bypasses
/// resolution entirely.
pub struct Multicaster {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    initialised: bool,
    ip_version: IpHint,
    iface: Option<Interface>,
    published: Option<(libc::sockaddr_storage, socklen_t)>,
    published_group: Option<HostAddr>,
    subscribed_group: Option<HostAddr>,
}

impl Default for Multicaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Multicaster {
    pub fn new() -> Self {
        Self {
            core: DeviceCore::new(),
            io: IoCore::new(),
            net: NetCore::new(),
            initialised: false,
            ip_version: IpHint::Any,
            iface: None,
            published: None,
            published_group: None,
            subscribed_group: None,
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// The group most recently published to.
    pub fn published_group(&self) -> Option<&HostAddr> {
        self.published_group.as_ref()
    }

    /// The group most recently subscribed to.
    pub fn subscribed_group(&self) -> Option<&HostAddr> {
        self.subscribed_group.as_ref()
    }

    /// Creates the raw datagram socket for one address family.
    ///
    /// `Any` is not a valid family here: multicast group membership and
    /// interface selection are family-specific.
    pub fn initialise(&mut self, version: IpHint) -> Status {
        self.deinitialise();

        let family = match version {
            IpHint::V4 => libc::AF_INET,
            IpHint::V6 => libc::AF_INET6,
            IpHint::Any => {
                self.core.set_error(
                    DeviceErrorKind::InvalidLogic,
                    "the address family of a multicaster cannot be 'Any'",
                );
                return Status::Nok;
            }
        };

        let socket = match sys::sys_socket(family, SOCK_DGRAM, IPPROTO_UDP) {
            Ok(fd) => fd,
            Err(error) => {
                self.core
                    .set_error(error.raw_os_error().unwrap_or(0), "unable to create a socket");
                return Status::Nok;
            }
        };

        self.register_io_handle(Some(socket));
        self.ip_version = version;
        self.initialised = true;

        Status::Ok
    }

    /// Drops the socket and every recorded group.
    pub fn deinitialise(&mut self) {
        self.initialised = false;
        self.iface = None;
        self.published = None;
        self.published_group = None;
        self.subscribed_group = None;
        self.core.destroy_handle();
    }

    /// Selects the interface used for outgoing multicast and group joins.
    ///
    /// The named interface must exist and carry an address of the
    /// initialised family.
    pub fn set_interface(&mut self, name: &str) -> Status {
        self.iface = None;

        if !self.initialised {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the multicaster has not been initialised yet",
            );
            return Status::Nok;
        }

        let interfaces = match sys::sys_interface_addrs() {
            Ok(interfaces) => interfaces,
            Err(error) => {
                self.core.set_error(
                    error.raw_os_error().unwrap_or(0),
                    "unable to enumerate the local interfaces",
                );
                return Status::Nok;
            }
        };

        let v4 = interfaces
            .iter()
            .find(|(if_name, addr)| if_name == name && addr.is_ipv4());
        let v6 = interfaces
            .iter()
            .find(|(if_name, addr)| if_name == name && addr.is_ipv6());

        if v4.is_none() && v6.is_none() {
            self.core.set_error(
                DeviceErrorKind::InvalidArgument,
                "the provided interface does not exist",
            );
            return Status::Nok;
        }

        if self.ip_version == IpHint::V4 && v4.is_none() {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the multicaster was initialised as IPv4 but the provided interface \
                 only carries IPv6",
            );
            return Status::Nok;
        }

        if self.ip_version == IpHint::V6 && v6.is_none() {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the multicaster was initialised as IPv6 but the provided interface \
                 only carries IPv4",
            );
            return Status::Nok;
        }

        let Some(fd) = self.core.handle() else {
            self.core.set_error(
                DeviceErrorKind::GeneralError,
                "the multicaster is initialised but holds no descriptor",
            );
            return Status::Nok;
        };

        if self.ip_version == IpHint::V4 {
            let Some((_, std::net::IpAddr::V4(if_addr))) = v4 else {
                return Status::Nok;
            };

            let value = libc::in_addr { s_addr: u32::from(*if_addr).to_be() };

            if let Err(error) = sys::sys_setsockopt(fd, IPPROTO_IP, IP_MULTICAST_IF, &value) {
                self.core.set_error(
                    error.raw_os_error().unwrap_or(0),
                    "unable to select the multicast interface",
                );
                return Status::Nok;
            }

            self.iface = Some(Interface { name: name.to_string(), v4_addr: Some(*if_addr) });
        } else {
            let index: c_uint = sys::sys_interface_index(name);

            if let Err(error) = sys::sys_setsockopt(fd, IPPROTO_IPV6, IPV6_MULTICAST_IF, &index) {
                self.core.set_error(
                    error.raw_os_error().unwrap_or(0),
                    "unable to select the multicast interface",
                );
                return Status::Nok;
            }

            self.iface = Some(Interface { name: name.to_string(), v4_addr: None });
        }

        Status::Ok
    }

    /// Validates a group address and caches its kernel-ready form for the
    /// write drain, marking the sender side ready.
    pub fn publish_to_group(&mut self, group: HostAddr) -> Status {
        if !self.initialised {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the multicaster has not been initialised yet",
            );
            return Status::Nok;
        }

        self.published = None;
        self.published_group = None;

        let Some(addr) = self.parse_group(&group) else {
            return Status::Nok;
        };

        self.published = Some(sys::socketaddr_to_storage(&addr));
        self.published_group = Some(group);

        Status::Ok
    }

    /// Joins a group through the recorded interface and binds the socket on
    /// the group address.
    pub fn subscribe_to_group(&mut self, group: HostAddr) -> Status {
        if !self.initialised {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the multicaster has not been initialised yet",
            );
            return Status::Nok;
        }

        let Some(iface) = self.iface.clone() else {
            self.core
                .set_error(DeviceErrorKind::InvalidLogic, "an interface has not been set");
            return Status::Nok;
        };

        let Some(addr) = self.parse_group(&group) else {
            return Status::Nok;
        };

        let Some(fd) = self.core.handle() else {
            self.core.set_error(
                DeviceErrorKind::GeneralError,
                "the multicaster is initialised but holds no descriptor",
            );
            return Status::Nok;
        };

        let joined = match addr {
            SocketAddr::V4(v4) => {
                let Some(if_addr) = iface.v4_addr else {
                    self.core.set_error(
                        DeviceErrorKind::GeneralError,
                        "the recorded interface carries no IPv4 address",
                    );
                    return Status::Nok;
                };

                let request = libc::ip_mreq {
                    imr_multiaddr: libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() },
                    imr_interface: libc::in_addr { s_addr: u32::from(if_addr).to_be() },
                };

                sys::sys_setsockopt(fd, IPPROTO_IP, IP_ADD_MEMBERSHIP, &request)
            }
            SocketAddr::V6(v6) => {
                let request = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr { s6_addr: v6.ip().octets() },
                    ipv6mr_interface: sys::sys_interface_index(&iface.name),
                };

                sys::sys_setsockopt(fd, IPPROTO_IPV6, IPV6_ADD_MEMBERSHIP, &request)
            }
        };

        if let Err(error) = joined {
            self.core.set_error(
                error.raw_os_error().unwrap_or(0),
                "unable to join the multicast group",
            );
            return Status::Nok;
        }

        let (storage, len) = sys::socketaddr_to_storage(&addr);

        if let Err(error) = sys::sys_bind(fd, &storage, len) {
            self.core.set_error(
                error.raw_os_error().unwrap_or(0),
                "unable to bind the group address",
            );
            return Status::Nok;
        }

        self.subscribed_group = Some(group);

        Status::Ok
    }

    /// Toggles whether this host receives its own multicast sends.
    pub fn set_loopback(&mut self, enable: bool) -> Status {
        if !self.initialised {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the device has not been initialised yet",
            );
            return Status::Nok;
        }

        let Some(fd) = self.core.handle() else {
            self.core.set_error(
                DeviceErrorKind::GeneralError,
                "the multicaster is initialised but holds no descriptor",
            );
            return Status::Nok;
        };

        let value = enable as c_int;

        let outcome = if self.ip_version == IpHint::V4 {
            sys::sys_setsockopt(fd, IPPROTO_IP, IP_MULTICAST_LOOP, &value)
        } else {
            sys::sys_setsockopt(fd, IPPROTO_IPV6, IPV6_MULTICAST_LOOP, &value)
        };

        if let Err(error) = outcome {
            self.core.set_error(
                error.raw_os_error().unwrap_or(0),
                "unable to set multicast loopback",
            );
            return Status::Nok;
        }

        Status::Ok
    }

    fn parse_group(&mut self, group: &HostAddr) -> Option<SocketAddr> {
        match self.ip_version {
            IpHint::V4 => match group.ip.parse::<Ipv4Addr>() {
                Ok(ip) if u32::from(ip) & V4_GROUP_NETMASK == V4_GROUP_NETWORK => {
                    Some(SocketAddr::from((ip, group.port)))
                }
                Ok(_) => {
                    self.core.set_error(
                        DeviceErrorKind::InvalidArgument,
                        "the provided address is not a multicast address",
                    );
                    None
                }
                Err(_) => {
                    self.core.set_error(
                        DeviceErrorKind::InvalidArgument,
                        "the provided address is invalid",
                    );
                    None
                }
            },
            IpHint::V6 => match group.ip.parse::<Ipv6Addr>() {
                Ok(ip) if ip.octets()[0] == V6_GROUP_MAJOR_BYTE => {
                    Some(SocketAddr::from((ip, group.port)))
                }
                Ok(_) => {
                    self.core.set_error(
                        DeviceErrorKind::InvalidArgument,
                        "the provided address is not a multicast address",
                    );
                    None
                }
                Err(_) => {
                    self.core.set_error(
                        DeviceErrorKind::InvalidArgument,
                        "the provided address is invalid",
                    );
                    None
                }
            },
            IpHint::Any => {
                self.core.set_error(
                    DeviceErrorKind::GeneralError,
                    "the multicaster was somehow initialised without an address family",
                );
                None
            }
        }
    }
}

impl Device for Multicaster {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        self.net_ready_read();
    }

    /// The publish fast path: queued payloads go straight to the cached
    /// group address, skipping resolution.
    fn ready_write(&mut self) {
        if self.io.pending() == 0 {
            self.net_drain_outgoing();
            return;
        }

        let (Some(fd), Some((storage, len))) = (self.core.handle(), self.published) else {
            self.net_drain_outgoing();
            return;
        };

        let Some(item) = self.io.pop_outgoing() else {
            return;
        };

        if let Err(error) = sys::sys_sendto(fd, item.as_slice(), &storage, len) {
            log::error!("unable to send to the published group: {error}");
        }

        self.core.request_write();
    }
}

impl IoDevice for Multicaster {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }

    /// The sender side additionally requires a published group.
    fn device_is_ready(&self) -> bool {
        self.initialised && self.published.is_some()
    }
}

impl NetworkDevice for Multicaster {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}
