//! The bound datagram receiver.

use crate::device::{Device, DeviceCore};
use crate::error::Status;
use crate::io::{IoCore, IoDevice};
use crate::net::{wildcard_host, ConnectedHost, HostAddr, IpHint, NetCore, NetworkDevice};

/// A datagram socket bound on a local address, delivering every received
/// datagram with its source to the message callback.
pub struct Receiver {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    addr: Option<ConnectedHost>,
    bound: bool,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            core: DeviceCore::new(),
            io: IoCore::new(),
            net: NetCore::new(),
            addr: None,
            bound: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The address this receiver was last bound on.
    pub fn bound_address(&self) -> Option<&ConnectedHost> {
        self.addr.as_ref()
    }

    /// Binds on an explicit host, dropping any previous binding first.
    pub fn bind(&mut self, host: HostAddr, hint: IpHint) -> Status {
        self.disconnect();

        if self
            .create_and_bind(&host, hint, libc::SOCK_DGRAM)
            .is_ok()
        {
            self.bound = true;
            self.addr = Some(ConnectedHost::new(host, hint));
            return Status::Ok;
        }

        Status::Nok
    }

    /// Binds on the wildcard address for `port` under the given hint.
    pub fn bind_port(&mut self, port: u16, hint: IpHint) -> Status {
        let (host, hint) = wildcard_host(port, hint);
        self.bind(host, hint)
    }

    /// Rebinds on a previously resolved host record.
    pub fn bind_to(&mut self, host: &ConnectedHost) -> Status {
        self.bind(host.addr.clone(), host.hint)
    }

    pub fn disconnect(&mut self) {
        self.core.destroy_handle();
        self.bound = false;
    }
}

impl Device for Receiver {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        self.net_ready_read();
    }

    fn ready_write(&mut self) {
        self.net_drain_outgoing();
    }
}

impl IoDevice for Receiver {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

impl NetworkDevice for Receiver {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}
