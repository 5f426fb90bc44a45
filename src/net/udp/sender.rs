//! The single-destination datagram sender.

use crate::device::{Device, DeviceCore};
use crate::error::Status;
use crate::io::{IoCore, IoDevice};
use crate::net::{ConnectedHost, HostAddr, IpHint, NetCore, NetworkDevice};

/// A datagram socket connected to one destination, so plain sends need no
/// per-packet address.
///
/// On error readiness the sender reconnects to the last host.
pub struct Sender {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    host: Option<ConnectedHost>,
    connected: bool,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    pub fn new() -> Self {
        Self {
            core: DeviceCore::new(),
            io: IoCore::new(),
            net: NetCore::new(),
            host: None,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The destination this sender was last connected to.
    pub fn connected_host(&self) -> Option<&ConnectedHost> {
        self.host.as_ref()
    }

    /// Connects the socket to a destination, dropping any previous one.
    pub fn connect(&mut self, host: HostAddr, hint: IpHint) -> Status {
        self.disconnect();

        if self
            .create_and_connect(&host, hint, libc::SOCK_DGRAM)
            .is_ok()
        {
            self.connected = true;
            self.host = Some(ConnectedHost::new(host, hint));
            return Status::Ok;
        }

        Status::Nok
    }

    pub fn disconnect(&mut self) {
        self.core.destroy_handle();
        self.connected = false;
    }
}

impl Device for Sender {
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

    fn ready_error(&mut self) {
        if let Some(host) = self.host.clone() {
            let _ = self.connect(host.addr, host.hint);
        }
    }
}

impl IoDevice for Sender {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

impl NetworkDevice for Sender {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}
