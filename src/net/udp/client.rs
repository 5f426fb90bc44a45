//! The datagram request/response client.

use crate::device::{Device, DeviceCore};
use crate::error::Status;
use crate::io::{IoCore, IoDevice, IoPayload, ReceivedData};
use crate::net::{ConnectedHost, HostAddr, IpHint, NetCore, NetworkDevice};

use std::time::Duration;

/// A connected datagram socket that also receives, supporting blocking
/// request/response exchanges against a single destination.
///
/// On error readiness the client reconnects to the last host and logs the
/// recorded failure if the reconnect does not take.
pub struct Client {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    host: Option<ConnectedHost>,
    connected: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
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

    /// The destination this client was last connected to.
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
        self.connected = false;
        self.core.destroy_handle();
    }

    /// Sends a request and blocks for the response, with no receive bound.
    pub fn sync_request_response(&mut self, data: &IoPayload) -> ReceivedData {
        if self.sync_send(data).is_nok() {
            return ReceivedData::failed();
        }

        self.sync_receive(None)
    }

    /// Sends a request and blocks for the response for at most `timeout`.
    pub fn sync_request_response_timeout(
        &mut self,
        data: &IoPayload,
        timeout: Duration,
    ) -> ReceivedData {
        if self.sync_send(data).is_nok() {
            return ReceivedData::failed();
        }

        self.sync_receive(Some(timeout))
    }
}

impl Device for Client {
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
        let Some(host) = self.host.clone() else {
            return;
        };

        if self.connect(host.addr, host.hint).is_nok() {
            self.core.log_last_error("datagram client reconnect");
        }
    }
}

impl IoDevice for Client {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

impl NetworkDevice for Client {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}
