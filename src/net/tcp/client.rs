//! The TCP client device.

use crate::device::{Device, DeviceCore};
use crate::error::Status;
use crate::io::{IoCore, IoDevice, IoPayload, ReceivedData};
use crate::net::{ConnectedHost, HostAddr, IpHint, NetCore, NetworkDevice, NetworkMessage};

use std::time::Duration;

type DisconnectNotify = Box<dyn FnMut(&mut Client)>;

/// A connection-oriented stream client.
///
/// Incoming bytes are delivered unframed through the message callback with
/// the connected host as the peer. A drained read that produces no bytes
/// means the peer closed the connection: the handle is destroyed and the
/// disconnect notifier runs.
pub struct Client {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    host: Option<ConnectedHost>,
    connected: bool,
    on_disconnect: Option<DisconnectNotify>,
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
            on_disconnect: None,
        }
    }

    /// The host this client was last connected to.
    pub fn connected_host(&self) -> Option<&ConnectedHost> {
        self.host.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Installs the notifier invoked when the peer closes the connection.
    pub fn set_disconnect_notify(&mut self, notify: impl FnMut(&mut Client) + 'static) {
        self.on_disconnect = Some(Box::new(notify));
    }

    /// Connects to a host, dropping any previous connection first.
    pub fn connect(&mut self, host: HostAddr, hint: IpHint) -> Status {
        self.disconnect();

        if self
            .create_and_connect(&host, hint, libc::SOCK_STREAM)
            .is_ok()
        {
            self.connected = true;
            self.host = Some(ConnectedHost::new(host, hint));
            return Status::Ok;
        }

        Status::Nok
    }

    /// Reconnects to a previously resolved host record.
    pub fn connect_to(&mut self, host: &ConnectedHost) -> Status {
        self.connect(host.addr.clone(), host.hint)
    }

    /// Closes the connection and deregisters the descriptor.
    pub fn disconnect(&mut self) {
        self.core.destroy_handle();
        self.connected = false;
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

    fn peer_disconnected(&mut self) {
        self.connected = false;
        self.core.destroy_handle();

        if let Some(mut notify) = self.on_disconnect.take() {
            notify(self);
            if self.on_disconnect.is_none() {
                self.on_disconnect = Some(notify);
            }
        }
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
        let mut message = NetworkMessage::default();

        let outcome = self.read_io_data(&mut message.data);

        if message.data.is_empty() {
            log::debug!("peer closed the connection");
            self.peer_disconnected();
            return;
        }

        if let Err(error) = outcome {
            log::error!("error reading descriptor: {error}");
            return;
        }

        if let Some(host) = self.host.as_ref() {
            message.peer = host.addr.clone();
        }

        self.net.notify(&message);
    }

    fn ready_write(&mut self) {
        self.net_drain_outgoing();
    }

    fn ready_hangup(&mut self) {
        log::debug!("peer closed the connection");
        self.peer_disconnected();
    }

    fn ready_peer_disconnect(&mut self) {
        log::debug!("peer closed the connection");
        self.peer_disconnected();
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
