//! The TCP acceptor and the per-connection peer device it spawns.

use crate::device::{Device, DeviceCore};
use crate::error::Status;
use crate::io::{IoCore, IoData, IoDevice, IoPayload};
use crate::net::{
    self, wildcard_host, ConnectedHost, HostAddr, IpHint, NetCore, NetworkDevice, NetworkMessage,
};
use crate::sys;

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

type NewPeerHandler = Box<dyn FnMut(Rc<RefCell<Peer>>)>;
type RequestHandler = Box<dyn FnMut(&NetworkMessage) -> Option<IoData>>;
type DisconnectHandler = Box<dyn FnMut(&mut Peer)>;

/// A listening stream socket that turns accepted connections into [`Peer`]
/// devices.
///
/// Each accepted peer is registered on the acceptor's engine before being
/// handed to the new-peer handler, which takes ownership; dropping the
/// handle discards the connection.
pub struct Acceptor {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    addr: Option<ConnectedHost>,
    bound: bool,
    on_new_peer: Option<NewPeerHandler>,
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Acceptor {
    pub fn new() -> Self {
        Self {
            core: DeviceCore::new(),
            io: IoCore::new(),
            net: NetCore::new(),
            addr: None,
            bound: false,
            on_new_peer: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The address this acceptor was last bound on.
    pub fn bound_address(&self) -> Option<&ConnectedHost> {
        self.addr.as_ref()
    }

    /// Installs the handler that receives every accepted peer.
    pub fn set_new_peer_handler(&mut self, handler: impl FnMut(Rc<RefCell<Peer>>) + 'static) {
        self.on_new_peer = Some(Box::new(handler));
    }

    /// Binds on the wildcard address for `port` under the given hint and
    /// starts listening.
    pub fn bind_port(&mut self, port: u16, hint: IpHint) -> Status {
        let (host, hint) = wildcard_host(port, hint);
        self.bind(host, hint)
    }

    /// Binds on an explicit host and starts listening.
    pub fn bind(&mut self, host: HostAddr, hint: IpHint) -> Status {
        self.disconnect();

        if self
            .create_and_bind(&host, hint, libc::SOCK_STREAM)
            .is_ok()
        {
            self.bound = true;
            self.addr = Some(ConnectedHost::new(host, hint));
            self.listen();
            return Status::Ok;
        }

        Status::Nok
    }

    /// Rebinds on a previously resolved host record.
    pub fn bind_to(&mut self, host: &ConnectedHost) -> Status {
        self.bind(host.addr.clone(), host.hint)
    }

    /// Drops the listening socket.
    pub fn disconnect(&mut self) {
        self.core.destroy_handle();
        self.bound = false;
    }

    fn listen(&mut self) {
        let Some(fd) = self.core.handle() else {
            log::warn!("listen requested with no device handle present");
            return;
        };

        if let Err(error) = sys::sys_listen(fd, i32::MAX) {
            self.disconnect();
            log::error!("unable to put the socket into listening mode: {error}");
        }
    }

    fn accept_one(&mut self) {
        let Some(fd) = self.core.handle() else {
            return;
        };

        let (peer_fd, storage, _len) = match sys::sys_accept(fd) {
            Ok(accepted) => accepted,
            Err(error) => {
                log::error!("accept failed: {error}");
                return;
            }
        };

        let peer_addr = net::storage_to_host(&storage)
            .unwrap_or_else(|_| HostAddr::new("Unknown AF", 0));

        let peer = Peer::from_accepted(peer_fd, peer_addr);
        self.core.register_child(&peer);

        if let Some(mut handler) = self.on_new_peer.take() {
            handler(peer);
            if self.on_new_peer.is_none() {
                self.on_new_peer = Some(handler);
            }
        }
    }
}

impl Device for Acceptor {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        self.accept_one();

        // Harmless on an already-listening socket; keeps the acceptor armed
        // after handle churn.
        self.listen();
    }

    fn ready_write(&mut self) {
        self.net_drain_outgoing();
    }

    fn ready_hangup(&mut self) {
        self.core.destroy_handle();
        log::error!("the listening descriptor hung up");
    }
}

impl IoDevice for Acceptor {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

impl NetworkDevice for Acceptor {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}

/// One accepted connection, owned by user code after the new-peer handler
/// ran.
///
/// A request handler may return a payload, which the peer synchronously
/// writes back; a drained read with no bytes marks the peer disconnected.
pub struct Peer {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    peer_addr: HostAddr,
    connected: bool,
    on_request: Option<RequestHandler>,
    on_disconnect: Option<DisconnectHandler>,
}

impl Peer {
    fn from_accepted(handle: RawFd, peer_addr: HostAddr) -> Rc<RefCell<Peer>> {
        let mut peer = Peer {
            core: DeviceCore::new(),
            io: IoCore::new(),
            net: NetCore::new(),
            peer_addr,
            connected: true,
            on_request: None,
            on_disconnect: None,
        };

        peer.register_io_handle(Some(handle));

        Rc::new(RefCell::new(peer))
    }

    /// The remote endpoint of this connection.
    pub fn peer_address(&self) -> &HostAddr {
        &self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Installs the handler invoked with every request; a returned payload
    /// is written back synchronously.
    pub fn set_request_handler(
        &mut self,
        handler: impl FnMut(&NetworkMessage) -> Option<IoData> + 'static,
    ) {
        self.on_request = Some(Box::new(handler));
    }

    /// Installs the handler invoked once when the peer disconnects.
    pub fn set_disconnect_handler(&mut self, handler: impl FnMut(&mut Peer) + 'static) {
        self.on_disconnect = Some(Box::new(handler));
    }

    fn peer_disconnected(&mut self) {
        self.connected = false;
        self.core.destroy_handle();

        if let Some(mut handler) = self.on_disconnect.take() {
            handler(self);
            if self.on_disconnect.is_none() {
                self.on_disconnect = Some(handler);
            }
        }
    }

    fn handle_request(&mut self, message: &NetworkMessage) {
        self.net.notify(message);

        let Some(mut handler) = self.on_request.take() else {
            return;
        };

        let response = handler(message);

        if self.on_request.is_none() {
            self.on_request = Some(handler);
        }

        let Some(response) = response else {
            log::debug!("no response provided for the request");
            return;
        };

        if self.sync_send(&IoPayload::Owned(response)).is_nok() {
            self.core.log_last_error("request response send failed");
        }
    }
}

impl Device for Peer {
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

        message.peer = self.peer_addr.clone();

        self.handle_request(&message);
    }

    fn ready_write(&mut self) {
        self.net_drain_outgoing();
    }

    fn ready_hangup(&mut self) {
        self.peer_disconnected();
    }

    fn ready_peer_disconnect(&mut self) {
        self.peer_disconnected();
    }
}

impl IoDevice for Peer {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

impl NetworkDevice for Peer {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}
