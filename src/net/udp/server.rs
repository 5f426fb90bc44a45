//! The datagram "server": one bound socket whose incoming traffic is
//! classified by source address into logical [`Peer`] entries.
//!
//! Peers are synthesized lazily from the first datagram a source sends.
//! They are not devices: a peer routes its sends through the server's
//! socket via a shared block that carries the socket mirror, the engine
//! back-pointer and the outgoing datagram queue. The block is held weakly,
//! so a peer outliving its server degrades to `DeviceNotReady` instead of
//! dangling.

use crate::device::{Device, DeviceCore, EngineRef};
use crate::error::{DeviceError, DeviceErrorKind, Status};
use crate::io::{IoCore, IoDevice, IoPayload};
use crate::net::{
    self, wildcard_host, ConnectedHost, HostAddr, IpHint, NetCore, NetOutgoing, NetworkDevice,
    NetworkMessage,
};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

type NewPeerHandler = Box<dyn FnMut(&NetworkMessage, Rc<RefCell<Peer>>)>;
type PeerMessageHandler = Box<dyn FnMut(&NetworkMessage)>;

/// Server state that synthetic peers reach without borrowing the server
/// device itself, so peer sends stay legal mid-dispatch.
pub(crate) struct ServerShared {
    fd: Cell<Option<RawFd>>,
    engine: EngineRef,
    outgoing: RefCell<VecDeque<NetOutgoing>>,
    peers: RefCell<Vec<Weak<RefCell<Peer>>>>,
}

impl ServerShared {
    fn request_write(&self) {
        if let Some(state) = self.engine.get() {
            state.borrow_mut().request_write(self.fd.get());
        }
    }
}

/// A bound datagram socket that models each datagram source as a logical
/// peer.
///
/// The most recent source is cached, so `send`/`sync_send` without an
/// explicit destination answer whoever spoke last.
pub struct Server {
    core: DeviceCore,
    io: IoCore,
    net: NetCore,
    shared: Rc<ServerShared>,
    addr: Option<ConnectedHost>,
    bound: bool,
    last_peer: Option<HostAddr>,
    on_new_peer: Option<NewPeerHandler>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let core = DeviceCore::new();
        let shared = Rc::new(ServerShared {
            fd: Cell::new(None),
            engine: core.engine_ref().clone(),
            outgoing: RefCell::new(VecDeque::new()),
            peers: RefCell::new(Vec::new()),
        });

        Self {
            core,
            io: IoCore::new(),
            net: NetCore::new(),
            shared,
            addr: None,
            bound: false,
            last_peer: None,
            on_new_peer: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The address this server was last bound on.
    pub fn bound_address(&self) -> Option<&ConnectedHost> {
        self.addr.as_ref()
    }

    /// Installs the handler that receives every newly synthesized peer
    /// together with its first message. The handler takes ownership of the
    /// peer.
    pub fn set_new_peer_handler(
        &mut self,
        handler: impl FnMut(&NetworkMessage, Rc<RefCell<Peer>>) + 'static,
    ) {
        self.on_new_peer = Some(Box::new(handler));
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
            self.shared.fd.set(self.core.handle());
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

    /// Drops the socket and invalidates every synthetic peer.
    ///
    /// Invalidated peers report `DeviceNotReady` from then on, even if the
    /// server binds again.
    pub fn disconnect(&mut self) {
        self.core.destroy_handle();
        self.bound = false;
        self.shared.fd.set(None);

        let peers: Vec<Weak<RefCell<Peer>>> =
            self.shared.peers.borrow_mut().drain(..).collect();

        for peer in peers {
            if let Some(peer) = peer.upgrade() {
                peer.borrow_mut().invalidate();
            }
        }
    }

    /// Queues a datagram to the most recent peer.
    pub fn send(&mut self, data: impl Into<IoPayload>) -> Status {
        let Some(dest) = self.last_peer.clone() else {
            self.core.set_error(
                DeviceErrorKind::DeviceNotReady,
                "a message must first be received from a peer before destination-less \
                 sends can be used",
            );
            return Status::Nok;
        };

        self.send_to(dest, data, IpHint::Any)
    }

    /// Sends a datagram to the most recent peer immediately.
    pub fn sync_send(&mut self, data: &IoPayload) -> Status {
        let Some(dest) = self.last_peer.clone() else {
            self.core.set_error(
                DeviceErrorKind::DeviceNotReady,
                "a message must first be received from a peer before destination-less \
                 sends can be used",
            );
            return Status::Nok;
        };

        self.sync_send_to(&dest, data, IpHint::Any)
    }

    /// Queues a datagram for the readiness-driven drain.
    ///
    /// Routed through the shared queue so server and peers drain in one
    /// order.
    pub fn send_to(&mut self, dest: HostAddr, data: impl Into<IoPayload>, hint: IpHint) -> Status {
        if !self.core.is_attached() {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "asynchronous sends require the device to be registered with an engine; \
                 the message will be dropped",
            );
            return Status::Nok;
        }

        if !self.device_is_ready() {
            self.core.set_error(
                DeviceErrorKind::InvalidLogic,
                "the device is not ready; the message will be dropped",
            );
            return Status::Nok;
        }

        self.shared
            .outgoing
            .borrow_mut()
            .push_back(NetOutgoing { payload: data.into(), dest, hint });
        self.core.request_write();

        Status::Ok
    }

    fn deliver(&mut self, message: &NetworkMessage) {
        self.net.notify(message);
        self.last_peer = Some(message.peer.clone());

        let existing = self
            .shared
            .peers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|peer| peer.borrow().peer_addr == message.peer);

        let Some(peer) = existing else {
            self.synthesize_peer(message);
            return;
        };

        let handler = peer.borrow_mut().on_message.take();

        if let Some(mut handler) = handler {
            handler(message);

            let mut peer = peer.borrow_mut();
            if peer.on_message.is_none() {
                peer.on_message = Some(handler);
            }
        }
    }

    fn synthesize_peer(&mut self, message: &NetworkMessage) {
        let Some(mut handler) = self.on_new_peer.take() else {
            return;
        };

        log::debug!("new peer {}", message.peer);

        let peer = Rc::new(RefCell::new(Peer {
            peer_addr: message.peer.clone(),
            server: Rc::downgrade(&self.shared),
            valid: true,
            last_error: DeviceError::default(),
            on_message: None,
        }));

        self.shared.peers.borrow_mut().push(Rc::downgrade(&peer));

        handler(message, peer);

        if self.on_new_peer.is_none() {
            self.on_new_peer = Some(handler);
        }
    }
}

impl Device for Server {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn ready_read(&mut self) {
        loop {
            let message = match self.receive_message() {
                Ok(message) => message,
                Err(error) if error.is_would_block() => break,
                Err(error) => {
                    log::error!("error reading descriptor: {error}");
                    break;
                }
            };

            self.deliver(&message);
        }
    }

    fn ready_write(&mut self) {
        let item = self.shared.outgoing.borrow_mut().pop_front();

        let Some(item) = item else {
            self.drain_outgoing();
            return;
        };

        if self.sync_send_to(&item.dest, &item.payload, item.hint).is_nok() {
            log::error!(
                "unable to send queued datagram: {}",
                self.core.last_error()
            );
        }

        self.core.request_write();
    }
}

impl IoDevice for Server {
    fn io(&self) -> &IoCore {
        &self.io
    }

    fn io_mut(&mut self) -> &mut IoCore {
        &mut self.io
    }
}

impl NetworkDevice for Server {
    fn net(&self) -> &NetCore {
        &self.net
    }

    fn net_mut(&mut self) -> &mut NetCore {
        &mut self.net
    }
}

/// A logical datagram peer, synthesized from a source address.
///
/// Sends are delegated to the owning server's socket; once the server
/// disconnects or drops, every operation records `DeviceNotReady`.
pub struct Peer {
    peer_addr: HostAddr,
    server: Weak<ServerShared>,
    valid: bool,
    last_error: DeviceError,
    on_message: Option<PeerMessageHandler>,
}

impl Peer {
    /// The source address this peer stands for.
    pub fn peer_address(&self) -> &HostAddr {
        &self.peer_addr
    }

    /// Whether the owning server is still there to send through.
    pub fn is_valid(&self) -> bool {
        self.valid && self.server.strong_count() > 0
    }

    /// Installs the callback invoked with every further message from this
    /// source.
    pub fn set_message_handler(&mut self, handler: impl FnMut(&NetworkMessage) + 'static) {
        self.on_message = Some(Box::new(handler));
    }

    /// The most recently recorded failure.
    pub fn last_error(&self) -> &DeviceError {
        &self.last_error
    }

    /// Queues a datagram to an explicit destination through the server.
    pub fn send_to(&mut self, dest: HostAddr, data: impl Into<IoPayload>, hint: IpHint) -> Status {
        let Some(shared) = self.server() else {
            return Status::Nok;
        };

        shared
            .outgoing
            .borrow_mut()
            .push_back(NetOutgoing { payload: data.into(), dest, hint });
        shared.request_write();

        Status::Ok
    }

    /// Sends a datagram to an explicit destination immediately.
    pub fn sync_send_to(&mut self, dest: &HostAddr, data: &IoPayload, hint: IpHint) -> Status {
        let Some(shared) = self.server() else {
            return Status::Nok;
        };

        let Some(fd) = shared.fd.get() else {
            self.set_error(DeviceErrorKind::DeviceNotReady, "the server socket is not bound");
            return Status::Nok;
        };

        if let Err(error) = net::sync_send_to_fd(fd, dest, hint, data.as_slice()) {
            self.set_error(error.code, error.description);
            return Status::Nok;
        }

        Status::Ok
    }

    /// Queues a datagram back to this peer's own address.
    pub fn send(&mut self, data: impl Into<IoPayload>) -> Status {
        let dest = self.peer_addr.clone();
        self.send_to(dest, data, IpHint::Any)
    }

    /// Sends a datagram back to this peer's own address immediately.
    pub fn sync_send(&mut self, data: &IoPayload) -> Status {
        let dest = self.peer_addr.clone();
        self.sync_send_to(&dest, data, IpHint::Any)
    }

    fn set_error(&mut self, code: impl Into<crate::error::ErrorCode>, description: impl Into<String>) {
        self.last_error = DeviceError { code: code.into(), description: description.into() };
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.server = Weak::new();
    }

    fn server(&mut self) -> Option<Rc<ServerShared>> {
        if self.valid {
            if let Some(shared) = self.server.upgrade() {
                return Some(shared);
            }
        }

        self.set_error(
            DeviceErrorKind::DeviceNotReady,
            "this peer requires a valid server instance",
        );
        None
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(shared) = self.server.upgrade() {
            shared
                .peers
                .borrow_mut()
                .retain(|peer| peer.upgrade().is_some());
        }
    }
}
