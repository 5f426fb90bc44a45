//! The datagram server and its synthesized peers.

use crossbar::net::udp::{Peer, Server};
use crossbar::net::{HostAddr, IpHint, NetworkDevice, NetworkMessage};
use crossbar::{Engine, ErrorCode, IoPayload};

use std::cell::RefCell;
use std::net::UdpSocket;
use std::rc::Rc;
use std::time::Duration;

struct Fixture {
    engine: Engine,
    server: Rc<RefCell<Server>>,
    peers: Rc<RefCell<Vec<Rc<RefCell<Peer>>>>>,
    first_messages: Rc<RefCell<Vec<NetworkMessage>>>,
    port: u16,
}

fn fixture() -> Fixture {
    let engine = Engine::new();
    let server = Rc::new(RefCell::new(Server::new()));
    let peers: Rc<RefCell<Vec<Rc<RefCell<Peer>>>>> = Rc::new(RefCell::new(Vec::new()));
    let first_messages: Rc<RefCell<Vec<NetworkMessage>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let peers = peers.clone();
        let first_messages = first_messages.clone();

        server.borrow_mut().set_new_peer_handler(move |message, peer| {
            first_messages.borrow_mut().push(message.clone());
            peers.borrow_mut().push(peer);
        });
    }

    assert!(server
        .borrow_mut()
        .bind(HostAddr::new("127.0.0.1", 0), IpHint::V4)
        .is_ok());
    assert!(engine.register(&server).is_ok());

    let port = server
        .borrow_mut()
        .local_address()
        .expect("Failed to get bound address")
        .port;

    Fixture { engine, server, peers, first_messages, port }
}

fn drive(engine: &Engine, ticks: usize) {
    for _ in 0..ticks {
        engine.run_once(Some(Duration::from_millis(50)));
    }
}

#[test]
fn the_first_datagram_from_a_source_synthesizes_a_peer() {
    let fx = fixture();

    let alice = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    alice
        .send_to(b"hello", ("127.0.0.1", fx.port))
        .expect("Failed to send");

    drive(&fx.engine, 2);

    assert_eq!(fx.peers.borrow().len(), 1);
    assert_eq!(fx.first_messages.borrow().len(), 1);
    assert_eq!(fx.first_messages.borrow()[0].data, b"hello");

    let alice_port = alice.local_addr().expect("Failed to get local address").port();
    assert_eq!(fx.peers.borrow()[0].borrow().peer_address().port, alice_port);
}

#[test]
fn later_datagrams_reach_the_peer_callback_not_the_new_peer_handler() {
    let fx = fixture();

    let alice = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    alice
        .send_to(b"first", ("127.0.0.1", fx.port))
        .expect("Failed to send");
    drive(&fx.engine, 2);

    let deliveries: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let deliveries = deliveries.clone();
        fx.peers.borrow()[0]
            .borrow_mut()
            .set_message_handler(move |message| {
                deliveries.borrow_mut().push(message.data.clone());
            });
    }

    alice
        .send_to(b"second", ("127.0.0.1", fx.port))
        .expect("Failed to send");
    drive(&fx.engine, 2);

    assert_eq!(fx.peers.borrow().len(), 1, "no duplicate peer for a known source");
    assert_eq!(deliveries.borrow().as_slice(), [b"second".to_vec()]);
}

#[test]
fn distinct_sources_become_distinct_peers() {
    let fx = fixture();

    let alice = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    let bob = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");

    alice.send_to(b"a", ("127.0.0.1", fx.port)).expect("Failed to send");
    bob.send_to(b"b", ("127.0.0.1", fx.port)).expect("Failed to send");

    drive(&fx.engine, 3);

    assert_eq!(fx.peers.borrow().len(), 2);
}

#[test]
fn peers_and_the_server_send_back_through_the_shared_socket() {
    let fx = fixture();

    let alice = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    alice
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("Failed to set timeout");
    alice
        .send_to(b"hello", ("127.0.0.1", fx.port))
        .expect("Failed to send");
    drive(&fx.engine, 2);

    let peer = fx.peers.borrow()[0].clone();
    let mut buffer = [0_u8; 32];

    // Immediate reply to the peer's own address.
    assert!(peer
        .borrow_mut()
        .sync_send(&IoPayload::from(b"pong".to_vec()))
        .is_ok());
    let count = alice.recv(&mut buffer).expect("Failed to receive peer reply");
    assert_eq!(&buffer[..count], b"pong");

    // Destination-less server send re-uses the last source.
    assert!(fx
        .server
        .borrow_mut()
        .sync_send(&IoPayload::from(b"again".to_vec()))
        .is_ok());
    let count = alice.recv(&mut buffer).expect("Failed to receive server reply");
    assert_eq!(&buffer[..count], b"again");

    // A queued peer send drains on the next writable tick.
    assert!(peer.borrow_mut().send(b"queued").is_ok());
    drive(&fx.engine, 3);
    let count = alice.recv(&mut buffer).expect("Failed to receive queued reply");
    assert_eq!(&buffer[..count], b"queued");
}

#[test]
fn disconnecting_the_server_invalidates_its_peers() {
    let fx = fixture();

    let alice = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    alice
        .send_to(b"hello", ("127.0.0.1", fx.port))
        .expect("Failed to send");
    drive(&fx.engine, 2);

    let peer = fx.peers.borrow()[0].clone();
    assert!(peer.borrow().is_valid());

    fx.server.borrow_mut().disconnect();

    assert!(!peer.borrow().is_valid());
    assert!(peer
        .borrow_mut()
        .sync_send(&IoPayload::from(b"void".to_vec()))
        .is_nok());
    assert!(matches!(
        peer.borrow().last_error().code,
        ErrorCode::Internal(crossbar::DeviceErrorKind::DeviceNotReady)
    ));

    // Queued sends are refused the same way.
    assert!(peer.borrow_mut().send(b"void").is_nok());
}

#[test]
fn a_dropped_peer_leaves_the_server_peer_list() {
    let fx = fixture();

    let alice = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    alice
        .send_to(b"hello", ("127.0.0.1", fx.port))
        .expect("Failed to send");
    drive(&fx.engine, 2);

    assert_eq!(fx.peers.borrow().len(), 1);
    fx.peers.borrow_mut().clear();

    // The same source now counts as new again.
    alice
        .send_to(b"back", ("127.0.0.1", fx.port))
        .expect("Failed to send");
    drive(&fx.engine, 2);

    assert_eq!(fx.peers.borrow().len(), 1);
    assert_eq!(fx.first_messages.borrow().len(), 2);
}
