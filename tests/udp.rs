//! Datagram delivery with peer attribution, and the request/response
//! client.

use crossbar::net::udp::{Client, Receiver, Sender};
use crossbar::net::{HostAddr, IpHint, NetworkDevice, NetworkMessage};
use crossbar::{Engine, IoDevice, IoPayload};

use std::cell::RefCell;
use std::net::UdpSocket;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn a_datagram_arrives_with_its_sender_attributed() {
    let engine = Engine::new();
    let receiver = Rc::new(RefCell::new(Receiver::new()));
    let received: Rc<RefCell<Vec<NetworkMessage>>> = Rc::new(RefCell::new(Vec::new()));

    assert!(receiver
        .borrow_mut()
        .bind(HostAddr::new("127.0.0.1", 0), IpHint::V4)
        .is_ok());

    {
        let received = received.clone();
        receiver.borrow_mut().set_message_callback(move |message| {
            received.borrow_mut().push(message.clone());
        });
    }

    assert!(engine.register(&receiver).is_ok());

    let bound = receiver
        .borrow_mut()
        .local_address()
        .expect("Failed to get bound address");
    assert_ne!(bound.port, 0);

    let mut sender = Sender::new();
    assert!(sender
        .connect(HostAddr::new("127.0.0.1", bound.port), IpHint::V4)
        .is_ok());

    let sender_local = sender
        .local_address()
        .expect("Failed to get sender address");

    assert!(sender.sync_send(&IoPayload::from(vec![1, 2, 3, 4])).is_ok());
    assert!(engine.run_once(Some(Duration::from_millis(1000))));

    let messages = received.borrow();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, vec![1, 2, 3, 4]);
    assert_eq!(messages[0].peer.port, sender_local.port);
    assert_eq!(messages[0].peer.ip, "127.0.0.1");
}

#[test]
fn port_only_binds_pick_a_kernel_port() {
    let mut receiver = Receiver::new();

    assert!(receiver.bind_port(0, IpHint::V4).is_ok());
    assert!(receiver.is_bound());

    let bound = receiver
        .local_address()
        .expect("Failed to get bound address");
    assert_ne!(bound.port, 0);
}

#[test]
fn each_buffered_datagram_is_delivered_separately() {
    let engine = Engine::new();
    let receiver = Rc::new(RefCell::new(Receiver::new()));
    let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));

    assert!(receiver
        .borrow_mut()
        .bind(HostAddr::new("127.0.0.1", 0), IpHint::V4)
        .is_ok());

    {
        let received = received.clone();
        receiver.borrow_mut().set_message_callback(move |message| {
            received.borrow_mut().push(message.data.clone());
        });
    }

    assert!(engine.register(&receiver).is_ok());

    let port = receiver
        .borrow_mut()
        .local_address()
        .expect("Failed to get bound address")
        .port;

    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    socket.send_to(b"one", ("127.0.0.1", port)).expect("Failed to send");
    socket.send_to(b"two", ("127.0.0.1", port)).expect("Failed to send");

    // Both datagrams may already be buffered; one tick must deliver each
    // as its own message.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while received.borrow().len() < 2 && std::time::Instant::now() < deadline {
        engine.run_once(Some(Duration::from_millis(50)));
    }

    assert_eq!(received.borrow().as_slice(), [b"one".to_vec(), b"two".to_vec()]);
}

#[test]
fn the_datagram_client_completes_a_request_response_exchange() {
    // A plain echo service on a std socket.
    let echo = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind echo socket");
    let port = echo.local_addr().expect("Failed to get local address").port();
    let (started_tx, started_rx) = mpsc::channel();

    let service = thread::spawn(move || {
        started_tx.send(()).expect("Failed to signal start");

        let mut buffer = [0_u8; 1024];
        let (count, from) = echo.recv_from(&mut buffer).expect("Failed to receive");
        echo.send_to(&buffer[..count], from).expect("Failed to echo");
    });

    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Echo service never started");

    let mut client = Client::new();
    assert!(client
        .connect(HostAddr::new("127.0.0.1", port), IpHint::V4)
        .is_ok());

    let response = client.sync_request_response_timeout(
        &IoPayload::from(vec![9, 8, 7]),
        Duration::from_millis(1000),
    );

    assert!(response.is_ok());
    assert_eq!(response.data, Some(vec![9, 8, 7]));

    service.join().expect("Echo thread panicked");
}

#[test]
fn queued_datagrams_with_destinations_drain_through_the_engine() {
    let engine = Engine::new();
    let sender = Rc::new(RefCell::new(Sender::new()));

    let target = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    target
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("Failed to set timeout");
    let target_port = target.local_addr().expect("Failed to get local address").port();

    let side = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind socket");
    side.set_read_timeout(Some(Duration::from_secs(2)))
        .expect("Failed to set timeout");
    let side_port = side.local_addr().expect("Failed to get local address").port();

    assert!(sender
        .borrow_mut()
        .connect(HostAddr::new("127.0.0.1", target_port), IpHint::V4)
        .is_ok());
    assert!(engine.register(&sender).is_ok());

    // A queued explicit-destination send bypasses the connected peer.
    assert!(sender
        .borrow_mut()
        .send_to(HostAddr::new("127.0.0.1", side_port), b"aside", IpHint::V4)
        .is_ok());
    // A queued plain send goes to the connected peer.
    assert!(sender.borrow_mut().async_send(b"direct").is_ok());

    for _ in 0..4 {
        engine.run_once(Some(Duration::from_millis(100)));
    }

    let mut buffer = [0_u8; 16];
    let count = side.recv(&mut buffer).expect("Failed to receive explicit send");
    assert_eq!(&buffer[..count], b"aside");

    let count = target.recv(&mut buffer).expect("Failed to receive plain send");
    assert_eq!(&buffer[..count], b"direct");
}
