//! # Crossbar
//!
//! **Crossbar** is a single-threaded, readiness-driven I/O multiplexing
//! library. One [`Engine`] owns a poll set of heterogeneous *devices*
//! (TCP clients and acceptors, UDP senders, receivers, multicast groups
//! and datagram servers, serial ports, and interval timers) and routes
//! each readiness event to the device that owns the descriptor.
//!
//! There is no executor and no futures: user code drives the engine with
//! `run_once`/`run_for`/`run_forever`, and devices deliver data through
//! plain callbacks on the driving thread. It offers:
//!
//! - A **poll(2) engine** with ordered dispatch of readable, writable,
//!   error, hangup, invalid and peer-disconnect readiness
//! - **Queued asynchronous sends** drained one payload per tick, plus
//!   blocking send/receive/request-response paths
//! - **Connection-oriented TCP** with peer-disconnect detection and
//!   per-connection peer devices on the server side
//! - **Connectionless UDP** with per-datagram peer addressing, multicast
//!   publish/subscribe, and a server that models datagram sources as
//!   logical peers
//! - **Serial ports and interval timers** behind the same device interface
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use crossbar::net::udp::Receiver;
//! use crossbar::net::{IpHint, NetworkDevice};
//! use crossbar::Engine;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let engine = Engine::new();
//! let receiver = Rc::new(RefCell::new(Receiver::new()));
//!
//! receiver.borrow_mut().bind_port(9000, IpHint::V4);
//! receiver.borrow_mut().set_message_callback(|message| {
//!     println!("{} sent {} bytes", message.peer, message.data.len());
//! });
//!
//! engine.register(&receiver);
//! engine.run_forever();
//! ```
//!
//! ## Modules
//!
//! - [`net`] — TCP and UDP transports plus addressing types
//! - [`io`] — byte-stream devices (serial ports) and the payload model
//! - [`timer`] — interval timers
//!
//! Every callback runs on the engine's driving thread; the synchronous
//! operations block that thread and are meant for setup paths or threads
//! that do not share an engine.

pub mod device;
pub mod engine;
pub mod error;
pub mod io;
pub mod net;
pub mod timer;

pub(crate) mod sys;

pub use device::{Device, DeviceCore};
pub use engine::Engine;
pub use error::{
    DeviceError, DeviceErrorKind, EngineError, EngineErrorKind, ErrorCode, Status,
};
pub use io::{IoData, IoDevice, IoPayload, ReceivedData};
