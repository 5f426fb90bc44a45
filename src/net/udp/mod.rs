//! Connectionless transports: single-destination senders, bound receivers,
//! a request/response client, a multicast publisher/subscriber, and a
//! server that models datagram sources as logical peers.

mod client;
mod multicast;
mod receiver;
mod sender;
mod server;

pub use client::Client;
pub use multicast::Multicaster;
pub use receiver::Receiver;
pub use sender::Sender;
pub use server::{Peer, Server};
