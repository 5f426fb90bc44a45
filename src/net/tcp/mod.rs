//! Connection-oriented transports: a client peer and an acceptor that
//! spawns one device per accepted connection.

mod client;
mod server;

pub use client::Client;
pub use server::{Acceptor, Peer};
