//! NBD (Network Block Device) server implementation.
//!
//! This module wires the `nbd` crate's protocol types to the filebd backing
//! stores:
//!
//! - [`Connection`] owns one client socket and drives the full state
//!   machine: handshake, option haggling, transmission, disconnect drain
//! - [`Registry`] tracks live connections for bookkeeping and shutdown
//! - [`Listener`] abstracts over connection sources (TCP, channels)
//!
//! For serving multiple connections, use `Daemon::listen()`, which accepts
//! sockets and hands each to the registry.

mod command;
mod connection;
mod listener;
mod registry;

pub use connection::{Connection, Export};
pub use listener::{Listener, StreamListener};
pub use registry::Registry;
// Re-export protocol types from the nbd crate
pub use nbd::{NbdCommand, NbdReply, NbdRequest};
