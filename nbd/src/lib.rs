//! NBD (Network Block Device) protocol implementation.
//!
//! This crate provides the wire-level pieces shared by the filebd server and
//! its tests: protocol constants, the fixed-layout request/reply frames, and
//! a small client for driving a server end-to-end.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod client;
mod protocol;

pub use client::NbdClient;
pub use protocol::*;
