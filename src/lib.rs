#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

//! The `rostcp` library implements the receive path of a lightweight TCP:
//! everything that happens between "an IP datagram carrying TCP arrived" and
//! "the application was told about it".
//!
//! It is organized the same way as a full stack, narrowed to TCP:
//!
//!  * [wire] decodes and emits TCP headers and options, and models sequence numbers.
//!  * [storage] holds the out-of-sequence queue and the transmit queues.
//!  * [socket] holds the per-connection control block, its state machine and
//!    the receive, RTT and congestion engine.
//!  * [iface] owns the connection table, demultiplexes segments onto
//!    connections, listeners and TIME-WAIT entries, and drives notifications.
//!
//! Checksum verification, IP routing, the application's buffers and the
//! transmit path are collaborators: the interface reaches them through the
//! [iface::Transmit] and [iface::Application] traits.

extern crate alloc;

#[macro_use]
mod macros;

pub mod config;
pub mod iface;
pub mod socket;
pub mod storage;
pub mod time;
pub mod wire;
