//! Datagram transports.
//!
//! The synchronizer only needs two operations: send one datagram, and wait a
//! bounded time for the next one. `udp` is the network implementation;
//! `memory` connects two contexts inside one process (tests, split-screen
//! viewers).

mod memory;
mod udp;

use std::io;
use std::time::Duration;

pub use memory::{MemoryTransport, channel};
pub use udp::UdpTransport;

/// A datagram link owned by one DGR context.
pub trait Transport {
    /// Sends one datagram. Fire-and-forget: success means the datagram left
    /// this process, nothing more.
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Receives one datagram into `buf`, waiting at most `wait`.
    ///
    /// A zero `wait` never blocks. Returns `Ok(None)` when nothing arrived in
    /// time. Datagrams larger than `buf` are truncated.
    fn recv(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>>;
}
