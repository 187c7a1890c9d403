/*! Specialized containers.

The `storage` module provides the queues a connection keeps its segments in:
the out-of-sequence queue on the receive side, and the unsent and unacked
queues on the transmit side. Both are bounded and never reallocate their
spine; only segment payloads live on the heap.
*/

mod assembler;
mod tx_queue;

pub use self::assembler::{Assembler, OooSegment, TooManyHolesError};
pub use self::tx_queue::{TxQueue, TxSegment};

/// Indicates that a container is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl core::fmt::Display for Full {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "queue full")
    }
}

impl core::error::Error for Full {}
