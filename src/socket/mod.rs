/*! Connection state.

The `socket` module holds the per-connection protocol control block and the
state machine that advances it as segments arrive. Locating the connection a
segment belongs to, and owning the connections, is the job of
[crate::iface]; everything in here works on one connection at a time.
*/

use crate::time::Instant;

pub mod tcp;

/// Gives an indication on the next time the connection should be polled.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]

pub enum PollAt {
    /// The connection needs to be polled immediately.
    Now,
    /// The connection needs to be polled at given [Instant][struct.Instant].
    Time(Instant),
    /// The connection does not need to be polled unless there are external changes.
    Ingress,
}
