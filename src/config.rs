//! Compile-time sizing of the stack.
//!
//! Everything here is a capacity or a protocol constant; values that an
//! embedding may want to change at run time live in [crate::iface::Config].

/// Largest segment size this host is willing to receive; also the ceiling
/// applied to a peer's MSS option.
pub const TCP_MSS: u16 = 1460;

/// MSS assumed for a peer that does not announce one (RFC 1122).
pub const TCP_DEFAULT_MSS: u16 = 536;

/// Receive window of a fresh connection, in octets.
pub const TCP_WND: u16 = 4 * TCP_MSS;

/// Send buffer of a fresh connection, in octets.
pub const TCP_SND_BUF: u16 = 2 * TCP_MSS;

/// Reopening the window by at least this much triggers an immediate window update.
pub const TCP_WND_UPDATE_THRESHOLD: u16 = TCP_WND / 4;

/// Capacity of each of the unsent and unacked queues, in segments.
pub const TCP_TX_QUEUE_LEN: usize = 8;

/// Capacity of the out-of-sequence queue, in segments.
pub const ASSEMBLER_MAX_SEGMENT_COUNT: usize = 8;

/// Number of listening endpoints.
pub const TCP_MAX_LISTENER_COUNT: usize = 4;

/// Number of connections tracked in the active and TIME-WAIT collections.
pub const TCP_MAX_CONNECTION_COUNT: usize = 16;

/// Default limit of handshakes pending on one listener.
pub const TCP_LISTEN_BACKLOG: u8 = 4;

/// Length of one coarse timer tick.
pub const TCP_TICK_MILLIS: u32 = 500;

/// Maximum segment lifetime.
pub const TCP_MSL_MILLIS: u32 = 60_000;

/// Time a connection lingers in TIME-WAIT, in ticks.
pub const TCP_TIME_WAIT_TIMEOUT: u32 = 2 * TCP_MSL_MILLIS / TCP_TICK_MILLIS;

/// Retransmissions of a data segment before the connection is given up.
pub const TCP_MAX_RTX: u8 = 12;

/// Retransmissions of an initial SYN before the connection is given up.
pub const TCP_SYN_MAX_RTX: u8 = 6;

/// A connection stuck in SYN-RECEIVED for longer than this is dropped.
pub const TCP_SYN_RCVD_TIMEOUT_MILLIS: u32 = 20_000;

/// A connection stuck in FIN-WAIT-2 for longer than this is dropped.
pub const TCP_FIN_WAIT_TIMEOUT_MILLIS: u32 = 20_000;

/// Out-of-sequence data is discarded after this many retransmission
/// timeouts without any activity on the connection.
pub const TCP_OOSEQ_TIMEOUT: u32 = 6;
