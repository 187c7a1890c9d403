// Heads up! Before working on this file you should read the parts of
// RFC 1122 that discuss TCP, and RFC 793 section 3.9 "Event Processing",
// which the dispatch below follows.

use core::fmt;

use managed::ManagedSlice;

use super::connection_set::{ConnectionSet, ConnectionStorage, ListenError, Lookup};
use super::{Handle, ListenHandle};
use crate::config::{TCP_LISTEN_BACKLOG, TCP_MAX_CONNECTION_COUNT, TCP_MSS};
use crate::socket::PollAt;
use crate::socket::tcp::{
    send_rst, CongestionControl, Connection, Incoming, RecvFlags, SendError, State,
};
use crate::time::Instant;
use crate::wire::{
    IpAddress, IpEndpoint, IpListenEndpoint, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber,
};

/// Configuration structure used for creating a TCP interface.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Random seed.
    ///
    /// It is strongly recommended that the random seed is different on each
    /// boot, to avoid problems with TCP initial sequence numbers.
    pub random_seed: u64,

    /// Upper bound on simultaneously open connections; SYNs beyond it are
    /// dropped.
    pub max_established: usize,

    /// Ceiling on the maximum segment size, both announced and accepted.
    pub mss: u16,

    /// MTU of the IP layer below, if known. Bounds the effective MSS.
    pub ip_mtu: Option<usize>,

    /// Congestion control for new connections.
    pub congestion_control: CongestionControl,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            random_seed: 0,
            max_established: TCP_MAX_CONNECTION_COUNT,
            mss: TCP_MSS,
            ip_mtu: None,
            congestion_control: CongestionControl::default(),
        }
    }
}

/// Protocol counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Segments received.
    pub recv: u64,
    /// Segments handed to the transmit collaborator.
    pub xmit: u64,
    /// Segments dropped.
    pub drop: u64,
    /// Segments with a bad length.
    pub lenerr: u64,
    /// Protocol errors.
    pub proterr: u64,
    /// Out of memory or connection slots.
    pub memerr: u64,
    /// Transmissions that failed.
    pub err: u64,
    /// RSTs sent.
    pub rst_sent: u64,
    /// Retransmission timeouts.
    pub rexmit: u64,
    /// Fast retransmits.
    pub fast_rexmit: u64,
}

/// The transmit path failed to take a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitError;

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transmit failed")
    }
}

impl core::error::Error for TransmitError {}

/// The transmit collaborator: computes the checksum, wraps the segment into
/// an IP packet and sends it.
pub trait Transmit {
    fn transmit(
        &mut self,
        src_addr: IpAddress,
        dst_addr: IpAddress,
        repr: &TcpRepr,
    ) -> Result<(), TransmitError>;
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer reset it.
    Reset,
    /// It closed while the application still expected to hear from it.
    Closed,
    /// It was aborted locally.
    Aborted,
    /// The peer stopped answering.
    TimedOut,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Reset => write!(f, "connection reset"),
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::Aborted => write!(f, "connection aborted"),
            ConnectionError::TimedOut => write!(f, "connection timed out"),
        }
    }
}

impl core::error::Error for ConnectionError {}

/// A notification to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// An active open completed.
    Connected,
    /// A passive open completed on `listener`.
    Accepted { listener: ListenHandle },
    /// In-sequence data arrived.
    Received(&'a [u8]),
    /// The peer acknowledged this many octets of our data.
    Sent(u16),
    /// The peer closed its sending side.
    Closed,
    /// The connection is gone; its handle is dead.
    Error(ConnectionError),
}

/// What the application makes of an event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    #[default]
    Ok,
    /// Not now; data is kept and offered again, an accept is turned down.
    Refuse,
    /// Tear the connection down right away.
    Abort,
}

/// The application collaborator.
///
/// It is called synchronously from within segment processing and cannot
/// reach back into the interface; anything it wants done to the connection
/// it asks for through the returned [Verdict].
pub trait Application {
    fn on_event(&mut self, handle: Handle, event: Event) -> Verdict;
}

/// What became of one incoming segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Malformed, misaddressed, or turned away for lack of resources.
    Dropped,
    /// Nothing is listening; answered with a RST unless it was one.
    Unmatched,
    /// Handled by a listener without opening a connection.
    Listen(ListenHandle),
    /// A listener took a SYN and opened this connection.
    Opened(Handle),
    Handled(Handle),
    /// Handled by, or moved into, TIME-WAIT.
    TimeWait(Handle),
    /// The connection completed its close and was freed.
    Closed(Handle),
    /// The peer reset the connection and it was freed.
    Reset(Handle),
    /// The connection was aborted and freed.
    Aborted(Handle),
}

/// Error returned by [Interface::connect].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum ConnectError {
    InvalidPort,
    Unaddressable,
    AddressInUse,
    TableFull,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidPort => write!(f, "invalid port"),
            ConnectError::Unaddressable => write!(f, "unaddressable destination"),
            ConnectError::AddressInUse => write!(f, "address in use"),
            ConnectError::TableFull => write!(f, "connection table full"),
        }
    }
}

impl core::error::Error for ConnectError {}

/// Everything processing one segment or one timer pass needs besides the
/// connection itself.
pub struct Context<'c> {
    pub(crate) now: Instant,
    pub(crate) config: &'c Config,
    pub(crate) stats: &'c mut Stats,
    pub(crate) tx: &'c mut dyn Transmit,
    pub(crate) app: &'c mut dyn Application,
}

impl Context<'_> {
    /// Hand a segment to the transmit collaborator. A failure is counted and
    /// otherwise left to retransmission.
    pub(crate) fn transmit(&mut self, src_addr: IpAddress, dst_addr: IpAddress, repr: &TcpRepr) {
        match self.tx.transmit(src_addr, dst_addr, repr) {
            Ok(()) => self.stats.xmit += 1,
            Err(err) => {
                net_debug!("iface: {} to {}: {}", repr, dst_addr, err);
                self.stats.err += 1;
            }
        }
    }
}

/// A TCP interface: the connection table together with the counters and the
/// run-time configuration.
#[derive(Debug)]
pub struct Interface<'a> {
    config: Config,
    stats: Stats,
    iss: u32,
    connections: ConnectionSet<'a>,
}

impl<'a> Interface<'a> {
    /// Create an interface using the provided connection storage.
    pub fn new<S>(config: Config, storage: S) -> Interface<'a>
    where
        S: Into<ManagedSlice<'a, ConnectionStorage>>,
    {
        Interface {
            iss: (config.random_seed ^ (config.random_seed >> 32)) as u32,
            config,
            stats: Stats::default(),
            connections: ConnectionSet::new(storage),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn connections(&self) -> &ConnectionSet<'a> {
        &self.connections
    }

    /// Get a connection by its handle.
    pub fn connection(&self, handle: Handle) -> Option<&Connection> {
        self.connections.get(handle)
    }

    /// Accept connections on `endpoint`, with room for `backlog` of them
    /// to be in the middle of their handshake at once.
    pub fn listen<T>(&mut self, endpoint: T, backlog: u8) -> Result<ListenHandle, ListenError>
    where
        T: Into<IpListenEndpoint>,
    {
        let backlog = if backlog == 0 {
            TCP_LISTEN_BACKLOG
        } else {
            backlog
        };
        self.connections.add_listener(endpoint.into(), backlog)
    }

    /// Stop listening. Returns whether the listener existed.
    pub fn unlisten(&mut self, handle: ListenHandle) -> bool {
        self.connections.remove_listener(handle)
    }

    /// Open a connection to `remote`.
    pub fn connect(
        &mut self,
        now: Instant,
        local: IpEndpoint,
        remote: IpEndpoint,
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
    ) -> Result<Handle, ConnectError> {
        if local.port == 0 || remote.port == 0 {
            return Err(ConnectError::InvalidPort);
        }
        if remote.addr.is_unspecified()
            || remote.addr.is_multicast()
            || remote.addr.is_broadcast()
        {
            return Err(ConnectError::Unaddressable);
        }
        match self.connections.demux(&local, &remote) {
            Lookup::Active(_) | Lookup::TimeWait(_) => return Err(ConnectError::AddressInUse),
            Lookup::Listen(_) | Lookup::Unmatched => (),
        }

        let iss = self.next_iss(now);
        let Interface {
            config,
            stats,
            connections,
            ..
        } = self;
        let mut cx = Context {
            now,
            config,
            stats,
            tx,
            app,
        };

        let mut connection = Connection::new(cx.config, local, remote, iss, now);
        connection
            .open_active(&mut cx)
            .map_err(|_| ConnectError::TableFull)?;
        let handle = connections
            .add(connection)
            .map_err(|_| ConnectError::TableFull)?;
        if let Some(connection) = connections.get_mut(handle) {
            connection.output(&mut cx);
        }
        Ok(handle)
    }

    /// Queue data on a connection and send what the windows allow.
    pub fn send(
        &mut self,
        now: Instant,
        handle: Handle,
        data: &[u8],
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
    ) -> Result<usize, SendError> {
        self.with_connection(now, handle, tx, app, |connection, cx| {
            let len = connection.send(data)?;
            connection.output(cx);
            Ok(len)
        })
        .unwrap_or(Err(SendError::InvalidState))
    }

    /// Close a connection from our side.
    pub fn close(
        &mut self,
        now: Instant,
        handle: Handle,
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
    ) -> Result<(), SendError> {
        let result = self
            .with_connection(now, handle, tx, app, |connection, cx| {
                connection.close(cx)?;
                connection.output(cx);
                Ok(connection.state())
            })
            .unwrap_or(Err(SendError::InvalidState))?;
        if result == State::Closed {
            self.connections.remove(handle);
        }
        Ok(())
    }

    /// Stop receiving on a connection. Data that arrives afterwards resets it.
    pub fn shutdown_rx(&mut self, handle: Handle) -> Result<(), SendError> {
        let connection = self
            .connections
            .get_mut(handle)
            .ok_or(SendError::InvalidState)?;
        connection.shutdown_rx();
        Ok(())
    }

    /// The application took `len` octets of received data.
    pub fn recved(
        &mut self,
        now: Instant,
        handle: Handle,
        len: u16,
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
    ) {
        self.with_connection(now, handle, tx, app, |connection, cx| {
            connection.recved(cx, len)
        });
    }

    /// Reset a connection and free it. The application hears of it as
    /// [ConnectionError::Aborted].
    pub fn abort(
        &mut self,
        now: Instant,
        handle: Handle,
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
    ) -> bool {
        let aborted = self
            .with_connection(now, handle, tx, app, |connection, cx| connection.abort(cx))
            .is_some();
        if aborted {
            self.connections.remove(handle);
        }
        aborted
    }

    /// Fire expired timers: retransmissions, delayed acknowledgements,
    /// stuck-state timeouts and the end of TIME-WAIT.
    pub fn poll(&mut self, now: Instant, tx: &mut dyn Transmit, app: &mut dyn Application) {
        let Interface {
            config,
            stats,
            connections,
            ..
        } = self;
        let mut cx = Context {
            now,
            config,
            stats,
            tx,
            app,
        };

        for handle in connections.active_handles() {
            let Some(connection) = connections.get_mut(handle) else {
                continue;
            };
            if connection.poll(&mut cx).is_err() {
                connections.remove(handle);
            }
        }

        for handle in connections.time_wait_handles() {
            if connections
                .get(handle)
                .is_some_and(|connection| connection.should_close(now))
            {
                net_trace!("iface: {} leaves TIME-WAIT", handle);
                connections.remove(handle);
            }
        }
    }

    /// Return when [Interface::poll] should be called next.
    pub fn poll_at(&self) -> PollAt {
        self.connections
            .iter()
            .map(|connection| connection.poll_at())
            .min()
            .unwrap_or(PollAt::Ingress)
    }

    /// Process one incoming TCP segment.
    ///
    /// `segment` is the IP payload, header included, with the checksum
    /// already verified; `src_addr` and `dst_addr` come from the IP header.
    pub fn process_tcp(
        &mut self,
        now: Instant,
        src_addr: IpAddress,
        dst_addr: IpAddress,
        segment: &[u8],
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
    ) -> Processed {
        self.stats.recv += 1;

        if dst_addr.is_multicast() || dst_addr.is_broadcast() {
            net_debug!("iface: TCP segment to {} dropped", dst_addr);
            self.stats.proterr += 1;
            self.stats.drop += 1;
            return Processed::Dropped;
        }

        let repr = match TcpPacket::new_checked(segment).and_then(|p| TcpRepr::parse(&p)) {
            Ok(repr) => repr,
            Err(err) => {
                net_debug!("iface: short TCP segment from {}: {}", src_addr, err);
                self.stats.lenerr += 1;
                self.stats.drop += 1;
                return Processed::Dropped;
            }
        };
        net_trace!("iface: {} <- {}: {}", dst_addr, src_addr, repr);

        let local = IpEndpoint::new(dst_addr, repr.dst_port);
        let remote = IpEndpoint::new(src_addr, repr.src_port);
        let lookup = self.connections.demux(&local, &remote);
        let iss = match lookup {
            Lookup::Listen(_) => Some(self.next_iss(now)),
            _ => None,
        };

        let Interface {
            config,
            stats,
            connections,
            ..
        } = self;
        let mut cx = Context {
            now,
            config,
            stats,
            tx,
            app,
        };
        let mut seg = Incoming::new(local, remote, repr);

        match lookup {
            Lookup::Active(handle) => process_active(connections, &mut cx, handle, &mut seg),
            Lookup::TimeWait(handle) => {
                if let Some(connection) = connections.get_mut(handle) {
                    connection.process_time_wait(&mut cx, &seg);
                }
                Processed::TimeWait(handle)
            }
            Lookup::Listen(listener) => match iss {
                Some(iss) => process_listen(connections, &mut cx, listener, iss, &seg),
                None => Processed::Dropped,
            },
            Lookup::Unmatched => {
                net_debug!("iface: no connection for {} -> {}", remote, local);
                if !seg.repr.flags.contains(TcpFlags::RST) {
                    send_rst(
                        &mut cx,
                        &local,
                        &remote,
                        seg.repr.ack_number,
                        seg.repr.seq_number + seg.tcplen(),
                    );
                }
                cx.stats.proterr += 1;
                cx.stats.drop += 1;
                Processed::Unmatched
            }
        }
    }

    /// Pick the initial send sequence number of a new connection.
    fn next_iss(&mut self, now: Instant) -> TcpSeqNumber {
        self.iss = self.iss.wrapping_add(now.ticks());
        TcpSeqNumber(self.iss as i32)
    }

    fn with_connection<R>(
        &mut self,
        now: Instant,
        handle: Handle,
        tx: &mut dyn Transmit,
        app: &mut dyn Application,
        f: impl FnOnce(&mut Connection, &mut Context) -> R,
    ) -> Option<R> {
        let Interface {
            config,
            stats,
            connections,
            ..
        } = self;
        let connection = connections.get_mut(handle)?;
        let mut cx = Context {
            now,
            config,
            stats,
            tx,
            app,
        };
        Some(f(connection, &mut cx))
    }
}

/// Run a segment through an active connection, then act on the outcome:
/// release it if it was reset, aborted or closed, tell the application what
/// arrived, send what is due, and move it to TIME-WAIT if it got there.
fn process_active(
    connections: &mut ConnectionSet,
    cx: &mut Context,
    handle: Handle,
    seg: &mut Incoming,
) -> Processed {
    let Some(connection) = connections.get_mut(handle) else {
        return Processed::Dropped;
    };

    match connection.redeliver_refused(cx) {
        Err(_) => {
            connections.remove(handle);
            return Processed::Aborted(handle);
        }
        Ok(true) if seg.tcplen() > 0 => {
            net_debug!("iface: {} still holds refused data, dropping segment", handle);
            cx.stats.drop += 1;
            return Processed::Dropped;
        }
        Ok(_) => (),
    }

    if connection.process(cx, seg).is_err() {
        connections.remove(handle);
        return Processed::Aborted(handle);
    }

    if seg.recv_flags.contains(RecvFlags::RESET) {
        cx.app
            .on_event(handle, Event::Error(ConnectionError::Reset));
        connections.remove(handle);
        return Processed::Reset(handle);
    }

    if connection.deliver(cx, seg).is_err() {
        connections.remove(handle);
        return Processed::Aborted(handle);
    }

    if seg.recv_flags.contains(RecvFlags::CLOSED) {
        if !connection.is_rx_closed() {
            cx.app
                .on_event(handle, Event::Error(ConnectionError::Closed));
        }
        connections.remove(handle);
        return Processed::Closed(handle);
    }

    connection.output(cx);

    let state = connection.state();
    connections.settle_backlog(handle);
    if state == State::TimeWait {
        connections.move_to_time_wait(handle);
        return Processed::TimeWait(handle);
    }
    Processed::Handled(handle)
}

/// Handle a segment addressed to a listener: a SYN opens a connection in
/// SYN-RECEIVED, a stray ACK is answered with a RST.
fn process_listen(
    connections: &mut ConnectionSet,
    cx: &mut Context,
    listener: ListenHandle,
    iss: TcpSeqNumber,
    seg: &Incoming,
) -> Processed {
    let flags = seg.repr.flags;
    if flags.contains(TcpFlags::RST) {
        return Processed::Listen(listener);
    }
    if flags.contains(TcpFlags::ACK) {
        net_debug!("iface: ACK without connection from {}, resetting", seg.remote);
        send_rst(
            cx,
            &seg.local,
            &seg.remote,
            seg.repr.ack_number,
            seg.repr.seq_number + seg.tcplen(),
        );
        return Processed::Listen(listener);
    }
    if !flags.contains(TcpFlags::SYN) {
        return Processed::Listen(listener);
    }

    let Some(entry) = connections.listener(listener) else {
        return Processed::Dropped;
    };
    if entry.accepts_pending >= entry.backlog {
        net_debug!("iface: backlog of {} full, dropping SYN from {}", listener, seg.remote);
        cx.stats.drop += 1;
        return Processed::Dropped;
    }
    if connections.active_count() >= cx.config.max_established {
        net_debug!("iface: too many connections, dropping SYN from {}", seg.remote);
        cx.stats.memerr += 1;
        cx.stats.drop += 1;
        return Processed::Dropped;
    }

    let mut connection = Connection::new(cx.config, seg.local, seg.remote, iss, cx.now);
    if let Err(err) = connection.open_passive(cx, listener, seg) {
        net_debug!("iface: cannot answer SYN from {}: {}", seg.remote, err);
        cx.stats.memerr += 1;
        cx.stats.drop += 1;
        return Processed::Dropped;
    }
    let handle = match connections.add(connection) {
        Ok(handle) => handle,
        Err(_) => {
            net_debug!("iface: no free slot for {}", seg.remote);
            cx.stats.memerr += 1;
            cx.stats.drop += 1;
            return Processed::Dropped;
        }
    };
    net_debug!("iface: {} opened {} from {}", listener, handle, seg.remote);
    if let Some(connection) = connections.get_mut(handle) {
        connection.output(cx);
    }
    Processed::Opened(handle)
}
