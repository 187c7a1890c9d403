// Heads up! Before working on this file you should read, at least, RFC 793 and
// the parts of RFC 1122 that discuss TCP, as well as RFC 5681 for congestion
// control and RFC 7323 for the timestamp option.

use alloc::vec::Vec;
use core::fmt::{self, Display};

use crate::config::{
    TCP_DEFAULT_MSS, TCP_FIN_WAIT_TIMEOUT_MILLIS, TCP_MAX_RTX, TCP_MSL_MILLIS, TCP_OOSEQ_TIMEOUT,
    TCP_SND_BUF, TCP_SYN_MAX_RTX, TCP_SYN_RCVD_TIMEOUT_MILLIS, TCP_TIME_WAIT_TIMEOUT,
    TCP_TX_QUEUE_LEN, TCP_WND, TCP_WND_UPDATE_THRESHOLD,
};
use crate::iface::{Config, ConnectionError, Context, Event, Handle, ListenHandle, Verdict};
use crate::socket::PollAt;
use crate::storage::{Assembler, TxQueue, TxSegment};
use crate::time::{Duration, Instant};
use crate::wire::{
    IpAddress, IpEndpoint, TcpFlags, TcpRepr, TcpSeqNumber, TcpTimestampRepr, TCP_HEADER_LEN,
};

macro_rules! tcp_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

mod congestion;
mod receive;

/// Error returned when queueing data or control for transmission fails.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]

pub enum SendError {
    InvalidState,
    BufferFull,
}

impl Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::InvalidState => write!(f, "invalid state"),
            SendError::BufferFull => write!(f, "buffer full"),
        }
    }
}

impl core::error::Error for SendError {}

/// The connection was torn down while handling an event, and its slot must be
/// released by the caller without touching the connection again.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct Aborted;

/// The state of a TCP connection, according to [RFC 793].
///
/// [RFC 793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]

pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            State::Closed => write!(f, "CLOSED"),
            State::Listen => write!(f, "LISTEN"),
            State::SynSent => write!(f, "SYN-SENT"),
            State::SynReceived => write!(f, "SYN-RECEIVED"),
            State::Established => write!(f, "ESTABLISHED"),
            State::FinWait1 => write!(f, "FIN-WAIT-1"),
            State::FinWait2 => write!(f, "FIN-WAIT-2"),
            State::CloseWait => write!(f, "CLOSE-WAIT"),
            State::Closing => write!(f, "CLOSING"),
            State::LastAck => write!(f, "LAST-ACK"),
            State::TimeWait => write!(f, "TIME-WAIT"),
        }
    }
}

/// Congestion control algorithm.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]

pub enum CongestionControl {
    None,
    #[default]
    Reno,
}

/// Until a round-trip time measurement has been made, retransmit after one second.
const RTTE_INITIAL_RTO: i16 = (1000 / crate::config::TCP_TICK_MILLIS) as i16;

/// Exponent of the backoff applied on the n-th retransmission.
const RTTE_BACKOFF: [u8; 13] = [1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7];

/// Jacobson's round-trip estimator, in coarse ticks.
///
/// At most one segment is timed at a time, and a sample is abandoned when
/// anything is retransmitted (Karn's algorithm).
#[derive(Debug, Clone, Copy)]
struct RttEstimator {
    /// Smoothed round-trip time, scaled by 8.
    sa: i16,
    /// Mean deviation, scaled by 4.
    sv: i16,
    /// Retransmission timeout, in ticks.
    rto: i16,
    timestamp: Option<(Instant, TcpSeqNumber)>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            sa: 0,
            sv: RTTE_INITIAL_RTO,
            rto: RTTE_INITIAL_RTO,
            timestamp: None,
        }
    }
}

impl RttEstimator {
    fn retransmission_timeout(&self) -> Duration {
        Duration::from_ticks(self.rto.max(1) as u32)
    }

    fn sample(&mut self, new_rtt: i16) {
        let mut m = new_rtt.wrapping_sub(self.sa >> 3);
        self.sa = self.sa.wrapping_add(m);
        m = m.wrapping_abs();
        m = m.wrapping_sub(self.sv >> 2);
        self.sv = self.sv.wrapping_add(m);
        self.reset_rto();

        tcp_trace!(
            "rtte: sample={} sa={} sv={} rto={}",
            new_rtt,
            self.sa,
            self.sv,
            self.rto
        );
    }

    fn on_send(&mut self, timestamp: Instant, seq: TcpSeqNumber) {
        if self.timestamp.is_none() {
            self.timestamp = Some((timestamp, seq));
            tcp_trace!("rtte: sampling at seq={}", seq);
        }
    }

    fn on_ack(&mut self, timestamp: Instant, ack: TcpSeqNumber) {
        if let Some((sent_timestamp, sent_seq)) = self.timestamp {
            if sent_seq < ack {
                self.sample((timestamp - sent_timestamp).ticks() as i16);
                self.timestamp = None;
            }
        }
    }

    fn on_retransmit(&mut self) {
        if self.timestamp.take().is_some() {
            tcp_trace!("rtte: abort sampling due to retransmit");
        }
    }

    /// Recompute the timeout from the estimators, dropping any backoff.
    fn reset_rto(&mut self) {
        self.rto = (self.sa >> 3).wrapping_add(self.sv);
    }

    /// Back the timeout off ahead of the retransmission numbered `nrtx`.
    fn backoff(&mut self, nrtx: u8) {
        let shift = RTTE_BACKOFF[(nrtx as usize).min(RTTE_BACKOFF.len() - 1)];
        let base = (self.sa >> 3) as i32 + self.sv as i32;
        self.rto = (base << shift).clamp(1, i16::MAX as i32) as i16;
        tcp_trace!("rtte: backing off rto to {}", self.rto);
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Timer {
    Idle,
    Retransmit { expires_at: Instant },
    Close { expires_at: Instant },
}

const CLOSE_DELAY: Duration = Duration::from_ticks(TCP_TIME_WAIT_TIMEOUT);

impl Timer {
    fn should_retransmit(&self, timestamp: Instant) -> bool {
        match *self {
            Timer::Retransmit { expires_at } if timestamp >= expires_at => true,
            _ => false,
        }
    }

    fn should_close(&self, timestamp: Instant) -> bool {
        match *self {
            Timer::Close { expires_at } if timestamp >= expires_at => true,
            _ => false,
        }
    }

    fn poll_at(&self) -> PollAt {
        match *self {
            Timer::Idle => PollAt::Ingress,
            Timer::Retransmit { expires_at } => PollAt::Time(expires_at),
            Timer::Close { expires_at } => PollAt::Time(expires_at),
        }
    }

    fn set_for_idle(&mut self) {
        if let Timer::Retransmit { .. } = *self {
            *self = Timer::Idle
        }
    }

    fn set_for_retransmit(&mut self, timestamp: Instant, delay: Duration) {
        match *self {
            Timer::Idle | Timer::Retransmit { .. } => {
                *self = Timer::Retransmit {
                    expires_at: timestamp + delay,
                }
            }
            Timer::Close { .. } => (),
        }
    }

    fn set_for_close(&mut self, timestamp: Instant) {
        *self = Timer::Close {
            expires_at: timestamp + CLOSE_DELAY,
        }
    }

    fn is_retransmit(&self) -> bool {
        matches!(*self, Timer::Retransmit { .. })
    }
}

bitflags::bitflags! {
    /// Sticky per-connection flags.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub(crate) struct ConnFlags: u8 {
        /// An acknowledgement is owed and may wait for the next timer pass.
        const ACK_DELAY = 0x01;
        /// An acknowledgement is owed and goes out with the next output.
        const ACK_NOW = 0x02;
        const IN_FAST_RECOVERY = 0x04;
        /// The peer offered timestamps on its SYN.
        const TIMESTAMP = 0x08;
        /// The application will not read anything more.
        const RX_CLOSED = 0x10;
    }
}

bitflags::bitflags! {
    /// Outcome of processing one segment, acted upon once the state machine
    /// is done with it.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub(crate) struct RecvFlags: u8 {
        /// An acceptable RST arrived.
        const RESET = 0x01;
        /// Our FIN was acknowledged in LAST-ACK.
        const CLOSED = 0x02;
        /// The peer's FIN is now in sequence.
        const GOT_FIN = 0x04;
    }
}

/// A segment on its way through the state machine, together with what its
/// processing produced for the application.
///
/// The header in `repr` is trimmed in place as the segment is admitted, so
/// after processing its sequence number, flags and payload describe only what
/// was actually taken in.
#[derive(Debug)]
pub(crate) struct Incoming<'a> {
    pub local: IpEndpoint,
    pub remote: IpEndpoint,
    pub repr: TcpRepr<'a>,
    pub recv_flags: RecvFlags,
    pub recv_data: Option<Vec<u8>>,
    pub acked: u16,
}

impl<'a> Incoming<'a> {
    pub fn new(local: IpEndpoint, remote: IpEndpoint, repr: TcpRepr<'a>) -> Incoming<'a> {
        Incoming {
            local,
            remote,
            repr,
            recv_flags: RecvFlags::empty(),
            recv_data: None,
            acked: 0,
        }
    }

    /// Length in sequence space: payload plus one for each of SYN and FIN.
    pub fn tcplen(&self) -> usize {
        self.repr.segment_len()
    }
}

/// Whether `seq` lies within `[start, end]`.
fn seq_between(seq: TcpSeqNumber, start: TcpSeqNumber, end: TcpSeqNumber) -> bool {
    start <= seq && seq <= end
}

/// Cap `mss` by what fits into one IP packet towards `remote`.
fn effective_mss(config: &Config, mss: u16, remote: &IpAddress) -> u16 {
    let Some(mtu) = config.ip_mtu else {
        return mss;
    };
    let ip_header_len = match remote {
        IpAddress::Ipv4(_) => 20,
        IpAddress::Ipv6(_) => 40,
    };
    let room = mtu.saturating_sub(ip_header_len + TCP_HEADER_LEN);
    mss.min(room.min(u16::MAX as usize) as u16).max(1)
}

/// Send a RST|ACK that is not tied to any connection.
pub(crate) fn send_rst(
    cx: &mut Context,
    local: &IpEndpoint,
    remote: &IpEndpoint,
    seq: TcpSeqNumber,
    ack: TcpSeqNumber,
) {
    let repr = TcpRepr {
        src_port: local.port,
        dst_port: remote.port,
        flags: TcpFlags::RST | TcpFlags::ACK,
        seq_number: seq,
        ack_number: ack,
        window_len: TCP_WND,
        max_seg_size: None,
        timestamp: None,
        payload: &[],
    };
    net_debug!("{}->{}: sending RST seq={} ack={}", local, remote, seq, ack);
    cx.stats.rst_sent += 1;
    cx.transmit(local.addr, remote.addr, &repr);
}

/// A TCP connection control block.
///
/// Everything the protocol remembers about one connection lives here: its
/// identity, the sequence space bookkeeping of both directions, congestion
/// and round-trip state, and the three segment queues. Connections are owned
/// by [crate::iface::ConnectionSet] and driven through
/// [crate::iface::Interface].
#[derive(Debug)]
pub struct Connection {
    handle: Handle,
    state: State,
    /// The listener that spawned this connection, if it was opened passively.
    listener: Option<ListenHandle>,
    /// Whether the connection still counts against its listener's backlog.
    backlog_pending: bool,
    local: IpEndpoint,
    remote: IpEndpoint,
    flags: ConnFlags,
    timer: Timer,
    last_activity: Instant,

    /// Next sequence number expected from the peer.
    rcv_nxt: TcpSeqNumber,
    rcv_wnd: u16,
    /// Window announced in the last segment sent.
    rcv_ann_wnd: u16,
    rcv_ann_right_edge: TcpSeqNumber,

    /// Next sequence number to send.
    snd_nxt: TcpSeqNumber,
    /// Highest acknowledged sequence number.
    lastack: TcpSeqNumber,
    /// Sequence number of the next byte to be queued.
    snd_lbb: TcpSeqNumber,
    snd_wnd: u16,
    /// Sequence and acknowledgement numbers of the last window update.
    snd_wl1: TcpSeqNumber,
    snd_wl2: TcpSeqNumber,
    /// Free space in the send buffer.
    snd_buf: u16,
    mss: u16,

    rtte: RttEstimator,
    nrtx: u8,
    dupacks: u8,
    congestion_controller: congestion::AnyController,

    unsent: TxQueue,
    unacked: TxQueue,
    ooseq: Assembler,
    /// Data the application declined to take; offered again later.
    refused_data: Option<Vec<u8>>,
    /// The peer's FIN arrived behind the refused data.
    refused_fin: bool,

    ts_recent: u32,
    ts_lastacksent: TcpSeqNumber,
}

impl Connection {
    /// Create a closed connection between two endpoints, with `iss` as the
    /// initial send sequence number.
    pub(crate) fn new(
        config: &Config,
        local: IpEndpoint,
        remote: IpEndpoint,
        iss: TcpSeqNumber,
        now: Instant,
    ) -> Connection {
        let mut connection = Connection {
            handle: Handle::default(),
            state: State::Closed,
            listener: None,
            backlog_pending: false,
            local,
            remote,
            flags: ConnFlags::empty(),
            timer: Timer::Idle,
            last_activity: now,

            rcv_nxt: TcpSeqNumber::default(),
            rcv_wnd: TCP_WND,
            rcv_ann_wnd: TCP_WND,
            rcv_ann_right_edge: TcpSeqNumber::default(),

            snd_nxt: iss,
            lastack: iss,
            snd_lbb: iss,
            snd_wnd: TCP_WND,
            snd_wl1: TcpSeqNumber::default(),
            snd_wl2: iss,
            snd_buf: TCP_SND_BUF,
            mss: TCP_DEFAULT_MSS.min(config.mss),

            rtte: RttEstimator::default(),
            nrtx: 0,
            dupacks: 0,
            congestion_controller: congestion::AnyController::new(),

            unsent: TxQueue::new(),
            unacked: TxQueue::new(),
            ooseq: Assembler::new(),
            refused_data: None,
            refused_fin: false,

            ts_recent: 0,
            ts_lastacksent: TcpSeqNumber::default(),
        };
        connection.set_congestion_control(config.congestion_control);
        connection
    }

    /// Return the handle this connection is registered under.
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: Handle) {
        self.handle = handle;
    }

    /// Return the connection state, in terms of the TCP state machine.
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn local_endpoint(&self) -> IpEndpoint {
        self.local
    }

    #[inline]
    pub fn remote_endpoint(&self) -> IpEndpoint {
        self.remote
    }

    /// Return the listener this connection was accepted on, if any.
    #[inline]
    pub fn listener(&self) -> Option<ListenHandle> {
        self.listener
    }

    /// Release the connection's claim on its listener's backlog, once.
    ///
    /// Returns the listener to credit if the claim was still held.
    pub(crate) fn take_backlog(&mut self) -> Option<ListenHandle> {
        if self.backlog_pending {
            self.backlog_pending = false;
            self.listener
        } else {
            None
        }
    }

    pub(crate) fn is_backlog_pending(&self) -> bool {
        self.backlog_pending
    }

    /// Forget the listener, which stopped listening before this connection
    /// was accepted.
    pub(crate) fn detach_listener(&mut self) {
        self.listener = None;
        self.backlog_pending = false;
    }

    /// Return the effective maximum segment size towards the peer.
    #[inline]
    pub fn mss(&self) -> u16 {
        self.mss
    }

    /// Return the next sequence number expected from the peer.
    #[inline]
    pub fn rcv_nxt(&self) -> TcpSeqNumber {
        self.rcv_nxt
    }

    #[inline]
    pub fn rcv_wnd(&self) -> u16 {
        self.rcv_wnd
    }

    /// Return the window announced to the peer.
    #[inline]
    pub fn rcv_ann_wnd(&self) -> u16 {
        self.rcv_ann_wnd
    }

    #[inline]
    pub fn snd_nxt(&self) -> TcpSeqNumber {
        self.snd_nxt
    }

    /// Return the highest sequence number acknowledged by the peer.
    #[inline]
    pub fn lastack(&self) -> TcpSeqNumber {
        self.lastack
    }

    #[inline]
    pub fn snd_wnd(&self) -> u16 {
        self.snd_wnd
    }

    /// Return the free space in the send buffer.
    #[inline]
    pub fn snd_buf(&self) -> u16 {
        self.snd_buf
    }

    /// Return the congestion window, in octets.
    pub fn cwnd(&self) -> usize {
        self.congestion_controller.inner().window()
    }

    /// Return the slow start threshold, in octets.
    pub fn ssthresh(&self) -> usize {
        self.congestion_controller.inner().ssthresh()
    }

    #[inline]
    pub fn dupacks(&self) -> u8 {
        self.dupacks
    }

    /// Return the number of retransmissions since the last acknowledgement
    /// that advanced the window.
    #[inline]
    pub fn nrtx(&self) -> u8 {
        self.nrtx
    }

    /// Return the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rtte.retransmission_timeout()
    }

    pub fn is_in_fast_recovery(&self) -> bool {
        self.flags.contains(ConnFlags::IN_FAST_RECOVERY)
    }

    /// Whether the peer's timestamps are echoed on every segment.
    pub fn timestamps_enabled(&self) -> bool {
        self.flags.contains(ConnFlags::TIMESTAMP)
    }

    /// Whether the application has shut down the receive half.
    pub fn is_rx_closed(&self) -> bool {
        self.flags.contains(ConnFlags::RX_CLOSED)
    }

    /// Whether the retransmission timer is running.
    pub fn is_retransmit_pending(&self) -> bool {
        self.timer.is_retransmit()
    }

    /// Return the segments queued for transmission.
    pub fn unsent(&self) -> &TxQueue {
        &self.unsent
    }

    /// Return the segments sent but not yet acknowledged.
    pub fn unacked(&self) -> &TxQueue {
        &self.unacked
    }

    /// Return the data received ahead of `rcv_nxt`.
    pub fn ooseq(&self) -> &Assembler {
        &self.ooseq
    }

    pub fn has_refused_data(&self) -> bool {
        self.refused_data.is_some()
    }

    /// Set the congestion control algorithm; only takes effect before the
    /// connection is opened.
    pub fn set_congestion_control(&mut self, congestion_control: CongestionControl) {
        use congestion::*;

        if self.state != State::Closed {
            return;
        }
        self.congestion_controller = match congestion_control {
            CongestionControl::None => AnyController::None(no_control::NoControl),
            CongestionControl::Reno => AnyController::Reno(reno::Reno::new()),
        }
    }

    /// Return the congestion control algorithm in use.
    pub fn congestion_control(&self) -> CongestionControl {
        use congestion::*;

        match self.congestion_controller {
            AnyController::None(_) => CongestionControl::None,
            AnyController::Reno(_) => CongestionControl::Reno,
        }
    }

    /// Return when the connection wants to be polled next.
    pub fn poll_at(&self) -> PollAt {
        if self
            .flags
            .intersects(ConnFlags::ACK_DELAY | ConnFlags::ACK_NOW)
        {
            return PollAt::Now;
        }
        let timer = self.timer.poll_at();
        match self.state_timeout() {
            Some(timeout) => timer.min(PollAt::Time(self.last_activity + timeout)),
            None => timer,
        }
    }

    /// Whether the TIME-WAIT period is over and the connection can go.
    pub(crate) fn should_close(&self, timestamp: Instant) -> bool {
        self.state == State::TimeWait && self.timer.should_close(timestamp)
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tcp_trace!("{}: state={}=>{}", self, self.state, state);
        }

        self.state = state;
    }

    fn enter_time_wait(&mut self, timestamp: Instant) {
        self.set_state(State::TimeWait);
        self.timer.set_for_close(timestamp);
    }

    /// How long the connection may sit idle in its current state.
    fn state_timeout(&self) -> Option<Duration> {
        let millis = match self.state {
            State::SynReceived => TCP_SYN_RCVD_TIMEOUT_MILLIS,
            State::FinWait2 => TCP_FIN_WAIT_TIMEOUT_MILLIS,
            State::LastAck => 2 * TCP_MSL_MILLIS,
            _ => return None,
        };
        Some(Duration::from_millis(millis as u64))
    }

    fn max_rtx(&self) -> u8 {
        if self.state == State::SynSent {
            TCP_SYN_MAX_RTX
        } else {
            TCP_MAX_RTX
        }
    }

    /// Owe the peer an acknowledgement, sent with the next output.
    fn ack_now(&mut self) {
        self.flags.insert(ConnFlags::ACK_NOW);
    }

    /// Owe the peer an acknowledgement; a second one owed before the first
    /// went out is sent right away.
    fn ack(&mut self) {
        if self.flags.contains(ConnFlags::ACK_DELAY) {
            self.flags.remove(ConnFlags::ACK_DELAY);
            self.flags.insert(ConnFlags::ACK_NOW);
        } else {
            self.flags.insert(ConnFlags::ACK_DELAY);
        }
    }

    /// Decide what window to announce, avoiding silly window syndrome:
    /// the right edge only moves once it can move by a useful amount.
    ///
    /// Returns how far the announced right edge moved.
    fn update_rcv_ann_wnd(&mut self) -> u32 {
        let new_right_edge = self.rcv_nxt + self.rcv_wnd as usize;
        let threshold = (TCP_WND / 2).min(self.mss) as usize;
        if new_right_edge >= self.rcv_ann_right_edge + threshold {
            self.rcv_ann_wnd = self.rcv_wnd;
            new_right_edge.offset_from(self.rcv_ann_right_edge) as u32
        } else {
            self.rcv_ann_wnd = if self.rcv_nxt > self.rcv_ann_right_edge {
                0
            } else {
                (self.rcv_ann_right_edge - self.rcv_nxt) as u16
            };
            0
        }
    }

    /// Take the MSS and timestamp options of an incoming segment into account.
    fn apply_options(&mut self, cx: &Context, seg: &Incoming) {
        let repr = &seg.repr;
        // MSS is only negotiated on SYN segments.
        if let (Some(mss), true) = (repr.max_seg_size, repr.flags.contains(TcpFlags::SYN)) {
            let ceiling = cx.config.mss;
            let mss = if mss == 0 || mss > ceiling {
                ceiling
            } else {
                mss
            };
            self.mss = effective_mss(cx.config, mss, &self.remote.addr);
        }
        if let Some(timestamp) = repr.timestamp {
            if repr.flags.contains(TcpFlags::SYN) {
                self.ts_recent = timestamp.tsval;
                self.flags.insert(ConnFlags::TIMESTAMP);
            } else if seq_between(
                self.ts_lastacksent,
                repr.seq_number,
                repr.seq_number + seg.tcplen(),
            ) {
                self.ts_recent = timestamp.tsval;
            }
        }
    }

    /// Queue a segment at the end of the send sequence space.
    fn enqueue(
        &mut self,
        flags: TcpFlags,
        payload: &[u8],
        max_seg_size: Option<u16>,
    ) -> Result<(), SendError> {
        if self.unsent.len() + self.unacked.len() >= TCP_TX_QUEUE_LEN {
            return Err(SendError::BufferFull);
        }
        let mut segment = TxSegment::new(self.snd_lbb, flags, payload);
        segment.max_seg_size = max_seg_size;
        let len = segment.segment_len();
        self.unsent
            .push_back(segment)
            .map_err(|_| SendError::BufferFull)?;
        self.snd_lbb += len;
        self.snd_buf = self.snd_buf.saturating_sub(len as u16);
        Ok(())
    }

    /// Move into SYN-RECEIVED in response to `seg`, a SYN that reached a
    /// listener, and queue our SYN|ACK.
    pub(crate) fn open_passive(
        &mut self,
        cx: &mut Context,
        listener: ListenHandle,
        seg: &Incoming,
    ) -> Result<(), SendError> {
        if self.state != State::Closed {
            return Err(SendError::InvalidState);
        }
        let repr = &seg.repr;
        self.listener = Some(listener);
        self.backlog_pending = true;
        self.set_state(State::SynReceived);
        self.rcv_nxt = repr.seq_number + 1;
        self.rcv_ann_right_edge = self.rcv_nxt;
        self.snd_wnd = repr.window_len;
        self.congestion_controller
            .inner_mut()
            .set_ssthresh(self.snd_wnd);
        // Forces the first acknowledgement to update the window.
        self.snd_wl1 = repr.seq_number - 1;

        self.apply_options(cx, seg);
        self.mss = effective_mss(cx.config, self.mss, &self.remote.addr);

        let announced = effective_mss(cx.config, cx.config.mss, &self.remote.addr);
        self.enqueue(TcpFlags::SYN | TcpFlags::ACK, &[], Some(announced))
    }

    /// Queue our SYN and move into SYN-SENT.
    pub(crate) fn open_active(&mut self, cx: &mut Context) -> Result<(), SendError> {
        if self.state != State::Closed {
            return Err(SendError::InvalidState);
        }
        self.mss = effective_mss(cx.config, self.mss, &self.remote.addr);
        self.congestion_controller
            .inner_mut()
            .set_ssthresh(self.mss.saturating_mul(10));
        let announced = effective_mss(cx.config, cx.config.mss, &self.remote.addr);
        self.enqueue(TcpFlags::SYN, &[], Some(announced))?;
        self.set_state(State::SynSent);
        Ok(())
    }

    /// Queue data for transmission, cut into segments of at most one MSS.
    ///
    /// Either all of `data` is queued or none of it.
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<usize, SendError> {
        match self.state {
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => (),
            _ => return Err(SendError::InvalidState),
        }
        if data.is_empty() {
            return Ok(0);
        }
        let mss = self.mss.max(1) as usize;
        let segments = data.len().div_ceil(mss);
        if data.len() > self.snd_buf as usize
            || self.unsent.len() + self.unacked.len() + segments > TCP_TX_QUEUE_LEN
        {
            return Err(SendError::BufferFull);
        }
        for (index, chunk) in data.chunks(mss).enumerate() {
            let flags = if index + 1 == segments {
                TcpFlags::PSH
            } else {
                TcpFlags::empty()
            };
            self.enqueue(flags, chunk, None)?;
        }
        tcp_trace!("{}: queued {} octets", self, data.len());
        Ok(data.len())
    }

    /// Close the connection from our side.
    ///
    /// Unread data makes this a reset instead of an orderly close. When the
    /// connection ends up in CLOSED it is to be released.
    pub(crate) fn close(&mut self, cx: &mut Context) -> Result<(), SendError> {
        if matches!(self.state, State::Established | State::CloseWait) && self.rcv_wnd != TCP_WND
        {
            net_debug!("{}: closed with unread data, resetting", self);
            self.reset(cx);
            return Ok(());
        }
        match self.state {
            State::SynReceived | State::Established => {
                self.enqueue(TcpFlags::FIN, &[], None)?;
                self.set_state(State::FinWait1);
            }
            State::CloseWait => {
                self.enqueue(TcpFlags::FIN, &[], None)?;
                self.set_state(State::LastAck);
            }
            State::SynSent => {
                self.purge();
                self.set_state(State::Closed);
            }
            _ => return Err(SendError::InvalidState),
        }
        self.flags.insert(ConnFlags::RX_CLOSED);
        Ok(())
    }

    /// The application will read nothing more; data arriving from now on
    /// aborts the connection.
    pub(crate) fn shutdown_rx(&mut self) {
        self.flags.insert(ConnFlags::RX_CLOSED);
    }

    /// The application consumed `len` octets; reopen the window by as much.
    pub(crate) fn recved(&mut self, cx: &mut Context, len: u16) {
        self.rcv_wnd = self.rcv_wnd.saturating_add(len).min(TCP_WND);
        let inflation = self.update_rcv_ann_wnd();
        tcp_trace!("{}: recved {}, rcv_wnd={}", self, len, self.rcv_wnd);
        if inflation >= TCP_WND_UPDATE_THRESHOLD as u32 {
            self.ack_now();
            self.output(cx);
        }
    }

    /// Drop everything queued and stop the retransmission timer.
    fn purge(&mut self) {
        if matches!(self.state, State::Closed | State::Listen | State::TimeWait) {
            return;
        }
        if self.refused_data.take().is_some() {
            net_debug!("{}: dropping refused data", self);
        }
        self.refused_fin = false;
        if !self.ooseq.is_empty() {
            tcp_trace!("{}: dropping out-of-sequence data", self);
            self.ooseq.clear();
        }
        self.unsent.clear();
        self.unacked.clear();
        self.rtte.on_retransmit();
        self.timer.set_for_idle();
    }

    /// Send a RST to the peer and drop the connection, silently.
    fn reset(&mut self, cx: &mut Context) {
        if !matches!(
            self.state,
            State::Closed | State::Listen | State::TimeWait
        ) {
            send_rst(cx, &self.local, &self.remote, self.snd_nxt, self.rcv_nxt);
        }
        self.purge();
        self.set_state(State::Closed);
    }

    /// Reset the connection and tell the application it is gone.
    pub(crate) fn abort(&mut self, cx: &mut Context) {
        self.reset(cx);
        cx.app
            .on_event(self.handle, Event::Error(ConnectionError::Aborted));
    }

    /// Hand an event to the application, aborting the connection if the
    /// application asks for it.
    fn notify(&mut self, cx: &mut Context, event: Event) -> Result<Verdict, Aborted> {
        match cx.app.on_event(self.handle, event) {
            Verdict::Abort => {
                net_debug!("{}: aborted by application", self);
                self.abort(cx);
                Err(Aborted)
            }
            verdict => Ok(verdict),
        }
    }

    /// Offer previously refused data again.
    ///
    /// Returns whether the application still holds off.
    pub(crate) fn redeliver_refused(&mut self, cx: &mut Context) -> Result<bool, Aborted> {
        let Some(data) = self.refused_data.take() else {
            return Ok(false);
        };
        match self.notify(cx, Event::Received(&data))? {
            Verdict::Ok => {
                if self.refused_fin {
                    self.refused_fin = false;
                    self.deliver_fin(cx)?;
                }
                Ok(false)
            }
            _ => {
                self.refused_data = Some(data);
                Ok(true)
            }
        }
    }

    /// Run the state machine on one segment.
    ///
    /// Deletion is never done here: a reset or a completed close is reported
    /// through `seg.recv_flags` and left to the caller.
    pub(crate) fn process(&mut self, cx: &mut Context, seg: &mut Incoming) -> Result<(), Aborted> {
        let flags = seg.repr.flags;
        let seqno = seg.repr.seq_number;
        let ackno = seg.repr.ack_number;

        if flags.contains(TcpFlags::RST) {
            let acceptable = if self.state == State::SynSent {
                ackno == self.snd_nxt
            } else {
                seq_between(seqno, self.rcv_nxt, self.rcv_nxt + self.rcv_wnd as usize)
            };
            if acceptable {
                net_debug!("{}: connection reset by peer", self);
                seg.recv_flags.insert(RecvFlags::RESET);
                self.flags.remove(ConnFlags::ACK_DELAY);
            } else {
                net_debug!(
                    "{}: unacceptable RST seq={} ack={}, rcv_nxt={}",
                    self,
                    seqno,
                    ackno,
                    self.rcv_nxt
                );
            }
            return Ok(());
        }

        if flags.contains(TcpFlags::SYN)
            && !matches!(self.state, State::SynSent | State::SynReceived)
        {
            // The peer probably restarted; our ACK lets it find out.
            tcp_trace!("{}: SYN in {}, acking", self, self.state);
            self.ack_now();
            return Ok(());
        }

        if !self.flags.contains(ConnFlags::RX_CLOSED) {
            self.last_activity = cx.now;
        }

        self.apply_options(cx, seg);

        match self.state {
            State::SynSent => {
                let expected = self.unacked.front().map(|syn| syn.seq + 1);
                if flags.contains(TcpFlags::SYN | TcpFlags::ACK) && Some(ackno) == expected {
                    self.snd_buf = self.snd_buf.saturating_add(1);
                    self.rcv_nxt = seqno + 1;
                    self.rcv_ann_right_edge = self.rcv_nxt;
                    self.lastack = ackno;
                    self.snd_wnd = seg.repr.window_len;
                    // Forces the next acknowledgement to update the window.
                    self.snd_wl1 = seqno - 1;
                    self.set_state(State::Established);

                    self.mss = effective_mss(cx.config, self.mss, &self.remote.addr);
                    let controller = self.congestion_controller.inner_mut();
                    controller.set_ssthresh(self.mss.saturating_mul(10));
                    controller.on_connected(self.mss);

                    self.unacked.pop_front();
                    if self.unacked.is_empty() {
                        self.timer.set_for_idle();
                    } else {
                        self.timer
                            .set_for_retransmit(cx.now, self.rtte.retransmission_timeout());
                        self.nrtx = 0;
                    }

                    self.notify(cx, Event::Connected)?;
                    self.ack_now();
                } else if flags.contains(TcpFlags::ACK) {
                    send_rst(cx, &self.local, &self.remote, ackno, seqno + seg.tcplen());
                }
            }
            State::SynReceived => {
                if flags.contains(TcpFlags::ACK) {
                    if seq_between(ackno, self.lastack + 1, self.snd_nxt) {
                        self.set_state(State::Established);
                        let accepted = match self.listener {
                            Some(listener) => {
                                self.notify(cx, Event::Accepted { listener })? == Verdict::Ok
                            }
                            None => false,
                        };
                        if !accepted {
                            net_debug!("{}: not accepted, aborting", self);
                            self.abort(cx);
                            return Err(Aborted);
                        }

                        // The handshake opens the window on its own terms.
                        let controller = self.congestion_controller.clone();
                        self.receive(cx, seg);
                        self.congestion_controller = controller;

                        // Our SYN is not application data.
                        seg.acked = seg.acked.saturating_sub(1);
                        self.congestion_controller
                            .inner_mut()
                            .on_connected(self.mss);

                        if seg.recv_flags.contains(RecvFlags::GOT_FIN) {
                            self.ack_now();
                            self.set_state(State::CloseWait);
                        }
                    } else {
                        send_rst(cx, &self.local, &self.remote, ackno, seqno + seg.tcplen());
                    }
                } else if flags.contains(TcpFlags::SYN) && seqno == self.rcv_nxt - 1 {
                    // Our SYN|ACK was lost.
                    self.rexmit();
                }
            }
            State::Established | State::CloseWait => {
                self.receive(cx, seg);
                if seg.recv_flags.contains(RecvFlags::GOT_FIN) {
                    self.ack_now();
                    self.set_state(State::CloseWait);
                }
            }
            State::FinWait1 => {
                self.receive(cx, seg);
                let fin_acked = self.is_fin_acked(flags, ackno);
                if seg.recv_flags.contains(RecvFlags::GOT_FIN) {
                    self.ack_now();
                    if fin_acked {
                        self.purge();
                        self.enter_time_wait(cx.now);
                    } else {
                        self.set_state(State::Closing);
                    }
                } else if fin_acked {
                    self.set_state(State::FinWait2);
                }
            }
            State::FinWait2 => {
                self.receive(cx, seg);
                if seg.recv_flags.contains(RecvFlags::GOT_FIN) {
                    self.ack_now();
                    self.purge();
                    self.enter_time_wait(cx.now);
                }
            }
            State::Closing => {
                self.receive(cx, seg);
                if self.is_fin_acked(flags, ackno) {
                    self.purge();
                    self.enter_time_wait(cx.now);
                }
            }
            State::LastAck => {
                self.receive(cx, seg);
                if self.is_fin_acked(flags, ackno) {
                    seg.recv_flags.insert(RecvFlags::CLOSED);
                }
            }
            State::Closed | State::Listen | State::TimeWait => (),
        }
        Ok(())
    }

    /// Whether an acknowledgement covers our FIN. The FIN must have been sent
    /// for that: with it still queued behind a closed window, `snd_nxt` has
    /// not moved past the data ahead of it yet.
    fn is_fin_acked(&self, flags: TcpFlags, ackno: TcpSeqNumber) -> bool {
        flags.contains(TcpFlags::ACK) && ackno == self.snd_nxt && self.unsent.is_empty()
    }

    /// Handle a segment for a connection in TIME-WAIT.
    pub(crate) fn process_time_wait(&mut self, cx: &mut Context, seg: &Incoming) {
        let repr = &seg.repr;
        if repr.flags.contains(TcpFlags::RST) {
            return;
        }
        if repr.flags.contains(TcpFlags::SYN) {
            if seq_between(
                repr.seq_number,
                self.rcv_nxt,
                self.rcv_nxt + self.rcv_wnd as usize,
            ) {
                send_rst(
                    cx,
                    &self.local,
                    &self.remote,
                    repr.ack_number,
                    repr.seq_number + seg.tcplen(),
                );
                return;
            }
        } else if repr.flags.contains(TcpFlags::FIN) {
            // The peer missed our last ACK; wait for it all over again.
            self.timer.set_for_close(cx.now);
        }

        if seg.tcplen() > 0 {
            self.ack_now();
            self.output(cx);
        }
    }

    /// Tell the application what processing `seg` produced: freed send
    /// buffer, received data, and the end of the peer's stream.
    pub(crate) fn deliver(&mut self, cx: &mut Context, seg: &mut Incoming) -> Result<(), Aborted> {
        if seg.acked > 0 {
            self.notify(cx, Event::Sent(seg.acked))?;
        }
        if seg.recv_flags.contains(RecvFlags::CLOSED) {
            return Ok(());
        }

        if let Some(data) = seg.recv_data.take() {
            if self.flags.contains(ConnFlags::RX_CLOSED) {
                net_debug!("{}: data after receive shutdown, aborting", self);
                self.abort(cx);
                return Err(Aborted);
            }
            if self.notify(cx, Event::Received(&data))? == Verdict::Refuse {
                tcp_trace!("{}: application refused {} octets", self, data.len());
                self.refused_data = Some(data);
            }
        }

        if seg.recv_flags.contains(RecvFlags::GOT_FIN) {
            if self.refused_data.is_some() {
                // Told once the data in front of it has been taken.
                self.refused_fin = true;
            } else {
                self.deliver_fin(cx)?;
            }
        }
        Ok(())
    }

    fn deliver_fin(&mut self, cx: &mut Context) -> Result<(), Aborted> {
        // The FIN took a sequence number but no buffer space.
        if self.rcv_wnd != TCP_WND {
            self.rcv_wnd += 1;
        }
        self.notify(cx, Event::Closed)?;
        Ok(())
    }

    /// Move the oldest unacknowledged segment back to the unsent queue.
    fn rexmit(&mut self) {
        let Some(segment) = self.unacked.pop_front() else {
            return;
        };
        tcp_trace!("{}: retransmitting {}", self, segment);
        if self.unsent.insert_sorted(segment).is_err() {
            net_debug!("{}: unsent queue full, retransmission dropped", self);
        }
        self.nrtx = self.nrtx.saturating_add(1);
        self.rtte.on_retransmit();
    }

    /// Retransmit after three duplicate acknowledgements and enter fast
    /// recovery.
    fn rexmit_fast(&mut self, cx: &mut Context) {
        if self.unacked.is_empty() || self.flags.contains(ConnFlags::IN_FAST_RECOVERY) {
            return;
        }
        net_debug!(
            "{}: fast retransmit, dupacks={} lastack={}",
            self,
            self.dupacks,
            self.lastack
        );
        cx.stats.fast_rexmit += 1;
        self.rexmit();
        self.congestion_controller
            .inner_mut()
            .on_fast_retransmit(self.snd_wnd, self.mss);
        self.flags.insert(ConnFlags::IN_FAST_RECOVERY);
    }

    /// Requeue everything in flight after a retransmission timeout.
    fn rexmit_rto(&mut self) {
        while let Some(segment) = self.unacked.pop_back() {
            if self.unsent.push_front(segment).is_err() {
                net_debug!("{}: unsent queue full, retransmission dropped", self);
            }
        }
        self.nrtx = self.nrtx.saturating_add(1);
        self.rtte.on_retransmit();
    }

    /// Run the connection's timers.
    ///
    /// On `Err` the connection is dead and must be released.
    pub(crate) fn poll(&mut self, cx: &mut Context) -> Result<(), Aborted> {
        let now = cx.now;
        self.redeliver_refused(cx)?;

        let retransmit = self.timer.should_retransmit(now);
        let idle = now - self.last_activity;
        let give_up = if retransmit && self.nrtx >= self.max_rtx() {
            net_debug!("{}: giving up after {} retransmissions", self, self.nrtx);
            true
        } else if let Some(timeout) = self.state_timeout() {
            if idle >= timeout {
                net_debug!("{}: stuck in {}, giving up", self, self.state);
                true
            } else {
                false
            }
        } else {
            false
        };
        if give_up {
            self.purge();
            self.set_state(State::Closed);
            cx.app
                .on_event(self.handle, Event::Error(ConnectionError::TimedOut));
            return Err(Aborted);
        }

        if retransmit {
            if self.unacked.is_empty() {
                self.timer.set_for_idle();
            } else {
                if self.state != State::SynSent {
                    self.rtte.backoff(self.nrtx);
                }
                self.congestion_controller
                    .inner_mut()
                    .on_retransmit(self.snd_wnd, self.mss);
                net_debug!(
                    "{}: retransmission timeout, nrtx={} rto={}",
                    self,
                    self.nrtx,
                    self.rtte.retransmission_timeout()
                );
                cx.stats.rexmit += 1;
                self.rexmit_rto();
                self.timer
                    .set_for_retransmit(now, self.rtte.retransmission_timeout());
                self.output(cx);
            }
        }

        if !self.ooseq.is_empty()
            && idle.ticks() >= self.rtte.rto.max(1) as u32 * TCP_OOSEQ_TIMEOUT
        {
            tcp_trace!("{}: out-of-sequence data went stale", self);
            self.ooseq.clear();
        }

        if self.flags.contains(ConnFlags::ACK_DELAY) {
            self.ack_now();
            self.output(cx);
        }
        Ok(())
    }

    /// Build an outgoing segment carrying our current acknowledgement and window.
    fn segment_repr<'p>(
        &self,
        timestamp: Instant,
        seq: TcpSeqNumber,
        flags: TcpFlags,
        payload: &'p [u8],
    ) -> TcpRepr<'p> {
        TcpRepr {
            src_port: self.local.port,
            dst_port: self.remote.port,
            flags,
            seq_number: seq,
            ack_number: self.rcv_nxt,
            window_len: self.rcv_ann_wnd,
            max_seg_size: None,
            timestamp: if self.flags.contains(ConnFlags::TIMESTAMP) {
                Some(TcpTimestampRepr::new(
                    timestamp.total_millis() as u32,
                    self.ts_recent,
                ))
            } else {
                None
            },
            payload,
        }
    }

    /// Remember what we told the peer.
    fn on_segment_sent(&mut self) {
        self.rcv_ann_right_edge = self.rcv_nxt + self.rcv_ann_wnd as usize;
        if self.flags.contains(ConnFlags::TIMESTAMP) {
            self.ts_lastacksent = self.rcv_nxt;
        }
    }

    /// Send an acknowledgement without data.
    fn send_empty_ack(&mut self, cx: &mut Context) {
        let repr = self.segment_repr(cx.now, self.snd_nxt, TcpFlags::ACK, &[]);
        tcp_trace!("{}: sending ACK {} wnd={}", self, self.rcv_nxt, self.rcv_ann_wnd);
        self.flags.remove(ConnFlags::ACK_DELAY | ConnFlags::ACK_NOW);
        cx.transmit(self.local.addr, self.remote.addr, &repr);
        self.on_segment_sent();
    }

    /// Send what the windows allow, or a bare acknowledgement if one is owed
    /// and nothing else can carry it.
    pub(crate) fn output(&mut self, cx: &mut Context) {
        let window = (self.snd_wnd as usize).min(self.cwnd());
        let fits = |segment: &TxSegment, lastack: TcpSeqNumber| {
            segment.seq.offset_from(lastack) as u32 as usize + segment.payload.len() <= window
        };

        if self.flags.contains(ConnFlags::ACK_NOW)
            && !self
                .unsent
                .front()
                .is_some_and(|segment| fits(segment, self.lastack))
        {
            self.send_empty_ack(cx);
            return;
        }

        while let Some(segment) = self.unsent.front() {
            if !fits(segment, self.lastack) || self.unacked.is_full() {
                break;
            }
            let Some(segment) = self.unsent.pop_front() else {
                break;
            };

            let mut flags = segment.flags;
            if self.state != State::SynSent {
                flags |= TcpFlags::ACK;
            }
            let mut repr = self.segment_repr(cx.now, segment.seq, flags, &segment.payload);
            repr.max_seg_size = segment.max_seg_size;
            tcp_trace!("{}: sending {}", self, segment);
            cx.transmit(self.local.addr, self.remote.addr, &repr);

            if flags.contains(TcpFlags::ACK) {
                self.flags
                    .remove(ConnFlags::ACK_DELAY | ConnFlags::ACK_NOW);
            }
            self.on_segment_sent();

            let end = segment.end();
            if self.snd_nxt < end {
                self.snd_nxt = end;
            }
            if segment.segment_len() > 0 {
                if !self.timer.is_retransmit() {
                    self.timer
                        .set_for_retransmit(cx.now, self.rtte.retransmission_timeout());
                }
                self.rtte.on_send(cx.now, segment.seq);
                if self.unacked.insert_sorted(segment).is_err() {
                    net_debug!("{}: unacked queue full", self);
                }
            }
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::iface::mock::{Recorder, Wire};
    use crate::iface::Stats;

    const LOCAL: IpEndpoint = IpEndpoint::new(IpAddress::v4(192, 168, 1, 1), 80);
    const REMOTE: IpEndpoint = IpEndpoint::new(IpAddress::v4(192, 168, 1, 2), 49500);

    fn context<'c>(
        config: &'c Config,
        stats: &'c mut Stats,
        wire: &'c mut Wire,
        app: &'c mut Recorder,
    ) -> Context<'c> {
        Context {
            now: Instant::from_ticks(100),
            config,
            stats,
            tx: wire,
            app,
        }
    }

    fn established(config: &Config) -> Connection {
        let mut conn = Connection::new(
            config,
            LOCAL,
            REMOTE,
            TcpSeqNumber(10_000),
            Instant::from_ticks(100),
        );
        conn.state = State::Established;
        conn.rcv_nxt = TcpSeqNumber(1000);
        conn.rcv_ann_right_edge = conn.rcv_nxt + TCP_WND as usize;
        conn.snd_wl1 = TcpSeqNumber(999);
        conn
    }

    fn segment(seq: i32, flags: TcpFlags, payload: &[u8]) -> Incoming<'_> {
        Incoming::new(
            LOCAL,
            REMOTE,
            TcpRepr {
                src_port: REMOTE.port,
                dst_port: LOCAL.port,
                flags,
                seq_number: TcpSeqNumber(seq),
                ack_number: TcpSeqNumber(10_000),
                window_len: TCP_WND,
                max_seg_size: None,
                timestamp: None,
                payload,
            },
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::SynReceived.to_string(), "SYN-RECEIVED");
        assert_eq!(State::TimeWait.to_string(), "TIME-WAIT");
    }

    #[test]
    fn test_rtte_initial() {
        let rtte = RttEstimator::default();
        assert_eq!(rtte.retransmission_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn test_rtte_jacobson() {
        let mut rtte = RttEstimator::default();
        rtte.on_send(Instant::from_ticks(10), TcpSeqNumber(100));
        // A later send does not restart the measurement.
        rtte.on_send(Instant::from_ticks(11), TcpSeqNumber(200));
        rtte.on_ack(Instant::from_ticks(14), TcpSeqNumber(100));
        assert!(rtte.timestamp.is_some());
        rtte.on_ack(Instant::from_ticks(14), TcpSeqNumber(101));
        assert!(rtte.timestamp.is_none());
        // m = 4; sa = 0 + 4; m = 4 - (2 >> 2) = 4; sv = 2 + 4.
        assert_eq!(rtte.sa, 4);
        assert_eq!(rtte.sv, 6);
        assert_eq!(rtte.rto, 6);
    }

    #[test]
    fn test_rtte_karn() {
        let mut rtte = RttEstimator::default();
        rtte.on_send(Instant::from_ticks(10), TcpSeqNumber(100));
        rtte.on_retransmit();
        rtte.on_ack(Instant::from_ticks(30), TcpSeqNumber(200));
        assert_eq!(rtte.sa, 0);
        assert_eq!(rtte.rto, RTTE_INITIAL_RTO);
    }

    #[test]
    fn test_rtte_backoff() {
        let mut rtte = RttEstimator::default();
        rtte.backoff(0);
        assert_eq!(rtte.rto, 4);
        rtte.backoff(3);
        assert_eq!(rtte.rto, 32);
        rtte.backoff(40);
        assert_eq!(rtte.rto, 256);
        rtte.sv = i16::MAX;
        rtte.backoff(12);
        assert_eq!(rtte.rto, i16::MAX);
        rtte.reset_rto();
        assert_eq!(rtte.rto, i16::MAX);
    }

    #[test]
    fn test_timer() {
        let mut timer = Timer::Idle;
        assert_eq!(timer.poll_at(), PollAt::Ingress);
        timer.set_for_retransmit(Instant::from_ticks(10), Duration::from_ticks(2));
        assert!(timer.is_retransmit());
        assert!(!timer.should_retransmit(Instant::from_ticks(11)));
        assert!(timer.should_retransmit(Instant::from_ticks(12)));
        timer.set_for_close(Instant::from_ticks(12));
        assert!(!timer.is_retransmit());
        // A closing connection keeps its close timer.
        timer.set_for_retransmit(Instant::from_ticks(12), Duration::from_ticks(2));
        timer.set_for_idle();
        assert!(timer.should_close(Instant::from_ticks(12) + CLOSE_DELAY));
    }

    #[test]
    fn test_seq_between() {
        assert!(seq_between(TcpSeqNumber(5), TcpSeqNumber(5), TcpSeqNumber(5)));
        assert!(seq_between(
            TcpSeqNumber(i32::MIN),
            TcpSeqNumber(i32::MAX),
            TcpSeqNumber(i32::MIN + 5)
        ));
        assert!(!seq_between(TcpSeqNumber(4), TcpSeqNumber(5), TcpSeqNumber(4)));
    }

    #[test]
    fn test_effective_mss() {
        let mut config = Config::default();
        assert_eq!(effective_mss(&config, 1460, &LOCAL.addr), 1460);
        config.ip_mtu = Some(576);
        assert_eq!(effective_mss(&config, 1460, &LOCAL.addr), 536);
        config.ip_mtu = Some(0);
        assert_eq!(effective_mss(&config, 1460, &LOCAL.addr), 1);
    }

    #[test]
    fn test_apply_options_mss_ceiling() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);

        for (offered, effective) in [(1000, 1000), (0, config.mss), (u16::MAX, config.mss)] {
            let mut seg = segment(1000, TcpFlags::SYN | TcpFlags::ACK, &[]);
            seg.repr.max_seg_size = Some(offered);
            conn.apply_options(&cx, &seg);
            assert_eq!(conn.mss(), effective);
        }
    }

    #[test]
    fn test_apply_options_mss_only_on_syn() {
        let config = Config {
            ip_mtu: Some(576),
            ..Config::default()
        };
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);
        let before = conn.mss();

        let mut seg = segment(1000, TcpFlags::ACK, &[]);
        seg.repr.max_seg_size = Some(1400);
        conn.apply_options(&cx, &seg);
        assert_eq!(conn.mss(), before);

        // On a SYN the offer is still bounded by what fits the IP MTU.
        seg.repr.flags = TcpFlags::SYN | TcpFlags::ACK;
        conn.apply_options(&cx, &seg);
        assert_eq!(conn.mss(), 576 - 20 - TCP_HEADER_LEN as u16);
    }

    #[test]
    fn test_apply_options_timestamp() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);

        let mut seg = segment(1000, TcpFlags::ACK, b"abc");
        seg.repr.timestamp = Some(TcpTimestampRepr::new(7, 0));
        conn.apply_options(&cx, &seg);
        assert!(!conn.timestamps_enabled());
        assert_eq!(conn.ts_recent, 0);

        seg.repr.flags = TcpFlags::SYN;
        conn.apply_options(&cx, &seg);
        assert!(conn.timestamps_enabled());
        assert_eq!(conn.ts_recent, 7);

        // Only segments covering the last acknowledgement we sent update it.
        conn.ts_lastacksent = TcpSeqNumber(1002);
        let mut seg = segment(1000, TcpFlags::ACK, b"abc");
        seg.repr.timestamp = Some(TcpTimestampRepr::new(9, 0));
        conn.apply_options(&cx, &seg);
        assert_eq!(conn.ts_recent, 9);
        let mut seg = segment(1003, TcpFlags::ACK, b"abc");
        seg.repr.timestamp = Some(TcpTimestampRepr::new(11, 0));
        conn.apply_options(&cx, &seg);
        assert_eq!(conn.ts_recent, 9);
    }

    #[test]
    fn test_update_rcv_ann_wnd() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.rcv_ann_wnd = TCP_WND;

        // Consuming data shrinks the announced window without moving the edge.
        conn.rcv_nxt += 100;
        conn.rcv_wnd -= 100;
        assert_eq!(conn.update_rcv_ann_wnd(), 0);
        assert_eq!(conn.rcv_ann_wnd, TCP_WND - 100);

        // Reopening by less than an MSS is not worth announcing.
        conn.rcv_wnd += 50;
        assert_eq!(conn.update_rcv_ann_wnd(), 0);
        assert_eq!(conn.rcv_ann_wnd, TCP_WND - 100);

        conn.rcv_wnd = TCP_WND;
        conn.mss = 536;
        conn.rcv_nxt += 600;
        assert_eq!(conn.update_rcv_ann_wnd(), 700);
        assert_eq!(conn.rcv_ann_wnd, TCP_WND);

        // Past the announced edge, nothing is announced.
        conn.rcv_ann_right_edge = conn.rcv_nxt - 10;
        conn.rcv_wnd = 0;
        assert_eq!(conn.update_rcv_ann_wnd(), 0);
        assert_eq!(conn.rcv_ann_wnd, 0);
    }

    #[test]
    fn test_delayed_ack_escalates() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.ack();
        assert_eq!(conn.flags, ConnFlags::ACK_DELAY);
        conn.ack();
        assert_eq!(conn.flags, ConnFlags::ACK_NOW);
        assert_eq!(conn.poll_at(), PollAt::Now);
    }

    #[test]
    fn test_send_segments_by_mss() {
        let config = Config::default();
        let mut conn = established(&config);
        conn.mss = 100;
        assert_eq!(conn.send(&[0; 250]), Ok(250));
        let lens: Vec<_> = conn.unsent().iter().map(|s| s.payload.len()).collect();
        assert_eq!(lens, [100, 100, 50]);
        assert!(conn.unsent().back().is_some_and(|s| s.flags == TcpFlags::PSH));
        assert_eq!(conn.snd_buf(), TCP_SND_BUF - 250);
        assert_eq!(conn.snd_lbb, TcpSeqNumber(10_250));

        assert_eq!(conn.send(&[0; 600]), Err(SendError::BufferFull));
        assert_eq!(conn.unsent().len(), 3);
        conn.state = State::FinWait1;
        assert_eq!(conn.send(b"x"), Err(SendError::InvalidState));
    }

    #[test]
    fn test_output_respects_windows() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let mut cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);
        conn.mss = 100;
        conn.congestion_controller.inner_mut().on_connected(100);
        conn.send(&[1; 300]).unwrap();
        conn.output(&mut cx);
        drop(cx);

        // cwnd of two segments.
        assert_eq!(wire.sent.len(), 2);
        assert!(wire.sent[0].flags.contains(TcpFlags::ACK));
        assert_eq!(wire.sent[0].ack, TcpSeqNumber(1000));
        assert_eq!(wire.sent[1].seq, TcpSeqNumber(10_100));
        assert_eq!(conn.snd_nxt(), TcpSeqNumber(10_200));
        assert_eq!(conn.unacked().len(), 2);
        assert_eq!(conn.unsent().len(), 1);
        assert!(conn.is_retransmit_pending());
    }

    #[test]
    fn test_output_flushes_owed_ack() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let mut cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);
        conn.output(&mut cx);
        conn.ack();
        conn.output(&mut cx);
        conn.ack_now();
        conn.output(&mut cx);
        drop(cx);

        assert_eq!(wire.sent.len(), 1);
        assert_eq!(wire.sent[0].flags, TcpFlags::ACK);
        assert_eq!(wire.sent[0].seq, conn.snd_nxt());
        assert!(conn.flags.is_empty());
    }

    #[test]
    fn test_close_sends_fin() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let mut cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);
        assert_eq!(conn.close(&mut cx), Ok(()));
        assert_eq!(conn.state(), State::FinWait1);
        assert!(conn.is_rx_closed());
        assert_eq!(conn.close(&mut cx), Err(SendError::InvalidState));
        conn.output(&mut cx);
        drop(cx);
        assert_eq!(wire.sent.len(), 1);
        assert_eq!(wire.sent[0].flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(conn.snd_nxt(), TcpSeqNumber(10_001));
    }

    #[test]
    fn test_close_with_unread_data_resets() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let mut cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);
        conn.rcv_wnd -= 10;
        assert_eq!(conn.close(&mut cx), Ok(()));
        drop(cx);
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(wire.sent.len(), 1);
        assert!(wire.sent[0].flags.contains(TcpFlags::RST));
        assert!(app.events.is_empty());
    }

    #[test]
    fn test_rexmit_rto_requeues_in_order() {
        let config = Config::default();
        let (mut stats, mut wire, mut app) = (Stats::default(), Wire::default(), Recorder::default());
        let mut cx = context(&config, &mut stats, &mut wire, &mut app);
        let mut conn = established(&config);
        conn.mss = 100;
        conn.congestion_controller.inner_mut().on_connected(100);
        conn.send(&[1; 300]).unwrap();
        conn.output(&mut cx);
        conn.rexmit_rto();
        let seqs: Vec<_> = conn.unsent().iter().map(|s| s.seq.0).collect();
        assert_eq!(seqs, [10_000, 10_100, 10_200]);
        assert!(conn.unacked().is_empty());
        assert_eq!(conn.nrtx(), 1);
    }
}
