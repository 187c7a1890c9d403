pub(super) mod no_control;

pub(super) mod reno;

/// Congestion window bookkeeping, driven by the receive path.
///
/// All sizes are in octets and follow the 16-bit arithmetic of the control
/// block; growth never wraps.
#[allow(unused_variables)]
pub(super) trait Controller {
    /// Returns the number of bytes that can be in flight.
    fn window(&self) -> usize;

    /// Returns the slow start threshold.
    fn ssthresh(&self) -> usize {
        usize::MAX
    }

    fn set_ssthresh(&mut self, ssthresh: u16) {}

    /// The handshake completed; open the initial window.
    fn on_connected(&mut self, mss: u16) {}

    /// An acknowledgement advanced the left edge of the send window.
    fn on_ack(&mut self, mss: u16) {}

    /// A duplicate acknowledgement arrived while in fast recovery.
    fn on_duplicate_ack(&mut self, mss: u16) {}

    /// The third duplicate acknowledgement triggered a fast retransmit.
    fn on_fast_retransmit(&mut self, remote_window: u16, mss: u16) {}

    /// New data was acknowledged while in fast recovery.
    fn on_recovery_exit(&mut self) {}

    /// The retransmission timer expired.
    fn on_retransmit(&mut self, remote_window: u16, mss: u16) {}
}

#[derive(Debug, Clone)]

pub(super) enum AnyController {
    None(no_control::NoControl),
    Reno(reno::Reno),
}

impl AnyController {
    /// Create a new congestion controller.
    ///
    /// Reno is the default; it only needs 16-bit integer arithmetic and is
    /// what small peers expect.
    #[inline]
    pub fn new() -> Self {
        AnyController::Reno(reno::Reno::new())
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut dyn Controller {
        match self {
            AnyController::None(n) => n,
            AnyController::Reno(r) => r,
        }
    }

    #[inline]
    pub fn inner(&self) -> &dyn Controller {
        match self {
            AnyController::None(n) => n,
            AnyController::Reno(r) => r,
        }
    }
}
