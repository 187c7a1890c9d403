use crate::config::TCP_DEFAULT_MSS;

use super::Controller;

/// Slow start, congestion avoidance, fast retransmit and fast recovery
/// (RFC 5681), in 16-bit arithmetic.
#[derive(Debug, Clone)]
pub struct Reno {
    cwnd: u16,
    ssthresh: u16,
}

impl Reno {
    pub fn new() -> Reno {
        Reno {
            // One octet until the handshake completes: the SYN.
            cwnd: 1,
            ssthresh: TCP_DEFAULT_MSS.saturating_mul(10),
        }
    }

    /// Half the flight size, but no less than two segments.
    fn halved(&self, remote_window: u16, mss: u16) -> u16 {
        let ssthresh = self.cwnd.min(remote_window) / 2;
        ssthresh.max(mss.saturating_mul(2))
    }
}

impl Controller for Reno {
    fn window(&self) -> usize {
        self.cwnd as usize
    }

    fn ssthresh(&self) -> usize {
        self.ssthresh as usize
    }

    fn set_ssthresh(&mut self, ssthresh: u16) {
        self.ssthresh = ssthresh;
    }

    fn on_connected(&mut self, mss: u16) {
        self.cwnd = if self.cwnd == 1 {
            mss.saturating_mul(2)
        } else {
            mss
        };
    }

    fn on_ack(&mut self, mss: u16) {
        if self.cwnd < self.ssthresh {
            // slow start
            self.cwnd = self.cwnd.saturating_add(mss);
        } else {
            // congestion avoidance
            let increment = (mss as u32 * mss as u32 / self.cwnd.max(1) as u32) as u16;
            let cwnd = self.cwnd.wrapping_add(increment);
            if cwnd > self.cwnd {
                self.cwnd = cwnd;
            }
        }
        net_trace!("reno: cwnd={} ssthresh={}", self.cwnd, self.ssthresh);
    }

    fn on_duplicate_ack(&mut self, mss: u16) {
        self.cwnd = self.cwnd.saturating_add(mss);
    }

    fn on_fast_retransmit(&mut self, remote_window: u16, mss: u16) {
        self.ssthresh = self.halved(remote_window, mss);
        self.cwnd = self.ssthresh.saturating_add(mss.saturating_mul(3));
        net_trace!(
            "reno: fast retransmit, cwnd={} ssthresh={}",
            self.cwnd,
            self.ssthresh
        );
    }

    fn on_recovery_exit(&mut self) {
        self.cwnd = self.ssthresh;
    }

    fn on_retransmit(&mut self, remote_window: u16, mss: u16) {
        self.ssthresh = self.halved(remote_window, mss);
        self.cwnd = mss;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MSS: u16 = 536;

    #[test]
    fn test_initial_window() {
        let mut reno = Reno::new();
        assert_eq!(reno.window(), 1);
        reno.on_connected(MSS);
        assert_eq!(reno.window(), 2 * MSS as usize);

        let mut reno = Reno::new();
        reno.cwnd = 100;
        reno.on_connected(MSS);
        assert_eq!(reno.window(), MSS as usize);
    }

    #[test]
    fn test_slow_start_then_avoidance() {
        let mut reno = Reno::new();
        reno.on_connected(MSS);
        reno.set_ssthresh(3 * MSS);
        reno.on_ack(MSS);
        assert_eq!(reno.window(), 3 * MSS as usize);
        // At the threshold: cwnd += mss*mss/cwnd.
        reno.on_ack(MSS);
        assert_eq!(reno.window(), 3 * MSS as usize + MSS as usize / 3);
    }

    #[test]
    fn test_growth_saturates() {
        let mut reno = Reno::new();
        reno.cwnd = u16::MAX - 10;
        reno.ssthresh = u16::MAX;
        reno.on_ack(MSS);
        assert_eq!(reno.window(), u16::MAX as usize);
        reno.ssthresh = 0;
        reno.on_ack(MSS);
        assert_eq!(reno.window(), u16::MAX as usize);
        reno.on_duplicate_ack(MSS);
        assert_eq!(reno.window(), u16::MAX as usize);
    }

    #[test]
    fn test_fast_retransmit_and_recovery() {
        let mut reno = Reno::new();
        reno.cwnd = 8 * MSS;
        reno.on_fast_retransmit(10 * MSS, MSS);
        assert_eq!(reno.ssthresh(), 4 * MSS as usize);
        assert_eq!(reno.window(), 7 * MSS as usize);
        reno.on_duplicate_ack(MSS);
        assert_eq!(reno.window(), 8 * MSS as usize);
        reno.on_recovery_exit();
        assert_eq!(reno.window(), 4 * MSS as usize);
    }

    #[test]
    fn test_threshold_floor() {
        let mut reno = Reno::new();
        reno.cwnd = 2 * MSS;
        reno.on_retransmit(MSS, MSS);
        assert_eq!(reno.ssthresh(), 2 * MSS as usize);
        assert_eq!(reno.window(), MSS as usize);
    }
}
