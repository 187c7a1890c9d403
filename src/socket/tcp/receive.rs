use alloc::vec::Vec;

use super::{seq_between, ConnFlags, Connection, Incoming, RecvFlags, State};
use crate::iface::Context;
use crate::storage::OooSegment;
use crate::wire::TcpFlags;

impl Connection {
    /// Take in the acknowledgement and the data of one segment.
    ///
    /// This updates the send window, frees what the peer acknowledged, grows
    /// or shrinks the congestion window, samples the round trip, and admits
    /// data into the receive sequence space, either in order or onto the
    /// out-of-sequence queue. What the application is owed is left in `seg`.
    pub(super) fn receive(&mut self, cx: &mut Context, seg: &mut Incoming) {
        if seg.repr.flags.contains(TcpFlags::ACK) {
            self.receive_ack(cx, seg);
        }

        if seg.tcplen() > 0 {
            self.receive_data(cx, seg);
        } else if !self.in_receive_window(seg) {
            // Zero-length segments outside the window still get an answer.
            self.ack_now();
        }
    }

    fn in_receive_window(&self, seg: &Incoming) -> bool {
        let window_last = self.rcv_nxt + self.rcv_wnd as usize - 1;
        seq_between(seg.repr.seq_number, self.rcv_nxt, window_last)
    }

    fn receive_ack(&mut self, cx: &mut Context, seg: &mut Incoming) {
        let seqno = seg.repr.seq_number;
        let ackno = seg.repr.ack_number;
        let wnd = seg.repr.window_len;
        let right_wnd_edge = self.snd_wl2 + self.snd_wnd as usize;

        // Only a segment newer than the last window update may move the window.
        if self.snd_wl1 < seqno
            || (self.snd_wl1 == seqno && self.snd_wl2 < ackno)
            || (self.snd_wl2 == ackno && wnd > self.snd_wnd)
        {
            self.snd_wnd = wnd;
            self.snd_wl1 = seqno;
            self.snd_wl2 = ackno;
            tcp_trace!("{}: window update {}", self, self.snd_wnd);
        }

        if ackno <= self.lastack {
            seg.acked = 0;
            let duplicate = seg.tcplen() == 0
                && self.snd_wl2 + self.snd_wnd as usize == right_wnd_edge
                && self.timer.is_retransmit()
                && self.lastack == ackno;
            if duplicate {
                self.dupacks = self.dupacks.saturating_add(1);
                if self.dupacks > 3 {
                    // Each further duplicate means another segment left the network.
                    self.congestion_controller
                        .inner_mut()
                        .on_duplicate_ack(self.mss);
                } else if self.dupacks == 3 {
                    self.rexmit_fast(cx);
                }
            } else {
                self.dupacks = 0;
            }
        } else if seq_between(ackno, self.lastack + 1, self.snd_nxt) {
            if self.flags.contains(ConnFlags::IN_FAST_RECOVERY) {
                self.flags.remove(ConnFlags::IN_FAST_RECOVERY);
                self.congestion_controller.inner_mut().on_recovery_exit();
            }

            self.nrtx = 0;
            self.rtte.reset_rto();

            let acked = (ackno - self.lastack) as u16;
            seg.acked = acked;
            self.snd_buf = self.snd_buf.saturating_add(acked);
            self.dupacks = 0;
            self.lastack = ackno;

            if self.state >= State::Established {
                self.congestion_controller.inner_mut().on_ack(self.mss);
            }
            tcp_trace!(
                "{}: ack {} acked={} cwnd={} unacked={}",
                self,
                ackno,
                acked,
                self.cwnd(),
                self.unacked.len()
            );

            let (count, flags) = self.unacked.pop_front_while(|segment| segment.end() <= ackno);
            if count > 0 && flags.contains(TcpFlags::FIN) && seg.acked > 0 {
                // The FIN took no buffer space the application cares about.
                seg.acked -= 1;
            }

            if self.unacked.is_empty() {
                self.timer.set_for_idle();
            } else {
                self.timer
                    .set_for_retransmit(cx.now, self.rtte.retransmission_timeout());
            }
        } else {
            // Acknowledges something we never sent.
            seg.acked = 0;
        }

        // A retransmission timeout requeues everything in flight; what the
        // peer has since acknowledged need not go out again.
        let snd_nxt = self.snd_nxt;
        let (count, flags) = self.unsent.pop_front_while(|segment| {
            seq_between(ackno, segment.end(), snd_nxt)
        });
        if count > 0 && flags.contains(TcpFlags::FIN) && seg.acked > 0 {
            seg.acked -= 1;
        }

        self.rtte.on_ack(cx.now, ackno);
    }

    fn receive_data(&mut self, cx: &mut Context, seg: &mut Incoming) {
        let tcplen = seg.tcplen();
        let seqno = seg.repr.seq_number;

        if seq_between(self.rcv_nxt, seqno + 1, seqno + tcplen - 1) {
            // Part of the segment was already received; keep only the rest.
            let mut off = self.rcv_nxt - seqno;
            if seg.repr.flags.contains(TcpFlags::SYN) {
                seg.repr.flags.remove(TcpFlags::SYN);
                off -= 1;
            }
            tcp_trace!("{}: trimming {} duplicate octets at {}", self, off, seqno);
            seg.repr.payload = &seg.repr.payload[off..];
            seg.repr.seq_number = self.rcv_nxt;
        } else if seqno < self.rcv_nxt {
            // An old duplicate; the peer likely missed our acknowledgement.
            self.ack_now();
        }

        if !self.in_receive_window(seg) {
            tcp_trace!(
                "{}: segment {} outside window [{}, {}+{})",
                self,
                seg.repr.seq_number,
                self.rcv_nxt,
                self.rcv_nxt,
                self.rcv_wnd
            );
            self.send_empty_ack(cx);
            return;
        }

        if seg.repr.seq_number == self.rcv_nxt {
            self.receive_in_sequence(seg);
        } else {
            // Let the peer know where the hole is right away, so it can fast
            // retransmit.
            self.send_empty_ack(cx);
            if seg.repr.flags.contains(TcpFlags::SYN) {
                return;
            }
            let segment = OooSegment::new(
                seg.repr.seq_number,
                seg.repr.payload,
                seg.repr.flags.contains(TcpFlags::FIN),
            );
            let window_end = self.rcv_nxt + self.rcv_wnd as usize;
            match self.ooseq.insert(segment, window_end) {
                Ok(true) => tcp_trace!("{}: queued out-of-sequence {}", self, seg.repr.seq_number),
                Ok(false) => (),
                Err(_) => net_debug!(
                    "{}: out-of-sequence queue full, dropping {}",
                    self,
                    seg.repr.seq_number
                ),
            }
        }
    }

    fn receive_in_sequence(&mut self, seg: &mut Incoming) {
        let repr = &mut seg.repr;

        if repr.segment_len() > self.rcv_wnd as usize {
            // The peer overran our window; what lies past it is dropped,
            // FIN included.
            tcp_trace!("{}: clipping {} to window {}", self, repr.seq_number, self.rcv_wnd);
            repr.flags.remove(TcpFlags::FIN);
            let mut len = self.rcv_wnd as usize;
            if repr.flags.contains(TcpFlags::SYN) {
                len -= 1;
            }
            repr.payload = &repr.payload[..len];
        }

        if !self.ooseq.is_empty() {
            if repr.flags.contains(TcpFlags::FIN) {
                // Everything queued lies past the end of the stream.
                tcp_trace!("{}: in-sequence FIN, dropping out-of-sequence data", self);
                self.ooseq.clear();
            } else {
                let end = repr.seq_number + repr.segment_len();
                if self.ooseq.remove_covered(end) && !repr.flags.contains(TcpFlags::SYN) {
                    repr.flags.insert(TcpFlags::FIN);
                }
                if let Some(next) = self.ooseq.front() {
                    let end = repr.seq_number + repr.segment_len();
                    if end > next.seq {
                        let mut len = next.seq - repr.seq_number;
                        if repr.flags.contains(TcpFlags::SYN) {
                            len -= 1;
                        }
                        repr.flags.remove(TcpFlags::FIN);
                        repr.payload = &repr.payload[..len];
                    }
                }
            }
        }

        let tcplen = repr.segment_len();
        self.rcv_nxt += tcplen;
        self.rcv_wnd = self.rcv_wnd.saturating_sub(tcplen as u16);
        self.update_rcv_ann_wnd();

        let mut data = Vec::from(repr.payload);
        if repr.flags.contains(TcpFlags::FIN) {
            seg.recv_flags.insert(RecvFlags::GOT_FIN);
        }

        // Queued segments that are now in sequence follow right behind.
        while let Some(next) = self.ooseq.pop_front_at(self.rcv_nxt) {
            let len = next.segment_len();
            tcp_trace!("{}: merging out-of-sequence {}", self, next);
            self.rcv_nxt += len;
            self.rcv_wnd = self.rcv_wnd.saturating_sub(len as u16);
            self.update_rcv_ann_wnd();
            data.extend_from_slice(&next.data);
            if next.fin {
                seg.recv_flags.insert(RecvFlags::GOT_FIN);
                if self.state == State::Established {
                    self.set_state(State::CloseWait);
                }
            }
        }

        if !data.is_empty() {
            seg.recv_data = Some(data);
        }

        self.ack();
    }
}
