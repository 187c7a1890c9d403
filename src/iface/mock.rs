//! Test doubles for the transmit and application collaborators.

use alloc::vec::Vec;

use super::{
    Application, ConnectionError, Event, Handle, ListenHandle, Transmit, TransmitError, Verdict,
};
use crate::wire::{IpAddress, TcpFlags, TcpPacket, TcpRepr, TcpSeqNumber, TcpTimestampRepr};

/// A segment as it went out on the wire, parsed back from its octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSegment {
    pub src: IpAddress,
    pub dst: IpAddress,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
    pub seq: TcpSeqNumber,
    pub ack: TcpSeqNumber,
    pub window: u16,
    pub max_seg_size: Option<u16>,
    pub timestamp: Option<TcpTimestampRepr>,
    pub payload: Vec<u8>,
}

/// Emits every segment into a buffer and records what parses back out.
#[derive(Debug, Default)]
pub struct Wire {
    pub sent: Vec<SentSegment>,
    /// Refuse every segment.
    pub fail: bool,
}

impl Wire {
    pub fn take(&mut self) -> Vec<SentSegment> {
        core::mem::take(&mut self.sent)
    }
}

impl Transmit for Wire {
    fn transmit(
        &mut self,
        src_addr: IpAddress,
        dst_addr: IpAddress,
        repr: &TcpRepr,
    ) -> Result<(), TransmitError> {
        if self.fail {
            return Err(TransmitError);
        }
        let mut buffer = vec![0; repr.buffer_len()];
        repr.emit(&mut TcpPacket::new_unchecked(&mut buffer));
        let packet = TcpPacket::new_checked(&buffer[..]).expect("emitted a short segment");
        let parsed = TcpRepr::parse(&packet).expect("emitted a malformed segment");
        self.sent.push(SentSegment {
            src: src_addr,
            dst: dst_addr,
            src_port: parsed.src_port,
            dst_port: parsed.dst_port,
            flags: parsed.flags,
            seq: parsed.seq_number,
            ack: parsed.ack_number,
            window: parsed.window_len,
            max_seg_size: parsed.max_seg_size,
            timestamp: parsed.timestamp,
            payload: parsed.payload.to_vec(),
        });
        Ok(())
    }
}

/// An [Event] with its data copied out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedEvent {
    Connected,
    Accepted(ListenHandle),
    Received(Vec<u8>),
    Sent(u16),
    Closed,
    Error(ConnectionError),
}

/// Records every event, and answers with a configurable verdict per kind.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<(Handle, OwnedEvent)>,
    pub on_accepted: Verdict,
    pub on_received: Verdict,
    pub on_closed: Verdict,
}

impl Recorder {
    /// Concatenation of all data delivered.
    pub fn received(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for (_, event) in self.events.iter() {
            if let OwnedEvent::Received(chunk) = event {
                data.extend_from_slice(chunk);
            }
        }
        data
    }

    pub fn count(&self, f: impl Fn(&OwnedEvent) -> bool) -> usize {
        self.events.iter().filter(|(_, event)| f(event)).count()
    }
}

impl Application for Recorder {
    fn on_event(&mut self, handle: Handle, event: Event) -> Verdict {
        let (event, verdict) = match event {
            Event::Connected => (OwnedEvent::Connected, Verdict::Ok),
            Event::Accepted { listener } => (OwnedEvent::Accepted(listener), self.on_accepted),
            Event::Received(data) => (OwnedEvent::Received(data.to_vec()), self.on_received),
            Event::Sent(len) => (OwnedEvent::Sent(len), Verdict::Ok),
            Event::Closed => (OwnedEvent::Closed, self.on_closed),
            Event::Error(err) => (OwnedEvent::Error(err), Verdict::Ok),
        };
        self.events.push((handle, event));
        verdict
    }
}
