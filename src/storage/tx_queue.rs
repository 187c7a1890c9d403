use alloc::vec::Vec;
use core::fmt;

use super::Full;
use crate::config::TCP_TX_QUEUE_LEN;
use crate::wire::{TcpFlags, TcpSeqNumber};

/// An outgoing segment, either waiting to be sent or waiting to be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSegment {
    pub seq: TcpSeqNumber,
    /// SYN, FIN and PSH; ACK is added when the segment is emitted.
    pub flags: TcpFlags,
    /// MSS option to carry, for SYN segments.
    pub max_seg_size: Option<u16>,
    pub payload: Vec<u8>,
}

impl TxSegment {
    pub fn new(seq: TcpSeqNumber, flags: TcpFlags, payload: &[u8]) -> TxSegment {
        TxSegment {
            seq,
            flags,
            max_seg_size: None,
            payload: Vec::from(payload),
        }
    }

    /// Length in sequence space, counting SYN and FIN.
    pub fn segment_len(&self) -> usize {
        self.payload.len() + self.flags.len()
    }

    /// Sequence number right past this segment.
    pub fn end(&self) -> TcpSeqNumber {
        self.seq + self.segment_len()
    }
}

impl fmt::Display for TxSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}{}", self.seq, self.payload.len(), self.flags)
    }
}

/// A bounded FIFO of outgoing segments, kept in sequence order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxQueue {
    segments: heapless::Vec<TxSegment, TCP_TX_QUEUE_LEN>,
}

impl TxQueue {
    pub const fn new() -> TxQueue {
        TxQueue {
            segments: heapless::Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.segments.is_full()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn front(&self) -> Option<&TxSegment> {
        self.segments.first()
    }

    pub fn back(&self) -> Option<&TxSegment> {
        self.segments.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxSegment> {
        self.segments.iter()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn push_back(&mut self, segment: TxSegment) -> Result<(), Full> {
        self.segments.push(segment).map_err(|_| Full)
    }

    /// Put a segment back at the head of the queue.
    pub fn push_front(&mut self, segment: TxSegment) -> Result<(), Full> {
        self.segments.insert(0, segment).map_err(|_| Full)
    }

    pub fn pop_back(&mut self) -> Option<TxSegment> {
        self.segments.pop()
    }

    pub fn pop_front(&mut self) -> Option<TxSegment> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.segments.remove(0))
        }
    }

    /// Insert a segment before the first queued segment with a higher
    /// sequence number.
    pub fn insert_sorted(&mut self, segment: TxSegment) -> Result<(), Full> {
        let index = self
            .segments
            .iter()
            .position(|queued| queued.seq > segment.seq)
            .unwrap_or(self.segments.len());
        self.segments.insert(index, segment).map_err(|_| Full)
    }

    /// Remove segments from the front while `f` holds for them, returning the
    /// removed segments' flags merged, along with their count.
    pub fn pop_front_while<F>(&mut self, mut f: F) -> (usize, TcpFlags)
    where
        F: FnMut(&TxSegment) -> bool,
    {
        let mut count = 0;
        let mut flags = TcpFlags::empty();
        while self.segments.first().is_some_and(&mut f) {
            flags |= self.segments.remove(0).flags;
            count += 1;
        }
        (count, flags)
    }
}
