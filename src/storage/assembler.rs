use alloc::vec::Vec;
use core::fmt;

use crate::config::ASSEMBLER_MAX_SEGMENT_COUNT;
use crate::wire::TcpSeqNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooManyHolesError;

impl fmt::Display for TooManyHolesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "too many holes")
    }
}

impl core::error::Error for TooManyHolesError {}

/// A segment that arrived ahead of the receive sequence and waits for the gap
/// before it to be filled.
///
/// A FIN, when present, occupies the sequence number right after the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OooSegment {
    pub seq: TcpSeqNumber,
    pub fin: bool,
    pub data: Vec<u8>,
}

impl OooSegment {
    pub fn new(seq: TcpSeqNumber, data: &[u8], fin: bool) -> OooSegment {
        OooSegment {
            seq,
            fin,
            data: Vec::from(data),
        }
    }

    /// Number of data octets.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && !self.fin
    }

    /// Length in sequence space, counting the FIN.
    pub fn segment_len(&self) -> usize {
        self.data.len() + self.fin as usize
    }

    /// Sequence number just past the data, excluding the FIN.
    pub fn data_end(&self) -> TcpSeqNumber {
        self.seq + self.data.len()
    }

    /// Cut the segment down to `len` data octets. The FIN sits past the end,
    /// so it goes too.
    fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.fin = false;
    }
}

impl fmt::Display for OooSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}", self.seq, self.data.len())?;
        if self.fin {
            write!(f, "+fin")?;
        }
        Ok(())
    }
}

/// The out-of-sequence queue of a connection.
///
/// Segments are kept in ascending sequence order and never overlap in
/// their data. The queue owns copies of the payloads, so the receive buffer
/// of the segment that carried them can be released right away.
///
/// Currently, up to a hardcoded limit of [ASSEMBLER_MAX_SEGMENT_COUNT]
/// segments can be held.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Assembler {
    segments: heapless::Vec<OooSegment, ASSEMBLER_MAX_SEGMENT_COUNT>,
}

impl fmt::Display for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for segment in self.segments.iter() {
            write!(f, "{segment} ")?;
        }
        write!(f, "]")?;
        Ok(())
    }
}

impl Assembler {
    /// Create a new, empty queue.
    pub const fn new() -> Assembler {
        Assembler {
            segments: heapless::Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Return whether the queue holds no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn front(&self) -> Option<&OooSegment> {
        self.segments.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OooSegment> {
        self.segments.iter()
    }

    /// Queue a segment that starts ahead of the receive sequence.
    ///
    /// `window_end` is the right edge of the receive window; anything past it
    /// is cut off. Returns `Ok(false)` if the segment brought nothing new and
    /// was dropped.
    ///
    /// Overlaps are resolved in favour of keeping the queue disjoint:
    ///  * a segment lying inside the preceding one is dropped;
    ///  * a segment starting where a queued one starts replaces it only if it
    ///    carries more data;
    ///  * otherwise the tail of the preceding segment is cut back to the new
    ///    start;
    ///  * successors entirely covered by the new segment are removed, handing
    ///    their FIN to it, and the new segment is cut back to the first
    ///    successor it still overlaps;
    ///  * a FIN ends the stream, so everything after it is discarded, and
    ///    nothing is queued after a FIN.
    pub fn insert(
        &mut self,
        mut segment: OooSegment,
        window_end: TcpSeqNumber,
    ) -> Result<bool, TooManyHolesError> {
        let room = window_end.offset_from(segment.seq).max(0) as usize;
        if segment.segment_len() > room {
            segment.truncate(room);
        }
        if segment.is_empty() {
            return Ok(false);
        }

        let index = self
            .segments
            .iter()
            .position(|queued| queued.seq >= segment.seq)
            .unwrap_or(self.segments.len());

        if index > 0 {
            let prev = &self.segments[index - 1];
            if prev.fin || (!segment.fin && prev.data_end() >= segment.data_end()) {
                return Ok(false);
            }
        }

        if let Some(queued) = self.segments.get(index) {
            if queued.seq == segment.seq {
                if segment.len() <= queued.len() {
                    return Ok(false);
                }
                self.segments.remove(index);
            }
        }

        let covered = if segment.fin {
            self.segments.len() - index
        } else {
            self.segments[index..]
                .iter()
                .take_while(|next| segment.data_end() >= next.data_end())
                .count()
        };
        if covered == 0 && self.segments.is_full() {
            return Err(TooManyHolesError);
        }

        if segment.fin {
            self.segments.truncate(index);
        } else {
            for _ in 0..covered {
                let next = self.segments.remove(index);
                segment.fin |= next.fin;
            }
            if let Some(next) = self.segments.get(index) {
                if segment.data_end() > next.seq {
                    segment.truncate(next.seq - segment.seq);
                }
            }
        }

        if index > 0 {
            let prev = &mut self.segments[index - 1];
            if prev.data_end() > segment.seq {
                let len = segment.seq - prev.seq;
                prev.truncate(len);
            }
        }

        self.segments
            .insert(index, segment)
            .map_err(|_| TooManyHolesError)?;
        Ok(true)
    }

    /// Drop every queued segment that ends at or before `end`, which is the
    /// end of newly received in-sequence data. Returns whether one of them
    /// carried a FIN.
    pub fn remove_covered(&mut self, end: TcpSeqNumber) -> bool {
        let mut fin = false;
        while self.segments.first().is_some_and(|front| end >= front.data_end()) {
            fin |= self.segments.remove(0).fin;
        }
        fin
    }

    /// Take the front segment if it starts exactly at `seq`.
    pub fn pop_front_at(&mut self, seq: TcpSeqNumber) -> Option<OooSegment> {
        if self.segments.first()?.seq == seq {
            Some(self.segments.remove(0))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const WINDOW_END: TcpSeqNumber = TcpSeqNumber(100_000);

    fn seg(seq: i32, len: usize) -> OooSegment {
        let data: Vec<u8> = (0..len).map(|i| (seq as usize + i) as u8).collect();
        OooSegment::new(TcpSeqNumber(seq), &data, false)
    }

    fn fin(seq: i32, len: usize) -> OooSegment {
        OooSegment {
            fin: true,
            ..seg(seq, len)
        }
    }

    fn contents(assr: &Assembler) -> Vec<(i32, usize, bool)> {
        assr.iter().map(|s| (s.seq.0, s.len(), s.fin)).collect()
    }

    fn assert_well_formed(assr: &Assembler) {
        let segments: Vec<&OooSegment> = assr.iter().collect();
        for pair in segments.windows(2) {
            assert!(pair[0].data_end() <= pair[1].seq, "overlap in {assr}");
            assert!(!pair[0].fin, "segment queued after a FIN in {assr}");
        }
        for segment in segments {
            // Data must be the octets that live at those sequence numbers.
            for (i, octet) in segment.data.iter().enumerate() {
                assert_eq!(*octet, (segment.seq.0 as usize + i) as u8);
            }
        }
    }

    #[test]
    fn test_new() {
        let assr = Assembler::new();
        assert!(assr.is_empty());
        assert_eq!(assr.front(), None);
    }

    #[test]
    fn test_insert_in_order() {
        let mut assr = Assembler::new();
        assert_eq!(assr.insert(seg(300, 50), WINDOW_END), Ok(true));
        assert_eq!(assr.insert(seg(100, 50), WINDOW_END), Ok(true));
        assert_eq!(assr.insert(seg(200, 50), WINDOW_END), Ok(true));
        assert_eq!(
            contents(&assr),
            vec![(100, 50, false), (200, 50, false), (300, 50, false)]
        );
        assert_well_formed(&assr);
    }

    #[test]
    fn test_same_start_keeps_longer() {
        let mut assr = Assembler::new();
        assert_eq!(assr.insert(seg(100, 50), WINDOW_END), Ok(true));
        assert_eq!(assr.insert(seg(100, 20), WINDOW_END), Ok(false));
        assert_eq!(assr.insert(seg(100, 50), WINDOW_END), Ok(false));
        assert_eq!(contents(&assr), vec![(100, 50, false)]);
        assert_eq!(assr.insert(seg(100, 80), WINDOW_END), Ok(true));
        assert_eq!(contents(&assr), vec![(100, 80, false)]);
    }

    #[test]
    fn test_trims_predecessor() {
        let mut assr = Assembler::new();
        assr.insert(seg(100, 50), WINDOW_END).unwrap();
        assr.insert(seg(120, 50), WINDOW_END).unwrap();
        assert_eq!(contents(&assr), vec![(100, 20, false), (120, 50, false)]);
        assert_well_formed(&assr);
    }

    #[test]
    fn test_contained_in_predecessor_dropped() {
        let mut assr = Assembler::new();
        assr.insert(seg(100, 50), WINDOW_END).unwrap();
        assert_eq!(assr.insert(seg(110, 20), WINDOW_END), Ok(false));
        assert_eq!(assr.insert(seg(130, 20), WINDOW_END), Ok(false));
        assert_eq!(contents(&assr), vec![(100, 50, false)]);
        assert_eq!(assr.insert(seg(130, 30), WINDOW_END), Ok(true));
        assert_eq!(contents(&assr), vec![(100, 30, false), (130, 30, false)]);
        assert_well_formed(&assr);
    }

    #[test]
    fn test_trims_to_successor() {
        let mut assr = Assembler::new();
        assr.insert(seg(200, 50), WINDOW_END).unwrap();
        assr.insert(seg(150, 80), WINDOW_END).unwrap();
        assert_eq!(contents(&assr), vec![(150, 50, false), (200, 50, false)]);
        assert_well_formed(&assr);
    }

    #[test]
    fn test_removes_covered_successors() {
        let mut assr = Assembler::new();
        assr.insert(seg(200, 10), WINDOW_END).unwrap();
        assr.insert(seg(220, 10), WINDOW_END).unwrap();
        assr.insert(seg(260, 40), WINDOW_END).unwrap();
        assr.insert(seg(190, 80), WINDOW_END).unwrap();
        assert_eq!(contents(&assr), vec![(190, 70, false), (260, 40, false)]);
        assert_well_formed(&assr);
    }

    #[test]
    fn test_covered_fin_is_inherited() {
        let mut assr = Assembler::new();
        assr.insert(fin(200, 10), WINDOW_END).unwrap();
        assr.insert(seg(150, 60), WINDOW_END).unwrap();
        assert_eq!(contents(&assr), vec![(150, 60, true)]);
    }

    #[test]
    fn test_fin_discards_followers() {
        let mut assr = Assembler::new();
        assr.insert(seg(300, 10), WINDOW_END).unwrap();
        assr.insert(seg(400, 10), WINDOW_END).unwrap();
        assr.insert(fin(200, 10), WINDOW_END).unwrap();
        assert_eq!(contents(&assr), vec![(200, 10, true)]);
    }

    #[test]
    fn test_nothing_after_fin() {
        let mut assr = Assembler::new();
        assr.insert(fin(200, 10), WINDOW_END).unwrap();
        assert_eq!(assr.insert(seg(300, 10), WINDOW_END), Ok(false));
        assert_eq!(contents(&assr), vec![(200, 10, true)]);
    }

    #[test]
    fn test_clipped_to_window() {
        let mut assr = Assembler::new();
        assert_eq!(assr.insert(fin(100, 50), TcpSeqNumber(130)), Ok(true));
        assert_eq!(contents(&assr), vec![(100, 30, false)]);
    }

    #[test]
    fn test_too_many_holes() {
        let mut assr = Assembler::new();
        for i in 0..ASSEMBLER_MAX_SEGMENT_COUNT as i32 {
            assr.insert(seg(100 + i * 20, 10), WINDOW_END).unwrap();
        }
        assert_eq!(assr.insert(seg(5000, 10), WINDOW_END), Err(TooManyHolesError));
        // A segment covering a queued one still fits.
        assert_eq!(assr.insert(seg(95, 20), WINDOW_END), Ok(true));
        assert_well_formed(&assr);
    }

    #[test]
    fn test_remove_covered_and_pop() {
        let mut assr = Assembler::new();
        assr.insert(seg(100, 10), WINDOW_END).unwrap();
        assr.insert(fin(120, 10), WINDOW_END).unwrap();
        assert!(!assr.remove_covered(TcpSeqNumber(105)));
        assert_eq!(assr.len(), 2);
        assert!(!assr.remove_covered(TcpSeqNumber(110)));
        assert_eq!(assr.pop_front_at(TcpSeqNumber(110)), None);
        assert_eq!(assr.pop_front_at(TcpSeqNumber(120)), Some(fin(120, 10)));
        assert!(assr.is_empty());
    }

    #[test]
    fn test_random_overlaps_stay_disjoint() {
        // Deterministic pseudo-random walk over overlapping inserts.
        let mut state = 0x2545_f491u32;
        let mut assr = Assembler::new();
        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let seq = (state % 400) as i32;
            let len = (state >> 16) as usize % 60 + 1;
            let _ = assr.insert(seg(1000 + seq, len), WINDOW_END);
            assert_well_formed(&assr);
            if assr.len() == ASSEMBLER_MAX_SEGMENT_COUNT {
                assr.clear();
            }
        }
    }
}
