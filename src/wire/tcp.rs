use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, ops};

use super::{Error, Result};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
/// Sequence numbers do not have a discontiguity when compared pairwise across a signed overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    pub fn max(self, rhs: Self) -> Self {
        if self > rhs { self } else { rhs }
    }

    pub fn min(self, rhs: Self) -> Self {
        if self < rhs { self } else { rhs }
    }

    /// Signed distance from `rhs` to `self`, i.e. how far `self` lies ahead.
    pub fn offset_from(self, rhs: Self) -> i32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to add to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        if rhs > i32::MAX as usize {
            panic!("attempt to subtract to sequence number with unsigned overflow")
        }
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        if result < 0 {
            panic!("attempt to subtract sequence numbers with underflow")
        }
        result as usize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

/// A read/write wrapper around a Transmission Control Protocol packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;
    pub const FLG_ECE: u16 = 0x040;
    pub const FLG_CWR: u16 = 0x080;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
    pub const OPT_TSTAMP: u8 = 0x08;

    pub const OPT_MSS_LEN: usize = 4;
    pub const OPT_TSTAMP_LEN: usize = 10;
}

pub const HEADER_LEN: usize = field::URGENT.end;

bitflags::bitflags! {
    /// The control bits of a TCP header.
    #[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
    pub struct Flags: u8 {
        const FIN = field::FLG_FIN as u8;
        const SYN = field::FLG_SYN as u8;
        const RST = field::FLG_RST as u8;
        const PSH = field::FLG_PSH as u8;
        const ACK = field::FLG_ACK as u8;
        const URG = field::FLG_URG as u8;
        const ECE = field::FLG_ECE as u8;
        const CWR = field::FLG_CWR as u8;
    }
}

impl Flags {
    /// Return the length of the control flags, in terms of sequence space.
    pub fn len(&self) -> usize {
        self.contains(Flags::SYN) as usize + self.contains(Flags::FIN) as usize
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (Flags::SYN, " syn"),
            (Flags::FIN, " fin"),
            (Flags::RST, " rst"),
            (Flags::PSH, " psh"),
            (Flags::ACK, " ack"),
            (Flags::URG, " urg"),
        ];
        for (flag, name) in names {
            if self.contains(flag) {
                write!(f, "{name}")?;
            }
        }
        Ok(())
    }
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP packet structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is too short.
    /// Returns `Err(Error)` if the header length field has a value smaller
    /// than the minimal header length.
    ///
    /// The result of this check is invalidated by calling [set_header_len].
    ///
    /// [set_header_len]: #method.set_header_len
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::URGENT.end {
            Err(Error)
        } else {
            let header_len = self.header_len() as usize;
            if len < header_len || header_len < field::URGENT.end {
                Err(Error)
            } else {
                Ok(())
            }
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_i32(&data[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        let data = self.buffer.as_ref();
        SeqNumber(NetworkEndian::read_i32(&data[field::ACK_NUM]))
    }

    /// Return the control bits.
    #[inline]
    pub fn flags(&self) -> Flags {
        let data = self.buffer.as_ref();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        Flags::from_bits_truncate(raw as u8)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let data = self.buffer.as_ref();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::CHECKSUM])
    }

    /// Return the urgent pointer field.
    #[inline]
    pub fn urgent_at(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::URGENT])
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn segment_len(&self) -> usize {
        let data = self.buffer.as_ref();
        data.len() - self.header_len() as usize + self.flags().len()
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the options.
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_ref();
        &data[field::OPTIONS(header_len)]
    }

    /// Return a pointer to the payload.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_ref();
        &data[header_len..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_i32(&mut data[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgement number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_i32(&mut data[field::ACK_NUM], value.0)
    }

    /// Set the control bits, keeping the header length.
    #[inline]
    pub fn set_flags(&mut self, value: Flags) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = (raw & 0xf000) | value.bits() as u16;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = (raw & !0xf000) | ((value as u16) / 4) << 12;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::URGENT], value)
    }

    /// Return a pointer to the options.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        let data = self.buffer.as_mut();
        &mut data[field::OPTIONS(header_len)]
    }

    /// Return a mutable pointer to the payload data.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        let data = self.buffer.as_mut();
        &mut data[header_len..]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A representation of a single TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    Timestamp { tsval: u32, tsecr: u32 },
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    /// Decode the option at the start of `buffer`, returning the rest of the
    /// option area along with it.
    ///
    /// A kind without room for its length octet, a length below two, a length
    /// running past the area, or a known kind with the wrong length is an error.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.first().ok_or(Error)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error)? as usize;
                if length < 2 {
                    return Err(Error);
                }
                let data = buffer.get(2..length).ok_or(Error)?;
                match (kind, length) {
                    (field::OPT_END, _) | (field::OPT_NOP, _) => unreachable!(),
                    (field::OPT_MSS, field::OPT_MSS_LEN) => {
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data))
                    }
                    (field::OPT_MSS, _) => return Err(Error),
                    (field::OPT_TSTAMP, field::OPT_TSTAMP_LEN) => {
                        option = TcpOption::Timestamp {
                            tsval: NetworkEndian::read_u32(&data[..4]),
                            tsecr: NetworkEndian::read_u32(&data[4..]),
                        }
                    }
                    (field::OPT_TSTAMP, _) => return Err(Error),
                    (_, _) => option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    pub fn buffer_len(&self) -> usize {
        match *self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => field::OPT_MSS_LEN,
            TcpOption::Timestamp { .. } => field::OPT_TSTAMP_LEN,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match *self {
            TcpOption::EndOfList => {
                length = 1;
                // There may be padding space which also should be initialized.
                for p in buffer.iter_mut() {
                    *p = field::OPT_END;
                }
            }
            TcpOption::NoOperation => {
                length = 1;
                buffer[0] = field::OPT_NOP;
            }
            _ => {
                length = self.buffer_len();
                buffer[1] = length as u8;
                match self {
                    &TcpOption::EndOfList | &TcpOption::NoOperation => unreachable!(),
                    &TcpOption::MaxSegmentSize(value) => {
                        buffer[0] = field::OPT_MSS;
                        NetworkEndian::write_u16(&mut buffer[2..], value)
                    }
                    &TcpOption::Timestamp { tsval, tsecr } => {
                        buffer[0] = field::OPT_TSTAMP;
                        NetworkEndian::write_u32(&mut buffer[2..], tsval);
                        NetworkEndian::write_u32(&mut buffer[6..], tsecr);
                    }
                    &TcpOption::Unknown {
                        kind,
                        data: provided,
                    } => {
                        buffer[0] = kind;
                        buffer[2..].copy_from_slice(provided)
                    }
                }
            }
        }
        &mut buffer[length..]
    }
}

/// The value carried by a timestamp option (RFC 7323).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TcpTimestampRepr {
    pub tsval: u32,
    pub tsecr: u32,
}

impl TcpTimestampRepr {
    pub const fn new(tsval: u32, tsecr: u32) -> Self {
        Self { tsval, tsecr }
    }
}

/// Walk an option area, collecting the options this stack understands.
///
/// Parsing stops at end-of-list or at the end of the area. A malformed option
/// anywhere in the area rejects the area as a whole, so the caller never acts
/// on a prefix of a damaged header.
pub fn parse_options(mut options: &[u8]) -> Result<(Option<u16>, Option<TcpTimestampRepr>)> {
    let mut max_seg_size = None;
    let mut timestamp = None;
    while !options.is_empty() {
        let (next_options, option) = TcpOption::parse(options)?;
        match option {
            TcpOption::EndOfList => break,
            TcpOption::NoOperation => (),
            TcpOption::MaxSegmentSize(value) => max_seg_size = Some(value),
            TcpOption::Timestamp { tsval, tsecr } => {
                timestamp = Some(TcpTimestampRepr::new(tsval, tsecr))
            }
            TcpOption::Unknown { .. } => (),
        }
        options = next_options;
    }
    Ok((max_seg_size, timestamp))
}

/// A high-level representation of a Transmission Control Protocol packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: Flags,
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
    pub window_len: u16,
    pub max_seg_size: Option<u16>,
    pub timestamp: Option<TcpTimestampRepr>,
    pub payload: &'a [u8],
}

impl<'a> Repr<'a> {
    /// Parse a Transmission Control Protocol packet and return a high-level representation.
    ///
    /// The checksum is not verified; that is left to whoever delivered the segment.
    /// A damaged option area does not fail the parse: the segment is still
    /// usable, it just carries no options.
    pub fn parse<T>(packet: &Packet<&'a T>) -> Result<Repr<'a>>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;

        let (max_seg_size, timestamp) = match parse_options(packet.options()) {
            Ok(options) => options,
            Err(_) => {
                net_debug!(
                    "tcp: malformed option area from port {}, options ignored",
                    packet.src_port()
                );
                (None, None)
            }
        };

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            flags: packet.flags(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            window_len: packet.window_len(),
            max_seg_size,
            timestamp,
            payload: packet.payload(),
        })
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    ///
    /// This should be used for buffer space calculations.
    /// The TCP header length is a multiple of 4.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end;
        if self.max_seg_size.is_some() {
            length += field::OPT_MSS_LEN;
        }
        if self.timestamp.is_some() {
            // Two NOPs keep the timestamp aligned.
            length += 2 + field::OPT_TSTAMP_LEN;
        }
        if length % 4 != 0 {
            length += 4 - length % 4;
        }
        length
    }

    /// Return the length of a packet that will be emitted from this high-level representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    /// Return the length of the segment, in terms of sequence space.
    pub fn segment_len(&self) -> usize {
        self.payload.len() + self.flags.len()
    }

    /// Return whether the segment has no flags set (except PSH) and no data.
    pub fn is_empty(&self) -> bool {
        (self.flags - Flags::PSH - Flags::ACK).is_empty() && self.payload.is_empty()
    }

    /// Emit a high-level representation into a Transmission Control Protocol packet.
    ///
    /// The checksum field is left zeroed.
    pub fn emit<T>(&self, packet: &mut Packet<&mut T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]> + ?Sized,
    {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number);
        packet.set_window_len(self.window_len);
        packet.set_header_len(self.header_len() as u8);
        packet.set_flags(self.flags);
        {
            let mut options = packet.options_mut();
            if let Some(value) = self.max_seg_size {
                let tmp = options;
                options = TcpOption::MaxSegmentSize(value).emit(tmp);
            }
            if let Some(timestamp) = self.timestamp {
                let tmp = options;
                options = TcpOption::NoOperation.emit(tmp);
                let tmp = options;
                options = TcpOption::NoOperation.emit(tmp);
                let tmp = options;
                options = TcpOption::Timestamp {
                    tsval: timestamp.tsval,
                    tsecr: timestamp.tsecr,
                }
                .emit(tmp);
            }

            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }
        packet.set_urgent_at(0);
        packet.payload_mut()[..self.payload.len()].copy_from_slice(self.payload);
        packet.set_checksum(0);
    }
}

impl<T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Cannot use Repr::parse because we don't have the IP addresses.
        write!(f, "TCP src={} dst={}", self.src_port(), self.dst_port())?;
        write!(f, "{}", self.flags())?;
        write!(f, " seq={}", self.seq_number())?;
        if self.flags().contains(Flags::ACK) {
            write!(f, " ack={}", self.ack_number())?;
        }
        write!(f, " win={}", self.window_len())?;
        write!(f, " len={}", self.payload().len())?;
        Ok(())
    }
}

impl<'a> fmt::Display for Repr<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TCP src={} dst={}", self.src_port, self.dst_port)?;
        write!(f, "{}", self.flags)?;
        write!(f, " seq={}", self.seq_number)?;
        if self.flags.contains(Flags::ACK) {
            write!(f, " ack={}", self.ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        write!(f, " len={}", self.payload.len())?;
        if let Some(max_seg_size) = self.max_seg_size {
            write!(f, " mss={max_seg_size}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 28] = [
        0xbf, 0x00, 0x00, 0x50, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x60, 0x19, 0x01,
        0x23, 0x00, 0x00, 0x02, 0x00, 0x02, 0x04, 0x05, 0xb4, 0xaa, 0x00, 0x00, 0xff,
    ];

    static OPTION_BYTES: [u8; 4] = [0x02, 0x04, 0x05, 0xb4];

    static PAYLOAD_BYTES: [u8; 4] = [0xaa, 0x00, 0x00, 0xff];

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_unchecked(&PACKET_BYTES[..]);
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(0x01234567));
        assert_eq!(packet.ack_number(), SeqNumber(0x89abcdefu32 as i32));
        assert_eq!(packet.header_len(), 24);
        assert_eq!(packet.flags(), Flags::FIN | Flags::PSH | Flags::ACK);
        assert_eq!(packet.window_len(), 0x0123);
        assert_eq!(packet.urgent_at(), 0x0200);
        assert_eq!(packet.options(), &OPTION_BYTES[..]);
        assert_eq!(packet.payload(), &PAYLOAD_BYTES[..]);
        assert_eq!(packet.segment_len(), 5);
    }

    #[test]
    fn test_check_len() {
        assert_eq!(Packet::new_checked(&PACKET_BYTES[..19]), Err(Error));
        // Data offset of 4 words is below the minimal header.
        let mut bytes = PACKET_BYTES;
        bytes[12] = 0x40;
        assert_eq!(Packet::new_checked(&bytes[..]), Err(Error));
        // Data offset of 15 words runs past the buffer.
        bytes[12] = 0xf0;
        assert_eq!(Packet::new_checked(&bytes[..]), Err(Error));
        assert!(Packet::new_checked(&PACKET_BYTES[..]).is_ok());
    }

    #[test]
    fn test_parse_repr() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr.src_port, 48896);
        assert_eq!(repr.max_seg_size, Some(1460));
        assert_eq!(repr.timestamp, None);
        assert_eq!(repr.payload, &PAYLOAD_BYTES[..]);
        assert_eq!(repr.segment_len(), 5);
    }

    #[test]
    fn test_emit_then_parse_with_options() {
        let repr = Repr {
            src_port: 80,
            dst_port: 49500,
            flags: Flags::SYN | Flags::ACK,
            seq_number: SeqNumber(-2),
            ack_number: SeqNumber(1001),
            window_len: 5840,
            max_seg_size: Some(536),
            timestamp: Some(TcpTimestampRepr::new(7, 9)),
            payload: &[],
        };
        assert_eq!(repr.header_len(), 20 + 4 + 12);
        let mut bytes = [0xa5u8; 36];
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.checksum(), 0);
        assert_eq!(Repr::parse(&packet).unwrap(), repr);
    }

    #[test]
    fn test_parse_options() {
        assert_eq!(parse_options(&[]), Ok((None, None)));
        assert_eq!(
            parse_options(&[0x01, 0x01, 0x02, 0x04, 0x02, 0x18, 0x00, 0x02, 0x04]),
            Ok((Some(536), None))
        );
        assert_eq!(
            parse_options(&[0x01, 0x01, 0x08, 0x0a, 0, 0, 0, 1, 0, 0, 0, 2]),
            Ok((None, Some(TcpTimestampRepr::new(1, 2))))
        );
        // Unknown kinds are skipped by their length.
        assert_eq!(
            parse_options(&[0x04, 0x02, 0x02, 0x04, 0x05, 0xb4]),
            Ok((Some(1460), None))
        );
    }

    #[test]
    fn test_parse_options_malformed() {
        // Zero length.
        assert_eq!(parse_options(&[0x02, 0x00, 0x05, 0xb4]), Err(Error));
        // Length running past the option area.
        assert_eq!(parse_options(&[0x02, 0x04, 0x05]), Err(Error));
        // Kind without a length octet.
        assert_eq!(parse_options(&[0x01, 0x02]), Err(Error));
        // Known kinds with the wrong length.
        assert_eq!(parse_options(&[0x02, 0x03, 0x05]), Err(Error));
        assert_eq!(parse_options(&[0x08, 0x06, 0, 0, 0, 1]), Err(Error));
        // A damaged option after a good one still rejects the whole area.
        assert_eq!(
            parse_options(&[0x02, 0x04, 0x05, 0xb4, 0x03, 0x09, 0x00]),
            Err(Error)
        );
    }

    #[test]
    fn test_malformed_options_do_not_fail_repr() {
        let mut bytes = PACKET_BYTES;
        bytes[21] = 0x09;
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let repr = Repr::parse(&packet).unwrap();
        assert_eq!(repr.max_seg_size, None);
        assert_eq!(repr.payload, &PAYLOAD_BYTES[..]);
    }

    #[test]
    fn test_seq_number_ordering_wraps() {
        let before = SeqNumber(i32::MAX);
        let after = before + 10;
        assert!(after > before);
        assert_eq!(after - before, 10);
        assert_eq!(before.offset_from(after), -10);
        assert_eq!(SeqNumber(-1) + 1, SeqNumber(0));
        assert!(SeqNumber(-1) < SeqNumber(0));
        assert_eq!(SeqNumber(5).max(SeqNumber(-5)), SeqNumber(5));
    }
}
