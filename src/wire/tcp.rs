//! The TCP segment codec.
//!
//! Three representations are provided, from raw to cooked: [`Packet`]
//! wraps an octet buffer with field accessors, [`Repr`] is the compact
//! parsed header, and [`Segment`] is the owned unit a connection
//! constructs, queues for retransmission, and hands to the network layer.
//!
//! The checksum is computed over a pseudo-header containing the network
//! addresses, which the codec does not know by itself; both directions
//! therefore take the address pair explicitly. A sender always computes a
//! fresh checksum at emission — there is no pass-through of a stale value.

use core::{cmp, fmt, ops};
use std::net::IpAddr;

use byteorder::{ByteOrder, NetworkEndian};

use super::{checksum, Error, Result};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo
/// 2<sup>32</sup>. Comparisons are wrapping, so ordering is meaningful for
/// any two numbers less than half the sequence space apart, with no
/// discontinuity at the unsigned overflow.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
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
            panic!("attempt to subtract from sequence number with unsigned overflow")
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

    /// The distance from `rhs` up to `self`.
    ///
    /// # Panics
    ///
    /// Panics when `rhs` is ahead of `self` in the sequence space.
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

/// The set of TCP flags of one segment.
///
/// The nine flag bits share a 16-bit word with the header length; this
/// type holds only the low nine bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

mod field {
    #![allow(non_snake_case)]

    use crate::wire::field::Field;

    pub(super) const SRC_PORT: Field = 0..2;
    pub(super) const DST_PORT: Field = 2..4;
    pub(super) const SEQ_NUM: Field = 4..8;
    pub(super) const ACK_NUM: Field = 8..12;
    pub(super) const FLAGS: Field = 12..14;
    pub(super) const WIN_SIZE: Field = 14..16;
    pub(super) const CHECKSUM: Field = 16..18;
    pub(super) const URGENT: Field = 18..20;

    pub(super) fn OPTIONS(length: u8) -> Field {
        URGENT.end..(length as usize)
    }

    pub(super) const FLG_FIN: u16 = 0x001;
    pub(super) const FLG_SYN: u16 = 0x002;
    pub(super) const FLG_RST: u16 = 0x004;
    pub(super) const FLG_PSH: u16 = 0x008;
    pub(super) const FLG_ACK: u16 = 0x010;
    pub(super) const FLG_URG: u16 = 0x020;
    pub(super) const FLG_ECE: u16 = 0x040;
    pub(super) const FLG_CWR: u16 = 0x080;
    pub(super) const FLG_NS: u16 = 0x100;

    pub(super) const OPT_END: u8 = 0x00;
    pub(super) const OPT_NOP: u8 = 0x01;
    pub(super) const OPT_MSS: u8 = 0x02;
    pub(super) const OPT_WS: u8 = 0x03;
    pub(super) const OPT_SACKPERM: u8 = 0x04;
    pub(super) const OPT_SACKRNG: u8 = 0x05;
    pub(super) const OPT_TS: u8 = 0x08;
}

macro_rules! flag_accessors {
    ($($get:ident, $set:ident, $bit:expr, $doc:literal;)*) => {
        $(
            #[doc = concat!("Return the ", $doc, " flag.")]
            #[inline]
            pub fn $get(&self) -> bool {
                self.0 & $bit != 0
            }

            #[doc = concat!("Set the ", $doc, " flag.")]
            #[inline]
            pub fn $set(&mut self, value: bool) {
                let flag = if value { $bit } else { 0 };
                self.0 = (self.0 & !$bit) | flag;
            }
        )*
    };
}

impl Flags {
    flag_accessors! {
        fin, set_fin, field::FLG_FIN, "FIN";
        syn, set_syn, field::FLG_SYN, "SYN";
        rst, set_rst, field::FLG_RST, "RST";
        psh, set_psh, field::FLG_PSH, "PSH";
        ack, set_ack, field::FLG_ACK, "ACK";
        urg, set_urg, field::FLG_URG, "URG";
        ece, set_ece, field::FLG_ECE, "ECE";
        cwr, set_cwr, field::FLG_CWR, "CWR";
        ns, set_ns, field::FLG_NS, "NS";
    }

    /// Return the length of the control flags, in terms of sequence space.
    ///
    /// SYN and FIN each occupy one position of the sequence space.
    pub fn sequence_len(self) -> usize {
        usize::from(self.syn()) + usize::from(self.fin())
    }

    /// Whether at most one of SYN, FIN, RST is set.
    ///
    /// Segments violating this are accepted by the codec but must be
    /// discarded by the connection.
    pub fn exclusive(self) -> bool {
        u8::from(self.syn()) + u8::from(self.fin()) + u8::from(self.rst()) <= 1
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.syn() {
            write!(f, "S")?
        }
        if self.fin() {
            write!(f, "F")?
        }
        if self.rst() {
            write!(f, "R")?
        }
        if self.ack() {
            write!(f, "A")?
        }
        if self.psh() {
            write!(f, "P")?
        }
        if self.urg() {
            write!(f, "U")?
        }
        Ok(())
    }
}

/// The verdict of checksum verification on a received segment.
///
/// The original wire value zero means the sender did not supply a
/// checksum; such segments are accepted. A `Wrong` segment must never be
/// applied to connection state and is dropped by the demultiplexer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checksum {
    /// The checksum field validated against the segment contents.
    Correct,
    /// The checksum field was zero, i.e. not specified by the sender.
    Absent,
    /// The checksum field did not validate; the segment must be dropped.
    Wrong,
}

/// A read/write wrapper around a TCP segment buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TCP segment structure.
    pub fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [`new_unchecked`] and [`check_len`].
    ///
    /// [`new_unchecked`]: #method.new_unchecked
    /// [`check_len`]: #method.check_len
    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Packet::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    /// Ensure that no header accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is too short and
    /// `Err(Error::Malformed)` if the header length field has a value
    /// smaller than the minimal header length.
    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < field::URGENT.end {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len() as usize;
        if len < header_len {
            Err(Error::Truncated)
        } else if header_len < field::URGENT.end {
            Err(Error::Malformed)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    /// Return the sequence number field.
    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    /// Return the acknowledgment number field.
    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        Flags(NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS]) & 0x1ff)
    }

    /// Return the header length, in octets.
    #[inline]
    pub fn header_len(&self) -> u8 {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS]);
        ((raw >> 12) * 4) as u8
    }

    /// Return the window size field.
    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WIN_SIZE])
    }

    /// Return the checksum field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    /// Return the urgent pointer field.
    #[inline]
    pub fn urgent_at(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::URGENT])
    }

    /// Return the options area of the header.
    #[inline]
    pub fn options(&self) -> &[u8] {
        &self.buffer.as_ref()[field::OPTIONS(self.header_len())]
    }

    /// Return the payload following the header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.header_len() as usize..]
    }

    /// Validate the segment checksum against the pseudo-header.
    ///
    /// # Panics
    ///
    /// Panics when `src_addr` and `dst_addr` belong to different address
    /// families.
    pub fn verify_checksum(&self, src_addr: &IpAddr, dst_addr: &IpAddr) -> Checksum {
        if self.checksum() == 0 {
            return Checksum::Absent;
        }
        let data = self.buffer.as_ref();
        let combined = checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, data.len() as u32),
            checksum::data(data),
        ]);
        if combined == !0 {
            Checksum::Correct
        } else {
            Checksum::Wrong
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the source port field.
    #[inline]
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    #[inline]
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    #[inline]
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgment number field.
    #[inline]
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0)
    }

    /// Set the flag bits, leaving the header length untouched.
    #[inline]
    pub fn set_flags(&mut self, Flags(flags): Flags) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]) & !0x0fff;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw | (flags & 0x1ff))
    }

    /// Set the header length, in octets.
    #[inline]
    pub fn set_header_len(&mut self, value: u8) {
        let data = self.buffer.as_mut();
        let raw = NetworkEndian::read_u16(&data[field::FLAGS]);
        let raw = (raw & !0xf000) | (u16::from(value) / 4) << 12;
        NetworkEndian::write_u16(&mut data[field::FLAGS], raw)
    }

    /// Set the window size field.
    #[inline]
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WIN_SIZE], value)
    }

    /// Set the checksum field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value)
    }

    /// Set the urgent pointer field.
    #[inline]
    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], value)
    }

    /// Return the options area of the header, mutably.
    #[inline]
    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.buffer.as_mut()[field::OPTIONS(header_len)]
    }

    /// Return the payload following the header, mutably.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[header_len..]
    }

    /// Compute and fill in the checksum over the pseudo-header.
    ///
    /// Any previous checksum value is discarded; the sender never passes a
    /// stale checksum through.
    ///
    /// # Panics
    ///
    /// Panics when `src_addr` and `dst_addr` belong to different address
    /// families.
    pub fn fill_checksum(&mut self, src_addr: &IpAddr, dst_addr: &IpAddr) {
        self.set_checksum(0);
        let value = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header(src_addr, dst_addr, data.len() as u32),
                checksum::data(data),
            ])
        };
        self.set_checksum(value)
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A single parsed TCP option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    /// End of the option list; also used to pad the header.
    EndOfList,
    /// A no-operation padding byte.
    NoOperation,
    /// The maximum segment size the sender is willing to receive.
    MaxSegmentSize(u16),
    /// The window scaling shift announced with a SYN.
    WindowScale(u8),
    /// Permission to use selective acknowledgments on this connection.
    SackPermitted,
    /// Up to three selectively acknowledged ranges.
    SackRange([Option<(u32, u32)>; 3]),
    /// The timestamp value and echo reply of RFC 7323.
    Timestamps {
        /// The sender's timestamp clock value.
        value: u32,
        /// The timestamp being echoed back to the peer.
        echo: u32,
    },
    /// Any option this implementation does not recognize.
    Unknown {
        /// The option type tag.
        kind: u8,
        /// The option value bytes, without the type and length octets.
        data: &'a [u8],
    },
}

impl<'a> TcpOption<'a> {
    /// Parse one option from the front of `buffer`, returning the rest.
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.first().ok_or(Error::Truncated)? {
            field::OPT_END => {
                length = 1;
                option = TcpOption::EndOfList;
            }
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error::Truncated)? as usize;
                let data = buffer.get(2..length).ok_or(Error::Truncated)?;
                match (kind, length) {
                    (field::OPT_MSS, 4) => {
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data))
                    }
                    (field::OPT_MSS, _) => return Err(Error::Malformed),
                    (field::OPT_WS, 3) => option = TcpOption::WindowScale(data[0]),
                    (field::OPT_WS, _) => return Err(Error::Malformed),
                    (field::OPT_SACKPERM, 2) => option = TcpOption::SackPermitted,
                    (field::OPT_SACKPERM, _) => return Err(Error::Malformed),
                    (field::OPT_SACKRNG, n) => {
                        if n < 10 || (n - 2) % 8 != 0 {
                            return Err(Error::Malformed);
                        }
                        // A remote can announce four ranges but the forth
                        // carries no information we act on; three are kept.
                        let mut sack_ranges: [Option<(u32, u32)>; 3] = [None; 3];
                        sack_ranges.iter_mut().enumerate().for_each(|(i, range)| {
                            let left = i * 8;
                            *range = if left < data.len() {
                                let mid = left + 4;
                                let right = mid + 4;
                                Some((
                                    NetworkEndian::read_u32(&data[left..mid]),
                                    NetworkEndian::read_u32(&data[mid..right]),
                                ))
                            } else {
                                None
                            };
                        });
                        option = TcpOption::SackRange(sack_ranges);
                    }
                    (field::OPT_TS, 10) => {
                        option = TcpOption::Timestamps {
                            value: NetworkEndian::read_u32(&data[0..4]),
                            echo: NetworkEndian::read_u32(&data[4..8]),
                        }
                    }
                    (field::OPT_TS, _) => return Err(Error::Malformed),
                    (_, _) => option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((&buffer[length..], option))
    }

    /// The number of octets this option occupies when emitted.
    pub fn buffer_len(&self) -> usize {
        match self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackRange(s) => s.iter().filter(|s| s.is_some()).count() * 8 + 2,
            TcpOption::Timestamps { .. } => 10,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Write this option to the front of `buffer`, returning the rest.
    pub fn emit<'b>(&self, buffer: &'b mut [u8]) -> &'b mut [u8] {
        let length;
        match *self {
            TcpOption::EndOfList => {
                length = 1;
                // Remaining padding space is initialized as well.
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
                match *self {
                    TcpOption::EndOfList | TcpOption::NoOperation => unreachable!(),
                    TcpOption::MaxSegmentSize(value) => {
                        buffer[0] = field::OPT_MSS;
                        NetworkEndian::write_u16(&mut buffer[2..], value)
                    }
                    TcpOption::WindowScale(value) => {
                        buffer[0] = field::OPT_WS;
                        buffer[2] = value;
                    }
                    TcpOption::SackPermitted => {
                        buffer[0] = field::OPT_SACKPERM;
                    }
                    TcpOption::SackRange(ranges) => {
                        buffer[0] = field::OPT_SACKRNG;
                        ranges
                            .iter()
                            .filter_map(|r| r.as_ref())
                            .enumerate()
                            .for_each(|(i, &(first, second))| {
                                let pos = i * 8 + 2;
                                NetworkEndian::write_u32(&mut buffer[pos..], first);
                                NetworkEndian::write_u32(&mut buffer[pos + 4..], second);
                            });
                    }
                    TcpOption::Timestamps { value, echo } => {
                        buffer[0] = field::OPT_TS;
                        NetworkEndian::write_u32(&mut buffer[2..6], value);
                        NetworkEndian::write_u32(&mut buffer[6..10], echo);
                    }
                    TcpOption::Unknown {
                        kind,
                        data: provided,
                    } => {
                        buffer[0] = kind;
                        buffer[2..2 + provided.len()].copy_from_slice(provided)
                    }
                }
            }
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of a TCP segment header.
///
/// The ACK and URG flag bits are derived from the validity of
/// [`ack_number`](#structfield.ack_number) and
/// [`urgent`](#structfield.urgent) at emission; values set in `flags` for
/// those two bits are overwritten.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The source port.
    pub src_port: u16,
    /// The destination port.
    pub dst_port: u16,
    /// The control flags.
    pub flags: Flags,
    /// The sequence number of the first payload byte.
    pub seq_number: SeqNumber,
    /// The acknowledgment number; absence means no ACK flag.
    pub ack_number: Option<SeqNumber>,
    /// The advertised receive window.
    pub window_len: u16,
    /// The urgent pointer; absence means no URG flag.
    pub urgent: Option<u16>,
    /// The window scale shift, when the option is present.
    pub window_scale: Option<u8>,
    /// The maximum segment size, when the option is present.
    pub max_seg_size: Option<u16>,
    /// Whether the SACK-permitted option is present.
    pub sack_permitted: bool,
    /// Selectively acknowledged ranges, when the option is present.
    pub sack_ranges: [Option<(u32, u32)>; 3],
    /// Timestamp value and echo, when the option is present.
    pub timestamps: Option<(u32, u32)>,
    /// The payload length following the header.
    pub payload_len: u16,
}

impl Repr {
    /// Parse a segment into its high-level representation.
    ///
    /// The checksum is not inspected here; use
    /// [`Packet::verify_checksum`] for the tri-state verdict.
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Result<Repr> {
        packet.check_len()?;
        // Source and destination ports must be present.
        if packet.src_port() == 0 {
            return Err(Error::Malformed);
        }
        if packet.dst_port() == 0 {
            return Err(Error::Malformed);
        }

        let flags = packet.flags();
        let ack_number = if flags.ack() {
            Some(packet.ack_number())
        } else {
            None
        };
        let urgent = if flags.urg() {
            Some(packet.urgent_at())
        } else {
            None
        };

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut sack_permitted = false;
        let mut sack_ranges = [None, None, None];
        let mut timestamps = None;
        let mut options = packet.options();
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) => max_seg_size = Some(value),
                TcpOption::WindowScale(value) => {
                    // RFC 7323 limits the shift to 14; larger announcements
                    // are clamped, not rejected.
                    window_scale = if value > 14 {
                        log::debug!("window scale {} clamped to 14", value);
                        Some(14)
                    } else {
                        Some(value)
                    };
                }
                TcpOption::SackPermitted => sack_permitted = true,
                TcpOption::SackRange(ranges) => sack_ranges = ranges,
                TcpOption::Timestamps { value, echo } => timestamps = Some((value, echo)),
                TcpOption::Unknown { kind, .. } => {
                    log::trace!("ignoring unknown tcp option {}", kind)
                }
            }
            options = next_options;
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            flags,
            seq_number: packet.seq_number(),
            ack_number,
            window_len: packet.window_len(),
            urgent,
            window_scale,
            max_seg_size,
            sack_permitted,
            sack_ranges,
            timestamps,
            payload_len: packet.payload().len() as u16,
        })
    }

    /// The length of the header emitted from this representation.
    ///
    /// Options are padded so the result is a multiple of four.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end;
        if self.max_seg_size.is_some() {
            length += 4;
        }
        if self.window_scale.is_some() {
            length += 3;
        }
        if self.sack_permitted {
            length += 2;
        }
        if self.timestamps.is_some() {
            length += 10;
        }
        let sack_range_len: usize = self
            .sack_ranges
            .iter()
            .map(|o| o.map(|_| 8).unwrap_or(0))
            .sum();
        if sack_range_len > 0 {
            length += sack_range_len + 2;
        }
        if length % 4 != 0 {
            length += 4 - length % 4;
        }
        length
    }

    /// The length of a whole segment emitted from this representation.
    pub fn buffer_len(&self) -> usize {
        self.header_len() + usize::from(self.payload_len)
    }

    /// Emit this representation into a segment buffer.
    ///
    /// The buffer must hold at least [`buffer_len`](#method.buffer_len)
    /// octets. The checksum field is left zeroed; fill it through
    /// [`Packet::fill_checksum`] once the payload is in place.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_window_len(self.window_len);
        packet.set_header_len(self.header_len() as u8);
        let mut flags = self.flags;
        flags.set_ack(self.ack_number.is_some());
        flags.set_urg(self.urgent.is_some());
        packet.set_flags(flags);
        packet.set_checksum(0);
        {
            let mut options = packet.options_mut();
            if let Some(value) = self.window_scale {
                options = TcpOption::WindowScale(value).emit(options);
            }
            if let Some(value) = self.max_seg_size {
                options = TcpOption::MaxSegmentSize(value).emit(options);
            }
            if self.sack_permitted {
                options = TcpOption::SackPermitted.emit(options);
            } else if self.ack_number.is_some() && self.sack_ranges.iter().any(|s| s.is_some()) {
                options = TcpOption::SackRange(self.sack_ranges).emit(options);
            }
            if let Some((value, echo)) = self.timestamps {
                options = TcpOption::Timestamps { value, echo }.emit(options);
            }

            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }
        packet.set_urgent_at(self.urgent.unwrap_or(0));
    }

    /// The length of this segment in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        usize::from(self.payload_len) + self.flags.sequence_len()
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP {}>{} [{}] sqn={}",
            self.src_port, self.dst_port, self.flags, self.seq_number
        )?;
        if let Some(ack_number) = self.ack_number {
            write!(f, " ack={}", ack_number)?;
        }
        write!(f, " win={}", self.window_len)?;
        if let Some(max_seg_size) = self.max_seg_size {
            write!(f, " mss={}", max_seg_size)?;
        }
        write!(f, " len={}", self.payload_len)
    }
}

/// One owned transport segment, together with its network addresses.
///
/// This is the unit a connection constructs for each outbound piece of
/// control or data, keeps in its retransmission queue, and decodes from
/// each inbound datagram. The addresses take part in checksum computation
/// and tell the network layer where to deliver the encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// The source network address.
    pub src_addr: IpAddr,
    /// The destination network address.
    pub dst_addr: IpAddr,
    /// The parsed or constructed header.
    pub repr: Repr,
    /// The payload bytes.
    pub payload: Vec<u8>,
    /// The checksum verdict; `Correct` on locally constructed segments.
    pub checksum: Checksum,
}

impl Segment {
    /// Decode a segment delivered by the network layer.
    ///
    /// A flag combination with more than one of SYN, FIN, RST decodes
    /// successfully; rejecting it is the connection's responsibility. A
    /// checksum mismatch also decodes, with the verdict recorded in
    /// [`checksum`](#structfield.checksum) for the demultiplexer to act
    /// on.
    pub fn parse(src_addr: IpAddr, dst_addr: IpAddr, bytes: &[u8]) -> Result<Segment> {
        let packet = Packet::new_checked(bytes)?;
        let repr = Repr::parse(&packet)?;
        let checksum = packet.verify_checksum(&src_addr, &dst_addr);
        Ok(Segment {
            src_addr,
            dst_addr,
            repr,
            payload: packet.payload().to_vec(),
            checksum,
        })
    }

    /// Encode this segment, computing a fresh checksum.
    pub fn emit(&self) -> Vec<u8> {
        let mut repr = self.repr;
        repr.payload_len = self.payload.len() as u16;
        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(&self.payload);
        packet.fill_checksum(&self.src_addr, &self.dst_addr);
        bytes
    }

    /// The length of this segment in terms of sequence space.
    pub fn sequence_len(&self) -> usize {
        self.payload.len() + self.repr.flags.sequence_len()
    }

    /// The sequence number of the last position this segment occupies.
    ///
    /// Only meaningful for segments that occupy sequence space, i.e. the
    /// ones tracked for retransmission.
    pub fn last_seq_number(&self) -> SeqNumber {
        self.repr.seq_number + self.sequence_len() - 1
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} > {}:{} [{}] sqn={}",
            self.src_addr,
            self.repr.src_port,
            self.dst_addr,
            self.repr.dst_port,
            self.repr.flags,
            self.repr.seq_number
        )?;
        if let Some(ack) = self.repr.ack_number {
            write!(f, " ack={}", ack)?;
        }
        if self.checksum == Checksum::Wrong {
            write!(f, " [wrong checksum]")?;
        }
        write!(f, " datalen={}", self.payload.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    const SRC_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const DST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    // ACK|PSH, header length 24, checksum unspecified.
    static PACKET_BYTES: [u8; 28] = [
        0x12, 0x34, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x60, 0x18, 0x20,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0xde, 0xad, 0xbe, 0xef,
    ];

    static OPTION_BYTES: [u8; 4] = [0x02, 0x04, 0x05, 0xb4];

    static PAYLOAD_BYTES: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

    #[test]
    fn deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 0x1234);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(1));
        assert_eq!(packet.ack_number(), SeqNumber(2));
        assert_eq!(packet.header_len(), 24);
        assert!(packet.flags().ack());
        assert!(packet.flags().psh());
        assert!(!packet.flags().syn());
        assert!(!packet.flags().fin());
        assert!(!packet.flags().rst());
        assert_eq!(packet.window_len(), 8192);
        assert_eq!(packet.options(), &OPTION_BYTES[..]);
        assert_eq!(packet.payload(), &PAYLOAD_BYTES[..]);
        assert_eq!(
            packet.verify_checksum(&SRC_ADDR, &DST_ADDR),
            Checksum::Absent
        );
    }

    #[test]
    fn construct() {
        let mut bytes = vec![0xa5; PACKET_BYTES.len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.set_src_port(0x1234);
        packet.set_dst_port(80);
        packet.set_seq_number(SeqNumber(1));
        packet.set_ack_number(SeqNumber(2));
        packet.set_header_len(24);
        let mut flags = Flags::default();
        flags.set_ack(true);
        flags.set_psh(true);
        packet.set_flags(flags);
        packet.set_window_len(8192);
        packet.set_checksum(0);
        packet.set_urgent_at(0);
        packet.options_mut().copy_from_slice(&OPTION_BYTES[..]);
        packet.payload_mut().copy_from_slice(&PAYLOAD_BYTES[..]);
        assert_eq!(&packet.into_inner()[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn truncated() {
        assert_eq!(
            Packet::new_checked(&PACKET_BYTES[..19]).unwrap_err(),
            Error::Truncated
        );
    }

    #[test]
    fn impossible_header_len() {
        let mut bytes = vec![0; 20];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        packet.set_header_len(12);
        assert_eq!(packet.check_len(), Err(Error::Malformed));
    }

    fn packet_repr() -> Repr {
        Repr {
            src_port: 0x1234,
            dst_port: 80,
            flags: {
                let mut flags = Flags::default();
                flags.set_psh(true);
                flags
            },
            seq_number: SeqNumber(1),
            ack_number: Some(SeqNumber(2)),
            window_len: 8192,
            urgent: None,
            window_scale: None,
            max_seg_size: Some(1460),
            sack_permitted: false,
            sack_ranges: [None; 3],
            timestamps: None,
            payload_len: PAYLOAD_BYTES.len() as u16,
        }
    }

    #[test]
    fn parse() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(Repr::parse(&packet).unwrap(), packet_repr());
    }

    #[test]
    fn emit() {
        let repr = packet_repr();
        let mut bytes = vec![0xa5; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        packet.payload_mut().copy_from_slice(&PAYLOAD_BYTES);
        assert_eq!(&packet.into_inner()[..], &PACKET_BYTES[..]);
    }

    #[test]
    fn zero_port_is_malformed() {
        let mut bytes = PACKET_BYTES;
        bytes[0] = 0;
        bytes[1] = 0;
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(Repr::parse(&packet), Err(Error::Malformed));
    }

    #[test]
    fn checksum_round_trip() {
        let segment = Segment {
            src_addr: SRC_ADDR,
            dst_addr: DST_ADDR,
            repr: packet_repr(),
            payload: PAYLOAD_BYTES.to_vec(),
            checksum: Checksum::Correct,
        };
        let bytes = segment.emit();
        let parsed = Segment::parse(SRC_ADDR, DST_ADDR, &bytes).unwrap();
        assert_eq!(parsed.checksum, Checksum::Correct);
        assert_eq!(parsed.repr, segment.repr);
        assert_eq!(parsed.payload, segment.payload);
    }

    #[test]
    fn checksum_round_trip_v6() {
        let src = "fe80::1".parse().unwrap();
        let dst = "fe80::2".parse().unwrap();
        let segment = Segment {
            src_addr: src,
            dst_addr: dst,
            repr: packet_repr(),
            payload: PAYLOAD_BYTES.to_vec(),
            checksum: Checksum::Correct,
        };
        let parsed = Segment::parse(src, dst, &segment.emit()).unwrap();
        assert_eq!(parsed.checksum, Checksum::Correct);
    }

    #[test]
    fn corruption_is_detected() {
        let segment = Segment {
            src_addr: SRC_ADDR,
            dst_addr: DST_ADDR,
            repr: packet_repr(),
            payload: PAYLOAD_BYTES.to_vec(),
            checksum: Checksum::Correct,
        };
        let mut bytes = segment.emit();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let parsed = Segment::parse(SRC_ADDR, DST_ADDR, &bytes).unwrap();
        assert_eq!(parsed.checksum, Checksum::Wrong);
    }

    #[test]
    fn header_len_multiple_of_4() {
        let mut repr = packet_repr();
        repr.window_scale = Some(0); // This option needs 3 bytes.
        assert_eq!(repr.header_len() % 4, 0);
    }

    macro_rules! assert_option_parses {
        ($opt:expr, $data:expr) => {{
            assert_eq!(TcpOption::parse($data), Ok((&[][..], $opt)));
            let buffer = &mut [0; 40][..$opt.buffer_len()];
            assert_eq!($opt.emit(buffer), &mut []);
            assert_eq!(&*buffer, $data);
        }};
    }

    #[test]
    fn tcp_options() {
        assert_option_parses!(TcpOption::EndOfList, &[0x00]);
        assert_option_parses!(TcpOption::NoOperation, &[0x01]);
        assert_option_parses!(TcpOption::MaxSegmentSize(1500), &[0x02, 0x04, 0x05, 0xdc]);
        assert_option_parses!(TcpOption::WindowScale(12), &[0x03, 0x03, 0x0c]);
        assert_option_parses!(TcpOption::SackPermitted, &[0x04, 0x02]);
        assert_option_parses!(
            TcpOption::SackRange([Some((500, 1500)), None, None]),
            &[0x05, 0x0a, 0x00, 0x00, 0x01, 0xf4, 0x00, 0x00, 0x05, 0xdc]
        );
        assert_option_parses!(
            TcpOption::Timestamps {
                value: 0x01020304,
                echo: 0x05060708
            },
            &[0x08, 0x0a, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_option_parses!(
            TcpOption::Unknown {
                kind: 12,
                data: &[1, 2, 3][..]
            },
            &[0x0c, 0x05, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn malformed_tcp_options() {
        assert_eq!(TcpOption::parse(&[]), Err(Error::Truncated));
        assert_eq!(TcpOption::parse(&[0xc]), Err(Error::Truncated));
        assert_eq!(
            TcpOption::parse(&[0xc, 0x05, 0x01, 0x02]),
            Err(Error::Truncated)
        );
        assert_eq!(TcpOption::parse(&[0x2, 0x02]), Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x3, 0x02]), Err(Error::Malformed));
        assert_eq!(TcpOption::parse(&[0x8, 0x04, 0, 0]), Err(Error::Malformed));
    }

    #[test]
    fn sequence_arithmetic() {
        assert!(SeqNumber(-1) < SeqNumber(1));
        assert!(SeqNumber(5) > SeqNumber(-5));
        assert_eq!(SeqNumber(-1) + 2, SeqNumber(1));
        assert_eq!(SeqNumber(1) - SeqNumber(-1), 2);
        assert_eq!(SeqNumber(-3) - 4, SeqNumber(-7));
    }

    #[test]
    fn flag_exclusivity() {
        let mut flags = Flags::default();
        flags.set_syn(true);
        assert!(flags.exclusive());
        flags.set_fin(true);
        assert!(!flags.exclusive());
    }

    #[test]
    fn derived_flag_bits() {
        let mut repr = packet_repr();
        repr.ack_number = None;
        repr.urgent = Some(7);
        let mut bytes = vec![0; repr.buffer_len()];
        let mut packet = Packet::new_unchecked(&mut bytes[..]);
        repr.emit(&mut packet);
        assert!(!packet.flags().ack());
        assert!(packet.flags().urg());
        assert_eq!(packet.urgent_at(), 7);
        assert_eq!(packet.ack_number(), SeqNumber(0));
    }
}
