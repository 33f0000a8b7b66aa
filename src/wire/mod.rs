//! Low-level segment access and construction.
//!
//! The module provides two levels of functionality, mirrored from how the
//! rest of the crate consumes them:
//!
//! * Field extraction from and insertion into raw octet sequences, through
//!   the [`tcp::Packet`] accessor wrapper.
//! * A compact, high-level representation of header data that can be
//!   created by parsing and emitted back into octets, through
//!   [`tcp::Repr`] and the owned [`tcp::Segment`].
//!
//! Checksums are computed over an IP pseudo-header; since this crate does
//! not construct IP packets itself, the network addresses required for it
//! are plain [`std::net::IpAddr`] values supplied by the caller.

use core::fmt;

pub mod tcp;

/// The IP protocol number of TCP, as used in the pseudo-header.
pub const IPPROTO_TCP: u8 = 6;

/// The error type for parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming segment could not be parsed because it was shorter than
    /// assumed.
    ///
    /// The buffer may be shorter than the minimum header length, or a
    /// variable-length field (the options area, bounded by the header
    /// length) may lie outside the received data.
    Truncated,

    /// An incoming segment was recognized but self-contradictory.
    ///
    /// Examples: a header-length field below the 20-byte minimum, an
    /// option whose announced length does not match its type.
    Malformed,

    /// A field or option carries a value this implementation cannot act
    /// on even though it parsed.
    Unsupported,
}

/// The result type for parsing.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated segment"),
            Error::Malformed => write!(f, "malformed segment"),
            Error::Unsupported => write!(f, "unsupported field"),
        }
    }
}

impl std::error::Error for Error {}

pub(crate) mod field {
    //! Field offsets are expressed as byte ranges into the header.
    pub(crate) type Field = core::ops::Range<usize>;
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};
    use std::net::IpAddr;

    use super::IPPROTO_TCP;

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final
    /// complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0u32;

        while data.len() >= 2 {
            accum += u32::from(NetworkEndian::read_u16(data));
            data = &data[2..];
        }

        // A trailing odd byte is padded with zeros on the right.
        if let Some(&value) = data.first() {
            accum += u32::from(value) << 8;
        }

        propagate_carries(accum)
    }

    /// Combine several RFC 1071 compliant checksums.
    pub(crate) fn combine(checksums: &[u16]) -> u16 {
        let mut accum = 0u32;
        for &word in checksums {
            accum += u32::from(word);
        }
        propagate_carries(accum)
    }

    /// Compute the IP pseudo-header checksum for a TCP segment of the given
    /// length.
    ///
    /// # Panics
    ///
    /// Panics when the addresses belong to different families. A connection
    /// never mixes families; hitting this is a caller bug.
    pub(crate) fn pseudo_header(src_addr: &IpAddr, dst_addr: &IpAddr, length: u32) -> u16 {
        match (src_addr, dst_addr) {
            (IpAddr::V4(src_addr), IpAddr::V4(dst_addr)) => {
                let mut proto_len = [0u8; 4];
                proto_len[1] = IPPROTO_TCP;
                NetworkEndian::write_u16(&mut proto_len[2..4], length as u16);

                combine(&[
                    data(&src_addr.octets()),
                    data(&dst_addr.octets()),
                    data(&proto_len[..]),
                ])
            }

            (IpAddr::V6(src_addr), IpAddr::V6(dst_addr)) => {
                let mut proto_len = [0u8; 8];
                proto_len[7] = IPPROTO_TCP;
                NetworkEndian::write_u32(&mut proto_len[0..4], length);

                combine(&[
                    data(&src_addr.octets()),
                    data(&dst_addr.octets()),
                    data(&proto_len[..]),
                ])
            }

            _ => panic!(
                "mixed address families in pseudo header: {}, {}",
                src_addr, dst_addr
            ),
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn carry_fold() {
            assert_eq!(propagate_carries(0x0001_ffff), 0x0001);
            assert_eq!(propagate_carries(0x0000_ffff), 0xffff);
        }

        #[test]
        fn odd_tail_is_right_padded() {
            assert_eq!(data(&[0x12]), 0x1200);
            assert_eq!(data(&[0x12, 0x34, 0x56]), combine(&[0x1234, 0x5600]));
        }
    }
}
