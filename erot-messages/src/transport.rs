// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet-level framing for messages exchanged with an EROT.
//!
//! Every packet on the wire is a [`MediumHeader`] followed by a
//! [`TransportHeader`] followed by at most [`BASELINE_TRANSMISSION_UNIT`]
//! bytes of payload. Messages longer than one baseline unit are split with
//! [`Fragments`] and put back together with [`Reassembler`].

use core::fmt;
use core::mem;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Version carried in the first byte of every transport header.
pub const TRANSPORT_HEADER_VERSION: u8 = 0x01;

/// Medium-header type for packets carrying a transport message.
pub const MEDIUM_TYPE_MCTP: u8 = 0x01;

/// Maximum payload carried by a single packet.
pub const BASELINE_TRANSMISSION_UNIT: usize = 64;

pub const MEDIUM_HEADER_SIZE: usize = 4;
pub const TRANSPORT_HEADER_SIZE: usize = 4;

/// Size of the largest packet we ever put on (or accept from) the bus.
pub const MAX_PACKET_SIZE: usize =
    MEDIUM_HEADER_SIZE + TRANSPORT_HEADER_SIZE + BASELINE_TRANSMISSION_UNIT;

/// Bits of the transport header control byte.
pub mod control {
    pub const START_OF_MESSAGE: u8 = 0x80;
    pub const END_OF_MESSAGE: u8 = 0x40;
    pub const SEQ_SHIFT: u8 = 4;
    pub const SEQ_MASK: u8 = 0x03;
    pub const TAG_OWNER: u8 = 0x08;
    pub const TAG_MASK: u8 = 0x07;
}

/// 3-bit message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageTag(u8);

impl MessageTag {
    pub const fn new(tag: u8) -> Self {
        Self(tag & control::TAG_MASK)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// The tag following this one, wrapping mod 8.
    pub const fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Fewer bytes than a full header were supplied.
    Truncated { len: usize },
    /// Output buffer cannot hold the packet.
    OutputTooSmall { needed: usize, capacity: usize },
    /// Payload exceeds one baseline transmission unit.
    PayloadTooLarge { len: usize },
    /// Medium header does not describe an MCTP packet.
    BadMediumType(u8),
    /// Medium header length disagrees with the number of bytes received.
    LengthMismatch { header: usize, actual: usize },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => {
                write!(f, "malformed header: only {len} bytes")
            }
            Self::OutputTooSmall { needed, capacity } => {
                write!(f, "packet needs {needed} bytes but buffer has {capacity}")
            }
            Self::PayloadTooLarge { len } => {
                write!(f, "payload of {len} bytes exceeds transmission unit")
            }
            Self::BadMediumType(ty) => write!(f, "invalid medium type {ty:#x}"),
            Self::LengthMismatch { header, actual } => write!(
                f,
                "medium length {header} disagrees with packet length {actual}"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HeaderError {}

/// Reads a big-endian `u16` from the front of `bytes`.
pub fn read_be_u16(bytes: &[u8]) -> Option<u16> {
    let raw = bytes.get(..mem::size_of::<u16>())?;
    Some(u16::from_be_bytes([raw[0], raw[1]]))
}

/// Reads a big-endian `u32` from the front of `bytes`.
pub fn read_be_u32(bytes: &[u8]) -> Option<u32> {
    let raw = bytes.get(..mem::size_of::<u32>())?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Writes `value` big-endian to the front of `out`, returning the number of
/// bytes written or `None` if `out` is too short.
pub fn write_be_u16(out: &mut [u8], value: u16) -> Option<usize> {
    let dst = out.get_mut(..mem::size_of::<u16>())?;
    dst.copy_from_slice(&value.to_be_bytes());
    Some(dst.len())
}

/// Writes `value` big-endian to the front of `out`, returning the number of
/// bytes written or `None` if `out` is too short.
pub fn write_be_u32(out: &mut [u8], value: u32) -> Option<usize> {
    let dst = out.get_mut(..mem::size_of::<u32>())?;
    dst.copy_from_slice(&value.to_be_bytes());
    Some(dst.len())
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
struct RawMediumHeader {
    medium_type: u8,
    length: u8,
    // network order
    reserved: [u8; 2],
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
struct RawTransportHeader {
    version: u8,
    destination: u8,
    source: u8,
    control: u8,
}

const_assert_eq!(mem::size_of::<RawMediumHeader>(), MEDIUM_HEADER_SIZE);
const_assert_eq!(mem::size_of::<RawTransportHeader>(), TRANSPORT_HEADER_SIZE);

/// Physical-link framing in front of every transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediumHeader {
    pub medium_type: u8,
    /// Transport header plus payload, in bytes.
    pub length: u8,
    pub reserved: u16,
}

impl MediumHeader {
    pub fn for_payload(payload_len: usize) -> Result<Self, HeaderError> {
        if payload_len > BASELINE_TRANSMISSION_UNIT {
            return Err(HeaderError::PayloadTooLarge { len: payload_len });
        }
        Ok(Self {
            medium_type: MEDIUM_TYPE_MCTP,
            // bounded by BASELINE_TRANSMISSION_UNIT above
            length: (TRANSPORT_HEADER_SIZE + payload_len) as u8,
            reserved: 0,
        })
    }

    pub fn encode(&self) -> [u8; MEDIUM_HEADER_SIZE] {
        let mut reserved = [0; 2];
        // infallible: `reserved` is exactly two bytes
        let _ = write_be_u16(&mut reserved, self.reserved);
        let raw = RawMediumHeader {
            medium_type: self.medium_type,
            length: self.length,
            reserved,
        };
        let mut out = [0; MEDIUM_HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let (raw, _) = RawMediumHeader::read_from_prefix(bytes)
            .map_err(|_| HeaderError::Truncated { len: bytes.len() })?;
        Ok(Self {
            medium_type: raw.medium_type,
            length: raw.length,
            reserved: u16::from_be_bytes(raw.reserved),
        })
    }
}

/// Decoded transport header of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub version: u8,
    pub destination: u8,
    pub source: u8,
    pub start_of_message: bool,
    pub end_of_message: bool,
    /// 2-bit packet sequence number.
    pub seq: u8,
    pub tag_owner: bool,
    pub tag: MessageTag,
}

impl TransportHeader {
    pub fn new(
        source: u8,
        destination: u8,
        tag: MessageTag,
        start_of_message: bool,
        end_of_message: bool,
        seq: u8,
        tag_owner: bool,
    ) -> Self {
        Self {
            version: TRANSPORT_HEADER_VERSION,
            destination,
            source,
            start_of_message,
            end_of_message,
            seq: seq & control::SEQ_MASK,
            tag_owner,
            tag,
        }
    }

    pub fn control_byte(&self) -> u8 {
        let mut control = (self.seq & control::SEQ_MASK) << control::SEQ_SHIFT;
        control |= self.tag.get();
        if self.start_of_message {
            control |= control::START_OF_MESSAGE;
        }
        if self.end_of_message {
            control |= control::END_OF_MESSAGE;
        }
        if self.tag_owner {
            control |= control::TAG_OWNER;
        }
        control
    }

    pub fn encode(&self) -> [u8; TRANSPORT_HEADER_SIZE] {
        let raw = RawTransportHeader {
            version: self.version,
            destination: self.destination,
            source: self.source,
            control: self.control_byte(),
        };
        let mut out = [0; TRANSPORT_HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let (raw, _) = RawTransportHeader::read_from_prefix(bytes)
            .map_err(|_| HeaderError::Truncated { len: bytes.len() })?;
        let control = raw.control;
        Ok(Self {
            version: raw.version,
            destination: raw.destination,
            source: raw.source,
            start_of_message: control & control::START_OF_MESSAGE != 0,
            end_of_message: control & control::END_OF_MESSAGE != 0,
            seq: (control >> control::SEQ_SHIFT) & control::SEQ_MASK,
            tag_owner: control & control::TAG_OWNER != 0,
            tag: MessageTag::new(control),
        })
    }
}

/// A packet decoded in place from a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub header: TransportHeader,
    pub payload: &'a [u8],
}

/// Serializes one packet (medium header, transport header, payload) into
/// `out`, returning the number of bytes used.
pub fn encode_packet(
    header: &TransportHeader,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, HeaderError> {
    let medium = MediumHeader::for_payload(payload.len())?;
    let needed = MEDIUM_HEADER_SIZE + TRANSPORT_HEADER_SIZE + payload.len();
    let capacity = out.len();
    let out = out
        .get_mut(..needed)
        .ok_or(HeaderError::OutputTooSmall { needed, capacity })?;
    let (medium_bytes, rest) = out.split_at_mut(MEDIUM_HEADER_SIZE);
    let (transport_bytes, payload_bytes) =
        rest.split_at_mut(TRANSPORT_HEADER_SIZE);
    medium_bytes.copy_from_slice(&medium.encode());
    transport_bytes.copy_from_slice(&header.encode());
    payload_bytes.copy_from_slice(payload);
    Ok(needed)
}

/// Parses one packet exactly `bytes.len()` long.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet<'_>, HeaderError> {
    let medium = MediumHeader::decode(bytes)?;
    if medium.medium_type != MEDIUM_TYPE_MCTP {
        return Err(HeaderError::BadMediumType(medium.medium_type));
    }
    let header_len = usize::from(medium.length) + MEDIUM_HEADER_SIZE;
    if header_len != bytes.len() {
        return Err(HeaderError::LengthMismatch {
            header: header_len,
            actual: bytes.len(),
        });
    }
    let rest = &bytes[MEDIUM_HEADER_SIZE..];
    let header = TransportHeader::decode(rest)?;
    let payload = &rest[TRANSPORT_HEADER_SIZE..];
    if payload.len() > BASELINE_TRANSMISSION_UNIT {
        return Err(HeaderError::PayloadTooLarge { len: payload.len() });
    }
    Ok(Packet { header, payload })
}

/// Splits a message into packet headers and payload slices.
///
/// A zero-length message still produces a single packet with both start and
/// end of message set.
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    remaining: &'a [u8],
    source: u8,
    destination: u8,
    tag: MessageTag,
    tag_owner: bool,
    seq: u8,
    started: bool,
}

impl<'a> Fragments<'a> {
    pub fn new(
        message: &'a [u8],
        source: u8,
        destination: u8,
        tag: MessageTag,
        tag_owner: bool,
    ) -> Self {
        Self {
            remaining: message,
            source,
            destination,
            tag,
            tag_owner,
            seq: 0,
            started: false,
        }
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = (TransportHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.started && self.remaining.is_empty() {
            return None;
        }
        let n = self.remaining.len().min(BASELINE_TRANSMISSION_UNIT);
        let (payload, rest) = self.remaining.split_at(n);
        let header = TransportHeader::new(
            self.source,
            self.destination,
            self.tag,
            !self.started,
            rest.is_empty(),
            self.seq,
            self.tag_owner,
        );
        self.started = true;
        self.remaining = rest;
        self.seq = (self.seq + 1) & control::SEQ_MASK;
        Some((header, payload))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// First packet of a message lacked the start-of-message flag.
    MissingStartOfMessage { control: u8 },
    /// Packet belongs to a different message than the one in progress.
    TagMismatch { expected: MessageTag, got: MessageTag },
    /// Packet sequence number skipped or repeated.
    SequenceGap { expected: u8, got: u8 },
    /// A non-final packet was shorter or longer than the first one.
    MiddlePacketLength { expected: usize, got: usize },
    /// The message does not fit in the caller's buffer.
    BufferTooSmall { needed: usize, capacity: usize },
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStartOfMessage { control } => {
                write!(f, "missing start of message (control {control:#04x})")
            }
            Self::TagMismatch { expected, got } => {
                write!(f, "packet tag {got} does not match message tag {expected}")
            }
            Self::SequenceGap { expected, got } => {
                write!(f, "packet sequence {got}, expected {expected}")
            }
            Self::MiddlePacketLength { expected, got } => {
                write!(f, "middle packet length {got} != {expected}")
            }
            Self::BufferTooSmall { needed, capacity } => {
                write!(f, "message needs {needed} bytes, buffer has {capacity}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ReassemblyError {}

/// Reassembles the packets of one message into a caller-owned buffer.
#[derive(Debug)]
pub struct Reassembler<'a> {
    buf: &'a mut [u8],
    len: usize,
    // tag, expected next sequence and first payload length; `None` until the
    // start-of-message packet has been accepted
    progress: Option<(MessageTag, u8, usize)>,
    tag_owner: bool,
}

impl<'a> Reassembler<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0, progress: None, tag_owner: false }
    }

    /// Whether a start-of-message packet has been accepted.
    pub fn in_progress(&self) -> bool {
        self.progress.is_some()
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tag of the message being assembled, once known.
    pub fn tag(&self) -> Option<MessageTag> {
        self.progress.map(|(tag, _, _)| tag)
    }

    /// Tag-owner flag of the start-of-message packet.
    pub fn tag_owner(&self) -> bool {
        self.tag_owner
    }

    /// Accepts one packet. Returns `Ok(true)` when the packet completed the
    /// message; the assembled bytes are then `buf[..self.len()]`.
    ///
    /// On error the partial message is discarded.
    pub fn push(&mut self, packet: &Packet<'_>) -> Result<bool, ReassemblyError> {
        let result = self.push_inner(packet);
        if result.is_err() {
            self.len = 0;
            self.progress = None;
        }
        result
    }

    fn push_inner(
        &mut self,
        packet: &Packet<'_>,
    ) -> Result<bool, ReassemblyError> {
        let header = &packet.header;
        let payload_len = packet.payload.len();
        let needed = self.len + payload_len;
        if needed > self.buf.len() {
            return Err(ReassemblyError::BufferTooSmall {
                needed,
                capacity: self.buf.len(),
            });
        }

        match self.progress {
            None => {
                if !header.start_of_message {
                    return Err(ReassemblyError::MissingStartOfMessage {
                        control: header.control_byte(),
                    });
                }
                self.tag_owner = header.tag_owner;
                self.progress = Some((header.tag, header.seq, payload_len));
            }
            Some((tag, expected_seq, first_len)) => {
                if header.tag != tag {
                    return Err(ReassemblyError::TagMismatch {
                        expected: tag,
                        got: header.tag,
                    });
                }
                if header.seq != expected_seq {
                    return Err(ReassemblyError::SequenceGap {
                        expected: expected_seq,
                        got: header.seq,
                    });
                }
                if !header.end_of_message && payload_len != first_len {
                    return Err(ReassemblyError::MiddlePacketLength {
                        expected: first_len,
                        got: payload_len,
                    });
                }
            }
        }

        self.buf[self.len..needed].copy_from_slice(packet.payload);
        self.len = needed;
        if let Some((_, seq, _)) = self.progress.as_mut() {
            *seq = (header.seq + 1) & control::SEQ_MASK;
        }
        Ok(header.end_of_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_layout() {
        let header = TransportHeader::new(
            0x08,
            0x09,
            MessageTag::new(5),
            true,
            false,
            2,
            true,
        );
        // SOM | seq 2 | TO | tag 5
        assert_eq!(header.control_byte(), 0x80 | 0x20 | 0x08 | 0x05);
        assert_eq!(header.encode(), [0x01, 0x09, 0x08, 0xad]);
    }

    #[test]
    fn decode_header_fields() {
        let header = TransportHeader::decode(&[0x01, 0x08, 0x09, 0x73]).unwrap();
        assert_eq!(header.version, TRANSPORT_HEADER_VERSION);
        assert_eq!(header.destination, 0x08);
        assert_eq!(header.source, 0x09);
        assert!(!header.start_of_message);
        assert!(header.end_of_message);
        assert_eq!(header.seq, 3);
        assert!(!header.tag_owner);
        assert_eq!(header.tag, MessageTag::new(3));
    }

    #[test]
    fn short_header_is_malformed() {
        assert_eq!(
            TransportHeader::decode(&[0x01, 0x02]),
            Err(HeaderError::Truncated { len: 2 })
        );
        assert_eq!(
            MediumHeader::decode(&[]),
            Err(HeaderError::Truncated { len: 0 })
        );
    }

    #[test]
    fn big_endian_helpers() {
        let mut buf = [0; 4];
        assert_eq!(write_be_u32(&mut buf, 0x0102_0304), Some(4));
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(read_be_u32(&buf), Some(0x0102_0304));
        assert_eq!(read_be_u16(&buf[2..]), Some(0x0304));
        assert_eq!(write_be_u16(&mut buf[..1], 7), None);
        assert_eq!(read_be_u32(&buf[1..]), None);
    }

    #[test]
    fn tag_wraps() {
        assert_eq!(MessageTag::new(7).next(), MessageTag::new(0));
        assert_eq!(MessageTag::new(0x0f).get(), 7);
    }

    #[test]
    fn packet_rejects_bad_medium() {
        let header =
            TransportHeader::new(1, 2, MessageTag::new(0), true, true, 0, true);
        let mut buf = [0; MAX_PACKET_SIZE];
        let n = encode_packet(&header, &[1, 2, 3], &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(buf[1], 7);

        let packet = decode_packet(&buf[..n]).unwrap();
        assert_eq!(packet.header, header);
        assert_eq!(packet.payload, &[1, 2, 3]);

        assert_eq!(
            decode_packet(&buf[..n - 1]),
            Err(HeaderError::LengthMismatch { header: 11, actual: 10 })
        );
        buf[0] = 0x7f;
        assert_eq!(decode_packet(&buf[..n]), Err(HeaderError::BadMediumType(0x7f)));
    }

    #[test]
    fn fragments_bracket_message() {
        let message = [0xaa; 130];
        let packets: Vec<_> =
            Fragments::new(&message, 8, 9, MessageTag::new(1), true).collect();
        assert_eq!(packets.len(), 3);
        assert!(packets[0].0.start_of_message);
        assert!(!packets[0].0.end_of_message);
        assert!(!packets[1].0.start_of_message && !packets[1].0.end_of_message);
        assert!(packets[2].0.end_of_message);
        assert_eq!(packets[2].1.len(), 2);
        let seqs: Vec<_> = packets.iter().map(|(h, _)| h.seq).collect();
        assert_eq!(seqs, [0, 1, 2]);
    }

    #[test]
    fn empty_message_is_one_packet() {
        let packets: Vec<_> =
            Fragments::new(&[], 8, 9, MessageTag::new(1), false).collect();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].0.start_of_message && packets[0].0.end_of_message);
        assert!(packets[0].1.is_empty());
    }

    fn reassemble(message: &[u8]) -> Vec<u8> {
        let mut buf = vec![0; 8192];
        let mut reassembler = Reassembler::new(&mut buf);
        let mut done = false;
        for (header, payload) in
            Fragments::new(message, 8, 9, MessageTag::new(4), true)
        {
            assert!(!done);
            done = reassembler.push(&Packet { header, payload }).unwrap();
        }
        assert!(done);
        assert_eq!(reassembler.tag(), Some(MessageTag::new(4)));
        let n = reassembler.len();
        buf.truncate(n);
        buf
    }

    #[test]
    fn reassembly_round_trip_at_packet_boundaries() {
        for len in [0, 1, 63, 64, 65, 4096] {
            let message: Vec<u8> = (0..len).map(|i| i as u8).collect();
            assert_eq!(reassemble(&message), message, "length {len}");
        }
    }

    #[test]
    fn reassembly_rejects_sequence_gap() {
        let message = [0x55; 200];
        let packets: Vec<_> =
            Fragments::new(&message, 8, 9, MessageTag::new(2), true).collect();
        let mut buf = [0; 256];
        let mut reassembler = Reassembler::new(&mut buf);
        let (header, payload) = packets[0];
        assert_eq!(reassembler.push(&Packet { header, payload }), Ok(false));
        let (header, payload) = packets[2];
        assert_eq!(
            reassembler.push(&Packet { header, payload }),
            Err(ReassemblyError::SequenceGap { expected: 1, got: 2 })
        );
        assert!(!reassembler.in_progress());
        assert!(reassembler.is_empty());
    }

    #[test]
    fn reassembly_requires_start() {
        let header =
            TransportHeader::new(9, 8, MessageTag::new(0), false, true, 1, false);
        let mut buf = [0; 64];
        let mut reassembler = Reassembler::new(&mut buf);
        assert!(matches!(
            reassembler.push(&Packet { header, payload: &[1] }),
            Err(ReassemblyError::MissingStartOfMessage { .. })
        ));
    }

    #[test]
    fn reassembly_rejects_other_tag_and_short_middle() {
        let mut buf = [0; 256];
        let mut reassembler = Reassembler::new(&mut buf);
        let first =
            TransportHeader::new(9, 8, MessageTag::new(1), true, false, 0, false);
        reassembler.push(&Packet { header: first, payload: &[0; 64] }).unwrap();
        let other =
            TransportHeader::new(9, 8, MessageTag::new(2), false, false, 1, false);
        assert_eq!(
            reassembler.push(&Packet { header: other, payload: &[0; 64] }),
            Err(ReassemblyError::TagMismatch {
                expected: MessageTag::new(1),
                got: MessageTag::new(2),
            })
        );

        reassembler.push(&Packet { header: first, payload: &[0; 64] }).unwrap();
        let short =
            TransportHeader::new(9, 8, MessageTag::new(1), false, false, 1, false);
        assert_eq!(
            reassembler.push(&Packet { header: short, payload: &[0; 10] }),
            Err(ReassemblyError::MiddlePacketLength { expected: 64, got: 10 })
        );
    }

    #[test]
    fn reassembly_overflow() {
        let mut buf = [0; 70];
        let mut reassembler = Reassembler::new(&mut buf);
        let first =
            TransportHeader::new(9, 8, MessageTag::new(1), true, false, 0, false);
        reassembler.push(&Packet { header: first, payload: &[0; 64] }).unwrap();
        let next =
            TransportHeader::new(9, 8, MessageTag::new(1), false, true, 1, false);
        assert_eq!(
            reassembler.push(&Packet { header: next, payload: &[0; 10] }),
            Err(ReassemblyError::BufferTooSmall { needed: 74, capacity: 70 })
        );
    }
}
