use bytes::{BufMut, Bytes, BytesMut};
use rand::RngExt;

use crate::error::{CastError, ParseErrorKind, Result};

/// Fixed RTP header length in bytes.
pub const RTP_HEADER_LEN: usize = 12;

/// Largest RTP packet (header + payload) produced by any packetizer:
/// a 1200-byte MTU minus 28 bytes of IPv4/UDP overhead.
pub const MAX_PACKET_SIZE: usize = 1200 - 28;

/// Per-track RTP header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Every codec packetizer composes one of these. It owns:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **Timestamp**: derived from presentation time as
///   `pts_us * clock_rate / 1_000_000`, wrapped modulo 2^32.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    clock_rate: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC, starting at sequence 0.
    pub fn new(pt: u8, ssrc: u32, clock_rate: u32) -> Self {
        tracing::debug!(
            pt,
            clock_rate,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            clock_rate,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Create with a random SSRC and a random initial sequence number.
    ///
    /// Per RFC 3550 §5.1 the initial sequence number should be random
    /// to make known-plaintext attacks on encryption more difficult.
    pub fn with_random_ssrc(pt: u8, clock_rate: u32) -> Self {
        let mut rng = rand::rng();
        let mut header = Self::new(pt, rng.random::<u32>(), clock_rate);
        header.sequence = rng.random::<u16>();
        header
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Force the next sequence number (used by tests and RTP-Info resync).
    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    /// Timestamp of the most recently stamped access unit.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Change the media clock (audio codecs learn the sample rate late).
    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.clock_rate = clock_rate;
    }

    /// Convert a presentation time in microseconds to an RTP timestamp and
    /// remember it for subsequent [`packet`](Self::packet) calls.
    pub fn stamp(&mut self, presentation_time_us: i64) -> u32 {
        self.timestamp = to_rtp_timestamp(presentation_time_us, self.clock_rate);
        self.timestamp
    }

    /// Emit the next packet on this track and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of an
    /// access unit.
    pub fn packet(&mut self, marker: bool, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            payload_type: self.pt,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            marker,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}

/// Scale a microsecond presentation time to `clock_rate` ticks, modulo 2^32.
pub fn to_rtp_timestamp(presentation_time_us: i64, clock_rate: u32) -> u32 {
    let ticks = (presentation_time_us as i128 * clock_rate as i128).div_euclid(1_000_000);
    ticks.rem_euclid(1i128 << 32) as u32
}

/// One RTP packet: fixed header fields plus codec payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Total wire length (header + payload).
    pub fn wire_len(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }

    /// Serialize the 12-byte fixed header.
    pub fn header_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_slice(&self.header_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet without CSRC/extension support.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN || data[0] >> 6 != 2 {
            return Err(CastError::Parse {
                kind: ParseErrorKind::InvalidRtp,
            });
        }
        Ok(Self {
            payload_type: data[1] & 0x7f,
            marker: data[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload: Bytes::copy_from_slice(&data[RTP_HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 90_000)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.packet(false, Bytes::new()).header_bytes();
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.packet(false, Bytes::new()).header_bytes();
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = h.packet(true, Bytes::new()).header_bytes();
        assert_eq!(with_marker[1] & 0x80, 0x80);
        assert_eq!(with_marker[1] & 0x7f, 96);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = make_header();
        h.set_sequence(u16::MAX);
        let p = h.packet(false, Bytes::new());
        assert_eq!(p.sequence, u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn ssrc_written() {
        let mut h = make_header();
        let buf = h.packet(false, Bytes::new()).header_bytes();
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(ssrc, 0xAABBCCDD);
    }

    #[test]
    fn timestamp_scaled_from_microseconds() {
        let mut h = make_header();
        assert_eq!(h.stamp(1_000_000), 90_000);
        assert_eq!(h.stamp(33_333), 2_999);
        assert_eq!(to_rtp_timestamp(1_000_000, 48_000), 48_000);
    }

    #[test]
    fn timestamp_wraps_modulo_2_32() {
        // 2^32 / 90000 s ≈ 47721.86 s; one second past that wraps.
        let wrap_us = ((1u64 << 32) * 1_000_000 / 90_000) as i64;
        let ts = to_rtp_timestamp(wrap_us + 1_000_000, 90_000);
        assert!(ts < 90_001);
    }

    #[test]
    fn parse_serialized_packet() {
        let mut h = make_header();
        h.stamp(2_000_000);
        let packet = h.packet(true, Bytes::from_static(&[1, 2, 3]));
        let parsed = RtpPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn parse_rejects_short_or_wrong_version() {
        assert!(RtpPacket::parse(&[0x80; 4]).is_err());
        assert!(RtpPacket::parse(&[0x40; 12]).is_err());
    }

    #[test]
    fn random_ssrc_differs() {
        let h1 = RtpHeader::with_random_ssrc(96, 90_000);
        let h2 = RtpHeader::with_random_ssrc(96, 90_000);
        assert_ne!(h1.ssrc, h2.ssrc);
    }
}
