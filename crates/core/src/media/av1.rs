//! AV1 RTP packetizer (AOMedia "RTP Payload Format for AV1").
//!
//! An access unit is a sequence of OBUs. Temporal delimiters are dropped,
//! the rest are concatenated as OBU elements (LEB128 length prefix on all
//! but the last element) and split into packets, each led by a one-byte
//! aggregation header:
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |Z|Y| W |N|-|-|-|
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! - **Z**: first element continues a fragment from the previous packet.
//! - **Y**: last element continues in the next packet.
//! - **W**: number of OBU elements (1..=3), or 0 when every element carries
//!   its own length.
//! - **N**: first packet of a coded video sequence (a key frame).

use bytes::{BufMut, Bytes, BytesMut};

use super::rtp::{MAX_PACKET_SIZE, RTP_HEADER_LEN, RtpHeader, RtpPacket};
use super::{Packetizer, VIDEO_CLOCK_RATE};

const MAX_LEB128_BYTES: usize = 8;
const MAX_FRAGMENT: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN - 1;

/// OBU types used by the packetizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObuType {
    SequenceHeader,
    TemporalDelimiter,
    FrameHeader,
    TileGroup,
    Metadata,
    Frame,
    Padding,
    Other(u8),
}

impl From<u8> for ObuType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::SequenceHeader,
            2 => Self::TemporalDelimiter,
            3 => Self::FrameHeader,
            4 => Self::TileGroup,
            5 => Self::Metadata,
            6 => Self::Frame,
            15 => Self::Padding,
            other => Self::Other(other),
        }
    }
}

/// One parsed OBU, borrowing header, size field and payload in one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obu<'a> {
    pub kind: ObuType,
    /// Complete OBU bytes: header, optional extension, size field, payload.
    pub data: &'a [u8],
}

/// Read an unsigned LEB128 value of at most 8 bytes.
///
/// Returns `(value, bytes_used)`, or `None` on truncation or a missing
/// stop bit.
pub fn read_leb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().take(MAX_LEB128_BYTES).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

pub fn write_leb128(mut value: u64, out: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

/// Split a low-overhead bitstream into OBUs.
///
/// Parsing stops at the first malformed OBU; everything before it is kept.
pub fn parse_obus(data: &[u8]) -> Vec<Obu<'_>> {
    let mut obus = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let header = data[pos];
        let kind = ObuType::from((header >> 3) & 0x0f);
        let has_extension = header & 0x04 != 0;
        let has_size = header & 0x02 != 0;
        let header_len = if has_extension { 2 } else { 1 };
        if pos + header_len > data.len() {
            tracing::warn!(pos, "truncated OBU header");
            break;
        }

        let end = if has_size {
            let Some((size, used)) = read_leb128(&data[pos + header_len..]) else {
                tracing::warn!(pos, "malformed LEB128 OBU size");
                break;
            };
            let payload_start = pos + header_len + used;
            match usize::try_from(size).ok().and_then(|s| payload_start.checked_add(s)) {
                Some(end) if end <= data.len() => end,
                _ => {
                    tracing::warn!(pos, size, "OBU size exceeds buffer");
                    break;
                }
            }
        } else {
            data.len()
        };

        obus.push(Obu {
            kind,
            data: &data[pos..end],
        });
        pos = end;
    }
    obus
}

/// Return the sequence header OBU of a key frame, if present.
pub fn extract_sequence_header(access_unit: &[u8]) -> Option<Bytes> {
    parse_obus(access_unit)
        .into_iter()
        .find(|obu| obu.kind == ObuType::SequenceHeader)
        .map(|obu| Bytes::copy_from_slice(obu.data))
}

fn aggregation_header(first: bool, last: bool, w: u8, new_sequence: bool) -> u8 {
    let z = if first { 0 } else { 0x80 };
    let y = if last { 0 } else { 0x40 };
    let n = if new_sequence && first { 0x08 } else { 0 };
    z | y | ((w & 0x03) << 4) | n
}

#[derive(Debug)]
pub struct Av1Packetizer {
    header: RtpHeader,
}

impl Av1Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc, VIDEO_CLOCK_RATE),
        }
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt, VIDEO_CLOCK_RATE),
        }
    }
}

impl Packetizer for Av1Packetizer {
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket> {
        let obus: Vec<Obu<'_>> = parse_obus(access_unit)
            .into_iter()
            .filter(|obu| obu.kind != ObuType::TemporalDelimiter)
            .collect();
        if obus.is_empty() {
            return Vec::new();
        }

        let key_frame = obus.iter().any(|obu| obu.kind == ObuType::SequenceHeader);
        let count = obus.len();
        let w = if count > 3 { 0 } else { count as u8 };

        let mut elements = BytesMut::with_capacity(access_unit.len() + count * 2);
        for (i, obu) in obus.iter().enumerate() {
            if w == 0 || i + 1 < count {
                write_leb128(obu.data.len() as u64, &mut elements);
            }
            elements.put_slice(obu.data);
        }
        let elements = elements.freeze();

        self.header.stamp(presentation_time_us);
        let fragments = elements.len().div_ceil(MAX_FRAGMENT);
        let mut packets = Vec::with_capacity(fragments);
        for i in 0..fragments {
            let start = i * MAX_FRAGMENT;
            let end = (start + MAX_FRAGMENT).min(elements.len());
            let first = i == 0;
            let last = i + 1 == fragments;
            let agg = aggregation_header(first, last, if first { w } else { 1 }, key_frame);

            let mut buf = BytesMut::with_capacity(1 + end - start);
            buf.put_u8(agg);
            buf.put_slice(&elements[start..end]);
            packets.push(self.header.packet(last, buf.freeze()));
        }

        tracing::trace!(
            obu_count = count,
            key_frame,
            rtp_packets = packets.len(),
            ts = self.header.timestamp(),
            "frame packetized"
        );
        packets
    }

    fn codec_name(&self) -> &'static str {
        "AV1"
    }

    fn clock_rate(&self) -> u32 {
        self.header.clock_rate()
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }
}
