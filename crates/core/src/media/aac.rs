use bytes::{BufMut, BytesMut};

use super::Packetizer;
use super::rtp::{MAX_PACKET_SIZE, RTP_HEADER_LEN, RtpHeader, RtpPacket};

/// AU-headers-length (16 bits) plus one 16-bit AU header.
const AU_HEADER_SECTION_LEN: usize = 4;
const MAX_FRAGMENT: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN - AU_HEADER_SECTION_LEN;

/// AAC packetizer, RFC 3640 `AAC-hbr` mode.
///
/// Each packet carries one AU header section:
///
/// ```text
/// [AU-headers-length = 16 bits] [AU-size:13 | AU-Index:3]
/// ```
///
/// ADTS headers are stripped before packetization; raw access units pass
/// through unchanged. An access unit larger than one packet is split and
/// each fragment carries its own fragment size.
#[derive(Debug)]
pub struct AacPacketizer {
    header: RtpHeader,
}

impl AacPacketizer {
    pub fn new(pt: u8, ssrc: u32, sample_rate: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc, sample_rate),
        }
    }

    pub fn with_random_ssrc(pt: u8, sample_rate: u32) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt, sample_rate),
        }
    }

    /// The RTP clock follows the sample rate, which encoders may report late.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.header.set_clock_rate(sample_rate);
    }
}

/// Length of a valid ADTS header at the start of `data`, or `None`.
///
/// Checks the 12-bit syncword, layer 0 and, when enough bytes are present,
/// that `aac_frame_length` covers the header and fits in `data`.
pub fn adts_header_len(data: &[u8]) -> Option<usize> {
    if data.len() < 7 || data[0] != 0xff || data[1] & 0xf0 != 0xf0 {
        return None;
    }
    if (data[1] >> 1) & 0x03 != 0 {
        return None;
    }
    let protection_absent = data[1] & 0x01 == 1;
    let header_len = if protection_absent { 7 } else { 9 };
    if data.len() < header_len {
        return None;
    }
    if data.len() >= header_len + 2 {
        let frame_len = ((data[3] as usize & 0x03) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize >> 5) & 0x07);
        if frame_len < header_len || frame_len > data.len() {
            return None;
        }
    }
    Some(header_len)
}

impl Packetizer for AacPacketizer {
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket> {
        let raw = match adts_header_len(access_unit) {
            Some(len) if access_unit.len() > len => &access_unit[len..],
            _ => access_unit,
        };
        if raw.is_empty() {
            return Vec::new();
        }

        self.header.stamp(presentation_time_us);
        let fragments = raw.len().div_ceil(MAX_FRAGMENT);
        let mut packets = Vec::with_capacity(fragments);
        for (i, chunk) in raw.chunks(MAX_FRAGMENT).enumerate() {
            let size = chunk.len();
            let mut buf = BytesMut::with_capacity(AU_HEADER_SECTION_LEN + size);
            buf.put_u8(0x00);
            buf.put_u8(0x10);
            buf.put_u8((size >> 5) as u8);
            buf.put_u8(((size << 3) & 0xf8) as u8);
            buf.put_slice(chunk);
            packets.push(self.header.packet(i + 1 == fragments, buf.freeze()));
        }
        packets
    }

    fn codec_name(&self) -> &'static str {
        "mpeg4-generic"
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
