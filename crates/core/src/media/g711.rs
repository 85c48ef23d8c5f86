use bytes::Bytes;

use super::Packetizer;
use super::rtp::{MAX_PACKET_SIZE, RTP_HEADER_LEN, RtpHeader, RtpPacket};

/// Static payload type for PCMA (RFC 3551 §6).
pub const PCMA_PAYLOAD_TYPE: u8 = 8;

const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN;

/// G.711 A-law packetizer. Samples are copied verbatim, split at the
/// packet budget; the marker goes on the last chunk.
#[derive(Debug)]
pub struct G711Packetizer {
    header: RtpHeader,
}

impl G711Packetizer {
    pub fn new(ssrc: u32, sample_rate: u32) -> Self {
        Self {
            header: RtpHeader::new(PCMA_PAYLOAD_TYPE, ssrc, sample_rate),
        }
    }

    pub fn with_random_ssrc(sample_rate: u32) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(PCMA_PAYLOAD_TYPE, sample_rate),
        }
    }
}

impl Packetizer for G711Packetizer {
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket> {
        if access_unit.is_empty() {
            return Vec::new();
        }
        self.header.stamp(presentation_time_us);
        let chunks = access_unit.len().div_ceil(MAX_PAYLOAD);
        access_unit
            .chunks(MAX_PAYLOAD)
            .enumerate()
            .map(|(i, chunk)| {
                self.header
                    .packet(i + 1 == chunks, Bytes::copy_from_slice(chunk))
            })
            .collect()
    }

    fn codec_name(&self) -> &'static str {
        "PCMA"
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
