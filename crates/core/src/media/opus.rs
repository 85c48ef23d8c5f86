use bytes::Bytes;

use super::Packetizer;
use super::rtp::{RtpHeader, RtpPacket};

/// Opus always runs a 48 kHz RTP clock, whatever the input rate (RFC 7587 §4.1).
pub const OPUS_CLOCK_RATE: u32 = 48_000;

/// Opus packetizer: one Opus packet per RTP packet, never fragmented.
#[derive(Debug)]
pub struct OpusPacketizer {
    header: RtpHeader,
}

impl OpusPacketizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc, OPUS_CLOCK_RATE),
        }
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt, OPUS_CLOCK_RATE),
        }
    }
}

impl Packetizer for OpusPacketizer {
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket> {
        if access_unit.is_empty() {
            return Vec::new();
        }
        self.header.stamp(presentation_time_us);
        vec![
            self.header
                .packet(true, Bytes::copy_from_slice(access_unit)),
        ]
    }

    fn codec_name(&self) -> &'static str {
        "OPUS"
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
