//! H.265 (HEVC) RTP packetizer: RFC 7798.
//!
//! Key differences from H.264 (RFC 6184):
//!
//! - **2-byte NAL unit header** (vs 1-byte in H.264).
//!   The NAL type is in bits 1..6 of the first byte.
//!
//! - **FU header format**: a 2-byte payload header with type 49 followed
//!   by a 1-byte FU header carrying S/E and the 6-bit NAL type.
//!
//! - **In-band parameter sets**: instead of an aggregation packet, VPS, SPS
//!   and PPS are sent as single NAL packets in front of the first slice of
//!   every IRAP access unit.
//!
//! Every access unit opens with an access unit delimiter (NAL type 35) so
//! receivers over interleaved TCP can find boundaries without the marker.
//! Length-prefixed (HVCC) input is converted to Annex B first.

use bytes::{BufMut, Bytes, BytesMut};

use super::nal::{length_prefixed_to_annex_b, split_annex_b, start_code_len};
use super::rtp::{MAX_PACKET_SIZE, RTP_HEADER_LEN, RtpHeader, RtpPacket};
use super::{Packetizer, VIDEO_CLOCK_RATE};

const NAL_IDR_W_RADL: u8 = 19;
const NAL_IDR_N_LP: u8 = 20;
const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const NAL_FU: u8 = 49;

/// Access unit delimiter, `pic_type` = 2 (any slice type).
const ACCESS_UNIT_DELIMITER: [u8; 3] = [35 << 1, 0x01, 0x80];

const MAX_SINGLE_NAL: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN;
const MAX_FU_FRAGMENT: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN - 3;

fn nal_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3f
}

fn is_parameter_set(kind: u8) -> bool {
    matches!(kind, NAL_VPS | NAL_SPS | NAL_PPS)
}

#[derive(Debug)]
pub struct H265Packetizer {
    header: RtpHeader,
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    force_parameter_sets: bool,
}

impl H265Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::with_header(RtpHeader::new(pt, ssrc, VIDEO_CLOCK_RATE))
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::with_header(RtpHeader::with_random_ssrc(pt, VIDEO_CLOCK_RATE))
    }

    fn with_header(header: RtpHeader) -> Self {
        Self {
            header,
            vps: None,
            sps: None,
            pps: None,
            force_parameter_sets: false,
        }
    }

    pub fn set_parameter_sets(
        &mut self,
        vps: Option<Bytes>,
        sps: Option<Bytes>,
        pps: Option<Bytes>,
    ) {
        self.vps = vps;
        self.sps = sps;
        self.pps = pps;
    }

    /// Inject VPS/SPS/PPS into the next access unit even if it is not IRAP.
    pub fn force_parameter_sets_once(&mut self) {
        self.force_parameter_sets = true;
    }

    pub fn vps(&self) -> Option<&Bytes> {
        self.vps.as_ref()
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    fn capture_parameter_set(&mut self, nal: &[u8]) {
        let slot = match nal_type(nal) {
            NAL_VPS => &mut self.vps,
            NAL_SPS => &mut self.sps,
            NAL_PPS => &mut self.pps,
            _ => return,
        };
        if slot.is_none() {
            tracing::debug!(
                nal_type = nal_type(nal),
                len = nal.len(),
                "H.265 parameter set captured"
            );
            *slot = Some(Bytes::copy_from_slice(nal));
        }
    }

    fn packetize_nal(&mut self, nal: &[u8], mark_last: bool, out: &mut Vec<RtpPacket>) {
        if nal.len() <= MAX_SINGLE_NAL {
            out.push(self.header.packet(mark_last, Bytes::copy_from_slice(nal)));
            return;
        }

        let kind = nal_type(nal);
        // Type replaced by 49; F bit and the layer id MSB are kept.
        let indicator0 = (NAL_FU << 1) | (nal[0] & 0x81);
        let indicator1 = nal[1];
        let payload = &nal[2..];

        let fragments = payload.chunks(MAX_FU_FRAGMENT).count();
        for (i, chunk) in payload.chunks(MAX_FU_FRAGMENT).enumerate() {
            let last = i + 1 == fragments;
            let mut fu_header = kind;
            if i == 0 {
                fu_header |= 0x80;
            }
            if last {
                fu_header |= 0x40;
            }
            let mut buf = BytesMut::with_capacity(3 + chunk.len());
            buf.put_u8(indicator0);
            buf.put_u8(indicator1);
            buf.put_u8(fu_header);
            buf.put_slice(chunk);
            out.push(self.header.packet(mark_last && last, buf.freeze()));
        }
        tracing::trace!(nal_type = kind, nal_size = nal.len(), fragments, "FU fragmented NAL unit");
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket> {
        let converted;
        let annex_b = if start_code_len(access_unit) == 0 {
            match length_prefixed_to_annex_b(access_unit) {
                Some(data) => {
                    converted = data;
                    &converted[..]
                }
                None => {
                    tracing::warn!(
                        len = access_unit.len(),
                        "H.265 access unit has no start code, dropped"
                    );
                    return Vec::new();
                }
            }
        } else {
            access_unit
        };

        let nal_units: Vec<&[u8]> = split_annex_b(annex_b)
            .into_iter()
            .filter(|nal| nal.len() >= 2)
            .collect();
        if nal_units.is_empty() {
            return Vec::new();
        }
        for nal in &nal_units {
            self.capture_parameter_set(nal);
        }

        self.header.stamp(presentation_time_us);
        let mut packets = Vec::with_capacity(nal_units.len() + 4);
        packets.push(
            self.header
                .packet(false, Bytes::from_static(&ACCESS_UNIT_DELIMITER)),
        );

        let mut injected = false;
        let count = nal_units.len();
        for (i, nal) in nal_units.into_iter().enumerate() {
            let kind = nal_type(nal);
            let irap = matches!(kind, NAL_IDR_W_RADL | NAL_IDR_N_LP);
            if (irap || self.force_parameter_sets) && !is_parameter_set(kind) && !injected {
                let sets: Vec<Bytes> = [&self.vps, &self.sps, &self.pps]
                    .into_iter()
                    .flatten()
                    .cloned()
                    .collect();
                for set in sets {
                    packets.push(self.header.packet(false, set));
                }
                injected = true;
                self.force_parameter_sets = false;
            }
            self.packetize_nal(nal, i + 1 == count, &mut packets);
        }

        tracing::trace!(
            nal_count = count,
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );
        packets
    }

    fn codec_name(&self) -> &'static str {
        "H265"
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
