use bytes::{BufMut, Bytes, BytesMut};

use super::Packetizer;
use super::VIDEO_CLOCK_RATE;
use super::nal::split_annex_b;
use super::rtp::{MAX_PACKET_SIZE, RTP_HEADER_LEN, RtpHeader, RtpPacket};

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// Largest NAL sent as a Single NAL Unit packet.
const MAX_SINGLE_NAL: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN;
/// Largest fragment payload after the 2-byte FU-A header.
const MAX_FU_FRAGMENT: usize = MAX_PACKET_SIZE - RTP_HEADER_LEN - 2;

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts H.264 Annex B access units into RTP packets using three
/// packet types from RFC 6184:
///
/// - **Single NAL Unit** (§5.6): NALs that fit in one packet are sent as-is.
///
/// - **STAP-A** (§5.7.1): every IDR access unit is preceded by one
///   aggregation packet carrying SPS and PPS, so a receiver joining late
///   can start decoding at any key frame:
///
///   ```text
///   [Type=24] [SPS size:16] [SPS] [PPS size:16] [PPS]
///   ```
///
/// - **FU-A Fragmentation** (§5.8): NALs exceeding the packet budget are
///   split, each fragment carrying a 2-byte FU header:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]
///   ```
///
/// Parameter sets found in the bitstream are captured and replace any
/// previously known ones; they travel in the STAP-A rather than inline.
/// Until the first IDR has been sent, non-IDR access units are dropped.
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an access unit. The STAP-A never carries it.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    key_frame_sent: bool,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self::with_header(RtpHeader::new(pt, ssrc, VIDEO_CLOCK_RATE))
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::with_header(RtpHeader::with_random_ssrc(pt, VIDEO_CLOCK_RATE))
    }

    fn with_header(header: RtpHeader) -> Self {
        Self {
            header,
            sps: None,
            pps: None,
            key_frame_sent: false,
        }
    }

    /// Provide SPS/PPS out of band (e.g. from encoder codec-specific data).
    ///
    /// Resets the key frame gate: nothing is sent until the next IDR.
    pub fn set_parameter_sets(&mut self, sps: Bytes, pps: Bytes) {
        self.sps = Some(sps);
        self.pps = Some(pps);
        self.key_frame_sent = false;
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Forget the key frame gate after a reconnect.
    pub fn reset(&mut self) {
        self.key_frame_sent = false;
    }

    fn stap_a(&self) -> Option<Bytes> {
        let (sps, pps) = (self.sps.as_ref()?, self.pps.as_ref()?);
        let mut buf = BytesMut::with_capacity(1 + 2 + sps.len() + 2 + pps.len());
        buf.put_u8(NAL_STAP_A);
        buf.put_u16(sps.len() as u16);
        buf.put_slice(sps);
        buf.put_u16(pps.len() as u16);
        buf.put_slice(pps);
        Some(buf.freeze())
    }

    fn capture_parameter_set(&mut self, nal: &[u8]) {
        let slot = match nal[0] & 0x1f {
            NAL_SPS => &mut self.sps,
            NAL_PPS => &mut self.pps,
            _ => return,
        };
        if slot.as_deref() != Some(nal) {
            tracing::debug!(
                nal_type = nal[0] & 0x1f,
                len = nal.len(),
                "H.264 parameter set captured"
            );
            *slot = Some(Bytes::copy_from_slice(nal));
        }
    }

    /// Packetize a single NAL unit into one or more RTP packets.
    ///
    /// If the NAL fits within the packet budget it is sent as a Single NAL
    /// Unit packet (RFC 6184 §5.6). Otherwise, FU-A fragmentation is used
    /// (RFC 6184 §5.8).
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool, out: &mut Vec<RtpPacket>) {
        if nal_unit.is_empty() {
            return;
        }

        if nal_unit.len() <= MAX_SINGLE_NAL {
            out.push(
                self.header
                    .packet(is_last_nal, Bytes::copy_from_slice(nal_unit)),
            );
            return;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0x60) | NAL_FU_A;
        let payload = &nal_unit[1..];

        let fragments = payload.chunks(MAX_FU_FRAGMENT).count();
        for (i, chunk) in payload.chunks(MAX_FU_FRAGMENT).enumerate() {
            let first = i == 0;
            let last = i + 1 == fragments;
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | nal_type;

            let mut buf = BytesMut::with_capacity(2 + chunk.len());
            buf.put_u8(fu_indicator);
            buf.put_u8(fu_header);
            buf.put_slice(chunk);
            out.push(self.header.packet(is_last_nal && last, buf.freeze()));
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments,
            "FU-A fragmented NAL unit"
        );
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket> {
        let nal_units = split_annex_b(access_unit);
        for nal in &nal_units {
            self.capture_parameter_set(nal);
        }

        let media: Vec<&[u8]> = nal_units
            .into_iter()
            .filter(|nal| !matches!(nal[0] & 0x1f, NAL_SPS | NAL_PPS))
            .collect();
        if media.is_empty() {
            return Vec::new();
        }

        self.header.stamp(presentation_time_us);
        let mut packets = Vec::new();

        let is_idr = media.iter().any(|nal| nal[0] & 0x1f == NAL_IDR);
        if is_idr {
            match self.stap_a() {
                Some(stap_a) => {
                    packets.push(self.header.packet(false, stap_a));
                    self.key_frame_sent = true;
                }
                None => tracing::warn!("IDR without SPS/PPS, cannot announce key frame"),
            }
        }

        if !self.key_frame_sent {
            tracing::trace!(presentation_time_us, "waiting for key frame, access unit dropped");
            return Vec::new();
        }

        let count = media.len();
        for (i, nal) in media.into_iter().enumerate() {
            self.packetize_nal(nal, i + 1 == count, &mut packets);
        }

        tracing::trace!(
            nal_count = count,
            rtp_packets = packets.len(),
            frame_bytes = access_unit.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );

        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
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
