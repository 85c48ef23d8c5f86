//! Media codecs and RTP packetization.
//!
//! This module provides the [`Packetizer`] trait and codec-specific
//! implementations that convert encoded access units into RTP packets.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded access unit is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): media clock, 90 kHz for all video here.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit.
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Payload type |
//! |-------|--------|-----|--------------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | 96 |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | 96 |
//! | AV1 | [`av1`] | [AV1 RTP](https://aomediacodec.github.io/av1-rtp-spec/) | 96 |
//! | AAC | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) | 97 |
//! | G.711 A-law | [`g711`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) | 8 |
//! | Opus | [`opus`] | [RFC 7587](https://tools.ietf.org/html/rfc7587) | 97 |

pub mod aac;
pub mod av1;
pub mod g711;
pub mod h264;
pub mod h265;
pub mod nal;
pub mod opus;
pub mod rtp;

use bytes::Bytes;

pub use rtp::{RtpHeader, RtpPacket};

/// Base dynamic payload type; video uses `base + VIDEO_TRACK_ID`.
pub const PAYLOAD_TYPE_BASE: u8 = 96;
/// SDP track index of the video stream.
pub const VIDEO_TRACK_ID: u8 = 0;
/// SDP track index of the audio stream.
pub const AUDIO_TRACK_ID: u8 = 1;
/// RTP clock rate shared by all video codecs.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Codec-specific RTP packetizer.
///
/// Each implementation owns its track's payload type, a 16-bit sequence
/// counter, and the RTP timestamp derived from presentation time. State is
/// never shared across tracks, and a packetizer is not meant to be driven
/// from more than one producer: methods take `&mut self`.
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]: packetizers
/// compose it rather than reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one encoded access unit into RTP packets.
    ///
    /// Every returned packet carries the timestamp
    /// `presentation_time_us * clock_rate / 1_000_000` (mod 2^32); the
    /// marker bit is set on exactly the last packet. An access unit that
    /// cannot be sent yet (e.g. no key frame seen) yields no packets.
    fn packetize(&mut self, access_unit: &[u8], presentation_time_us: i64) -> Vec<RtpPacket>;

    /// Codec name as used in `a=rtpmap` (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551).
    fn payload_type(&self) -> u8;

    /// Sequence number of the next packet (for the `RTP-Info` header).
    fn next_sequence(&self) -> u16;

    /// Timestamp of the last packetized access unit (for `RTP-Info`).
    fn rtp_timestamp(&self) -> u32;

    /// Synchronization source of this track.
    fn ssrc(&self) -> u32;
}

/// Video codec tag negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

/// Audio codec tag negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    G711,
    Opus,
}

/// Video codec parameters, immutable once a session is negotiated.
///
/// For AV1, `sps` holds the sequence header OBU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoParams {
    pub codec: VideoCodec,
    pub sps: Bytes,
    pub pps: Option<Bytes>,
    pub vps: Option<Bytes>,
}

impl VideoParams {
    pub fn h264(sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Self {
        Self {
            codec: VideoCodec::H264,
            sps: sps.into(),
            pps: Some(pps.into()),
            vps: None,
        }
    }

    pub fn h265(vps: impl Into<Bytes>, sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Self {
        Self {
            codec: VideoCodec::H265,
            sps: sps.into(),
            pps: Some(pps.into()),
            vps: Some(vps.into()),
        }
    }

    pub fn av1(sequence_header: impl Into<Bytes>) -> Self {
        Self {
            codec: VideoCodec::Av1,
            sps: sequence_header.into(),
            pps: None,
            vps: None,
        }
    }

    /// Whether every parameter set the codec needs is present.
    pub fn is_complete(&self) -> bool {
        let present = |b: &Option<Bytes>| b.as_ref().is_some_and(|b| !b.is_empty());
        match self.codec {
            VideoCodec::H264 => !self.sps.is_empty() && present(&self.pps),
            VideoCodec::H265 => !self.sps.is_empty() && present(&self.pps) && present(&self.vps),
            VideoCodec::Av1 => !self.sps.is_empty(),
        }
    }

    /// Build a packetizer for this track with a random SSRC.
    pub fn packetizer(&self) -> Box<dyn Packetizer> {
        let pt = PAYLOAD_TYPE_BASE + VIDEO_TRACK_ID;
        match self.codec {
            VideoCodec::H264 => {
                let mut p = h264::H264Packetizer::with_random_ssrc(pt);
                if let Some(pps) = &self.pps {
                    p.set_parameter_sets(self.sps.clone(), pps.clone());
                }
                Box::new(p)
            }
            VideoCodec::H265 => {
                let mut p = h265::H265Packetizer::with_random_ssrc(pt);
                p.set_parameter_sets(self.vps.clone(), Some(self.sps.clone()), self.pps.clone());
                Box::new(p)
            }
            VideoCodec::Av1 => Box::new(av1::Av1Packetizer::with_random_ssrc(pt)),
        }
    }
}

/// Audio codec parameters. A session may be video-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioParams {
    /// Build a packetizer for this track with a random SSRC.
    pub fn packetizer(&self) -> Box<dyn Packetizer> {
        match self.codec {
            AudioCodec::Aac => Box::new(aac::AacPacketizer::with_random_ssrc(
                PAYLOAD_TYPE_BASE + AUDIO_TRACK_ID,
                self.sample_rate,
            )),
            AudioCodec::G711 => Box::new(g711::G711Packetizer::with_random_ssrc(self.sample_rate)),
            AudioCodec::Opus => Box::new(opus::OpusPacketizer::with_random_ssrc(
                PAYLOAD_TYPE_BASE + AUDIO_TRACK_ID,
            )),
        }
    }
}

/// Which track a [`MediaFrame`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn track_id(self) -> u8 {
        match self {
            Self::Video => VIDEO_TRACK_ID,
            Self::Audio => AUDIO_TRACK_ID,
        }
    }
}

/// One encoded access unit travelling from an encoder to a packetizer.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub track: TrackKind,
    pub data: Bytes,
    pub presentation_time_us: i64,
    pub key_frame: bool,
}

impl MediaFrame {
    pub fn video(data: impl Into<Bytes>, presentation_time_us: i64, key_frame: bool) -> Self {
        Self {
            track: TrackKind::Video,
            data: data.into(),
            presentation_time_us,
            key_frame,
        }
    }

    pub fn audio(data: impl Into<Bytes>, presentation_time_us: i64) -> Self {
        Self {
            track: TrackKind::Audio,
            data: data.into(),
            presentation_time_us,
            key_frame: true,
        }
    }
}

/// Packetizers for every track of one session, keyed by [`TrackKind`].
pub struct TrackPacketizers {
    video: Box<dyn Packetizer>,
    audio: Option<Box<dyn Packetizer>>,
}

impl TrackPacketizers {
    pub fn new(video: &VideoParams, audio: Option<&AudioParams>) -> Self {
        Self {
            video: video.packetizer(),
            audio: audio.map(AudioParams::packetizer),
        }
    }

    /// Replace the video packetizer after the encoder renegotiated its
    /// parameter sets. The new track gets a fresh SSRC.
    pub fn replace_video(&mut self, video: &VideoParams) {
        self.video = video.packetizer();
        tracing::debug!(
            codec = ?video.codec,
            ssrc = self.video.ssrc(),
            "video packetizer replaced"
        );
    }

    pub fn get(&self, track: TrackKind) -> Option<&dyn Packetizer> {
        match track {
            TrackKind::Video => Some(self.video.as_ref()),
            TrackKind::Audio => self.audio.as_deref(),
        }
    }

    /// Packetize a frame on its own track. Audio frames for a video-only
    /// session are dropped.
    pub fn packetize(&mut self, frame: &MediaFrame) -> Vec<RtpPacket> {
        match frame.track {
            TrackKind::Video => self.video.packetize(&frame.data, frame.presentation_time_us),
            TrackKind::Audio => match self.audio.as_mut() {
                Some(p) => p.packetize(&frame.data, frame.presentation_time_us),
                None => Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness_per_codec() {
        assert!(VideoParams::h264(vec![0x67, 1, 2, 3], vec![0x68]).is_complete());
        let mut p = VideoParams::h264(vec![0x67], vec![0x68]);
        p.pps = None;
        assert!(!p.is_complete());
        assert!(VideoParams::h265(vec![0x40], vec![0x42], vec![0x44]).is_complete());
        assert!(VideoParams::av1(vec![0x0a, 0x01, 0x00]).is_complete());
    }

    #[test]
    fn packetizer_factories_pick_payload_types() {
        let video = VideoParams::h264(vec![0x67, 0x42, 0, 0x1f], vec![0x68, 0xce]);
        assert_eq!(video.packetizer().payload_type(), 96);
        let aac = AudioParams {
            codec: AudioCodec::Aac,
            sample_rate: 44_100,
            channels: 2,
        };
        assert_eq!(aac.packetizer().payload_type(), 97);
        assert_eq!(aac.packetizer().clock_rate(), 44_100);
        let g711 = AudioParams {
            codec: AudioCodec::G711,
            sample_rate: 8_000,
            channels: 1,
        };
        assert_eq!(g711.packetizer().payload_type(), 8);
        let opus = AudioParams {
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(opus.packetizer().clock_rate(), 48_000);
    }

    #[test]
    fn video_only_session_drops_audio() {
        let video = VideoParams::h264(vec![0x67, 0x42, 0, 0x1f], vec![0x68, 0xce]);
        let mut tracks = TrackPacketizers::new(&video, None);
        assert!(tracks.get(TrackKind::Audio).is_none());
        assert!(tracks.packetize(&MediaFrame::audio(vec![1, 2, 3], 0)).is_empty());
    }
}
