//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the body of ANNOUNCE requests (client mode) and DESCRIBE
//! responses (server mode). The layout:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=- <sess-id> <sess-id> IN IP4 127.0.0.1     ← origin
//! s=ScreenStream                               ← session name
//! i=ScreenStream                               ← session information
//! c=IN IP4 0.0.0.0                             ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=type:broadcast
//! a=control:*                                  ← aggregate control
//! m=video 0 RTP/AVP 96                         ← video block, track 0
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1; ...
//! a=control:trackID=0
//! m=audio 0 RTP/AVP 97                         ← optional audio, track 1
//! ...
//! ```
//!
//! The output is a pure function of its inputs, so every connection gets
//! a freshly built, identical description.

use std::fmt::Write as _;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::media::g711::PCMA_PAYLOAD_TYPE;
use crate::media::{
    AUDIO_TRACK_ID, AudioCodec, AudioParams, PAYLOAD_TYPE_BASE, VIDEO_CLOCK_RATE, VIDEO_TRACK_ID,
    VideoCodec, VideoParams,
};

/// Session name advertised in `s=` and `i=`.
pub const SESSION_NAME: &str = "ScreenStream";

/// Used when the SPS is missing or too short: Constrained Baseline, level 3.1.
pub const DEFAULT_PROFILE_LEVEL_ID: &str = "42e01f";

/// MPEG-4 sampling frequency index table (ISO 14496-3 §1.6.3.4).
const AUDIO_SAMPLING_RATES: [i32; 16] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, -1, -1,
    -1,
];

/// Index used for rates missing from the table (48 kHz).
const DEFAULT_SAMPLING_INDEX: usize = 3;

/// Build the session description for a video track and optional audio track.
pub fn build_sdp(video: &VideoParams, audio: Option<&AudioParams>, session_id: u32) -> String {
    let mut sdp = String::with_capacity(512);
    sdp.push_str("v=0\r\n");
    let _ = write!(sdp, "o=- {session_id} {session_id} IN IP4 127.0.0.1\r\n");
    let _ = write!(sdp, "s={SESSION_NAME}\r\n");
    let _ = write!(sdp, "i={SESSION_NAME}\r\n");
    sdp.push_str("c=IN IP4 0.0.0.0\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=type:broadcast\r\n");
    sdp.push_str("a=control:*\r\n");

    write_video_block(&mut sdp, video);
    if let Some(audio) = audio {
        write_audio_block(&mut sdp, audio);
    }

    tracing::debug!(session_id, "SDP: {}", sdp.replace("\r\n", " | "));
    sdp
}

fn write_video_block(sdp: &mut String, video: &VideoParams) {
    let pt = PAYLOAD_TYPE_BASE + VIDEO_TRACK_ID;
    let sps = BASE64_STANDARD.encode(&video.sps);
    let pps = video
        .pps
        .as_ref()
        .map(|p| BASE64_STANDARD.encode(p))
        .unwrap_or_default();
    let vps = video
        .vps
        .as_ref()
        .map(|v| BASE64_STANDARD.encode(v))
        .unwrap_or_default();

    let _ = write!(sdp, "m=video 0 RTP/AVP {pt}\r\n");
    match video.codec {
        VideoCodec::H264 => {
            let _ = write!(sdp, "a=rtpmap:{pt} H264/{VIDEO_CLOCK_RATE}\r\n");
            let profile_level_id = profile_level_id(&video.sps);
            let _ = write!(
                sdp,
                "a=fmtp:{pt} packetization-mode=1; level-asymmetry-allowed=1; \
                 profile-level-id={profile_level_id}; sprop-parameter-sets={sps},{pps}\r\n"
            );
        }
        VideoCodec::H265 => {
            let _ = write!(sdp, "a=rtpmap:{pt} H265/{VIDEO_CLOCK_RATE}\r\n");
            let parts: Vec<String> = [("sprop-vps", vps), ("sprop-sps", sps), ("sprop-pps", pps)]
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            if !parts.is_empty() {
                let _ = write!(sdp, "a=fmtp:{pt} {}\r\n", parts.join("; "));
            }
        }
        VideoCodec::Av1 => {
            let _ = write!(sdp, "a=rtpmap:{pt} AV1/{VIDEO_CLOCK_RATE}\r\n");
        }
    }
    let _ = write!(sdp, "a=control:trackID={VIDEO_TRACK_ID}\r\n");
}

fn write_audio_block(sdp: &mut String, audio: &AudioParams) {
    match audio.codec {
        AudioCodec::G711 => {
            let pt = PCMA_PAYLOAD_TYPE;
            let _ = write!(sdp, "m=audio 0 RTP/AVP {pt}\r\n");
            let _ = write!(sdp, "a=rtpmap:{pt} PCMA/8000/1\r\n");
        }
        AudioCodec::Aac => {
            let pt = PAYLOAD_TYPE_BASE + AUDIO_TRACK_ID;
            let channels = if audio.channels >= 2 { 2 } else { 1 };
            let config = aac_audio_specific_config(audio.sample_rate, channels);
            let _ = write!(sdp, "m=audio 0 RTP/AVP {pt}\r\n");
            let _ = write!(
                sdp,
                "a=rtpmap:{pt} mpeg4-generic/{}/{channels}\r\n",
                audio.sample_rate
            );
            let _ = write!(
                sdp,
                "a=fmtp:{pt} streamtype=5; profile-level-id=16; mode=AAC-hbr; config={config:04x}; \
                 sizeLength=13; indexLength=3; indexDeltaLength=3; constantDuration=1024\r\n"
            );
        }
        AudioCodec::Opus => {
            let pt = PAYLOAD_TYPE_BASE + AUDIO_TRACK_ID;
            let _ = write!(sdp, "m=audio 0 RTP/AVP {pt}\r\n");
            let _ = write!(sdp, "a=rtpmap:{pt} OPUS/48000/2\r\n");
            let _ = write!(
                sdp,
                "a=fmtp:{pt} sprop-stereo=1; maxplaybackrate=48000; sprop-maxcapturerate=48000\r\n"
            );
            sdp.push_str("a=ptime:20\r\n");
        }
    }
    let _ = write!(sdp, "a=control:trackID={AUDIO_TRACK_ID}\r\n");
}

/// `profile-level-id` from SPS bytes 1..=3 (RFC 6184 §8.1).
///
/// Falls back to [`DEFAULT_PROFILE_LEVEL_ID`] when the SPS is too short.
pub fn profile_level_id(sps: &[u8]) -> String {
    match sps.get(1..4) {
        Some(bytes) => format!("{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2]),
        None => {
            tracing::warn!(
                sps_len = sps.len(),
                fallback = DEFAULT_PROFILE_LEVEL_ID,
                "SPS too short for profile-level-id, using fallback"
            );
            DEFAULT_PROFILE_LEVEL_ID.to_string()
        }
    }
}

/// Sampling frequency index for `sample_rate`, defaulting to 48 kHz.
pub fn sampling_frequency_index(sample_rate: u32) -> usize {
    AUDIO_SAMPLING_RATES
        .iter()
        .position(|&rate| rate >= 0 && rate as u32 == sample_rate)
        .unwrap_or(DEFAULT_SAMPLING_INDEX)
}

/// Two-byte AAC-LC AudioSpecificConfig: object type 2, frequency index,
/// channel configuration.
pub fn aac_audio_specific_config(sample_rate: u32, channels: u8) -> u16 {
    let index = sampling_frequency_index(sample_rate) as u16;
    (2 << 11) | ((index & 0x0f) << 7) | ((u16::from(channels) & 0x0f) << 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0xc0, 0x1f];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    #[test]
    fn h264_session_layout() {
        let video = VideoParams::h264(SPS.to_vec(), PPS.to_vec());
        let sdp = build_sdp(&video, None, 1234);
        let expected = "v=0\r\n\
            o=- 1234 1234 IN IP4 127.0.0.1\r\n\
            s=ScreenStream\r\n\
            i=ScreenStream\r\n\
            c=IN IP4 0.0.0.0\r\n\
            t=0 0\r\n\
            a=type:broadcast\r\n\
            a=control:*\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=fmtp:96 packetization-mode=1; level-asymmetry-allowed=1; profile-level-id=42c01f; \
            sprop-parameter-sets=Z0LAHw==,aM48gA==\r\n\
            a=control:trackID=0\r\n";
        assert_eq!(sdp, expected);
    }

    #[test]
    fn short_sps_falls_back() {
        assert_eq!(profile_level_id(&[0x67, 0x42]), DEFAULT_PROFILE_LEVEL_ID);
        assert_eq!(profile_level_id(&SPS), "42c01f");
    }

    #[test]
    fn h265_skips_empty_parameter_sets() {
        let mut video = VideoParams::h265(vec![0x40, 0x01], vec![0x42, 0x01], vec![0x44, 0x01]);
        video.vps = None;
        let sdp = build_sdp(&video, None, 1);
        assert!(sdp.contains("a=rtpmap:96 H265/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 sprop-sps=QgE=; sprop-pps=RAE=\r\n"));
        assert!(!sdp.contains("sprop-vps"));
    }

    #[test]
    fn av1_has_no_fmtp() {
        let sdp = build_sdp(&VideoParams::av1(vec![0x0a, 0x00]), None, 1);
        assert!(sdp.contains("a=rtpmap:96 AV1/90000\r\na=control:trackID=0\r\n"));
        assert!(!sdp.contains("a=fmtp"));
    }

    #[test]
    fn aac_block() {
        let video = VideoParams::h264(SPS.to_vec(), PPS.to_vec());
        let audio = AudioParams {
            codec: AudioCodec::Aac,
            sample_rate: 44_100,
            channels: 2,
        };
        let sdp = build_sdp(&video, Some(&audio), 1);
        assert!(sdp.contains("m=audio 0 RTP/AVP 97\r\n"));
        assert!(sdp.contains("a=rtpmap:97 mpeg4-generic/44100/2\r\n"));
        assert!(sdp.contains("config=1210;"));
        assert!(sdp.ends_with("a=control:trackID=1\r\n"));
    }

    #[test]
    fn unknown_sample_rate_uses_48k_index() {
        assert_eq!(sampling_frequency_index(12_345), 3);
        assert_eq!(aac_audio_specific_config(12_345, 2), 0x1190);
        assert_eq!(sampling_frequency_index(8_000), 11);
    }

    #[test]
    fn g711_and_opus_blocks() {
        let video = VideoParams::av1(vec![0x0a]);
        let g711 = AudioParams {
            codec: AudioCodec::G711,
            sample_rate: 8_000,
            channels: 1,
        };
        let sdp = build_sdp(&video, Some(&g711), 1);
        assert!(sdp.contains("m=audio 0 RTP/AVP 8\r\na=rtpmap:8 PCMA/8000/1\r\n"));

        let opus = AudioParams {
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channels: 2,
        };
        let sdp = build_sdp(&video, Some(&opus), 1);
        assert!(sdp.contains("a=rtpmap:97 OPUS/48000/2\r\n"));
        assert!(sdp.contains("a=ptime:20\r\n"));
    }
}
