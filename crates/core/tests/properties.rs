use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use proptest::prelude::*;
use screencast::media::h264::H264Packetizer;
use screencast::media::rtp::RtpHeader;
use screencast::media::{AudioCodec, AudioParams, Packetizer, VideoParams};
use screencast::module::{ModuleState, SessionStateMachine, StartToken, StopAction};
use screencast::protocol::sdp::{
    DEFAULT_PROFILE_LEVEL_ID, aac_audio_specific_config, build_sdp, profile_level_id,
    sampling_frequency_index,
};

const AAC_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

fn aac_config_in(sdp: &str) -> u16 {
    let start = sdp.find("config=").expect("no config parameter") + "config=".len();
    let hex: String = sdp[start..].chars().take_while(char::is_ascii_hexdigit).collect();
    u16::from_str_radix(&hex, 16).unwrap()
}

proptest! {
    #[test]
    fn aac_sdp_is_deterministic_and_config_round_trips(
        rate in prop::sample::select(AAC_RATES.to_vec()),
        channels in 1u8..=2,
        session_id in any::<u32>(),
    ) {
        let video = VideoParams::h264(vec![0x67, 0x42, 0xc0, 0x1f], vec![0x68, 0xce, 0x3c, 0x80]);
        let audio = AudioParams { codec: AudioCodec::Aac, sample_rate: rate, channels };
        let first = build_sdp(&video, Some(&audio), session_id);
        prop_assert_eq!(&first, &build_sdp(&video, Some(&audio), session_id));

        let config = aac_config_in(&first);
        prop_assert_eq!(config, aac_audio_specific_config(rate, channels));
        prop_assert_eq!(config >> 11, 2);
        prop_assert_eq!(usize::from((config >> 7) & 0x0f), sampling_frequency_index(rate));
        prop_assert_eq!(AAC_RATES[usize::from((config >> 7) & 0x0f)], rate);
        prop_assert_eq!(((config >> 3) & 0x0f) as u8, channels);
        let rtpmap = format!("mpeg4-generic/{rate}/{channels}");
        prop_assert!(first.contains(&rtpmap));
    }

    #[test]
    fn profile_level_id_never_fails(sps in prop::collection::vec(any::<u8>(), 0..64)) {
        let id = profile_level_id(&sps);
        if sps.len() >= 4 {
            prop_assert_eq!(id, format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]));
        } else {
            prop_assert_eq!(id, DEFAULT_PROFILE_LEVEL_ID);
        }
    }

    #[test]
    fn sdp_carries_supplied_parameter_sets(
        sps in prop::collection::vec(any::<u8>(), 1..48),
        pps in prop::collection::vec(any::<u8>(), 1..16),
    ) {
        let sdp = build_sdp(&VideoParams::h264(sps.clone(), pps.clone()), None, 1);
        prop_assert!(sdp.contains("a=rtpmap:96 H264/90000"));
        let sprop = format!(
            "sprop-parameter-sets={},{}",
            BASE64_STANDARD.encode(&sps),
            BASE64_STANDARD.encode(&pps)
        );
        prop_assert!(sdp.contains(&sprop), "{}", sdp);
    }

    #[test]
    fn sequence_numbers_wrap_without_gaps(start in any::<u16>(), count in 1usize..600) {
        let mut header = RtpHeader::new(96, 0x1234_5678, 90_000);
        header.set_sequence(start);
        let mut expected = start;
        for _ in 0..count {
            let packet = header.packet(false, Bytes::new());
            prop_assert_eq!(packet.sequence, expected);
            expected = expected.wrapping_add(1);
        }
        prop_assert_eq!(header.sequence(), expected);
    }

    #[test]
    fn h264_packets_are_contiguous_and_timestamps_monotonic(
        sizes in prop::collection::vec(1usize..4000, 1..20),
        steps in prop::collection::vec(0i64..100_000, 20),
    ) {
        let mut packetizer = H264Packetizer::new(96, 7);
        packetizer.set_parameter_sets(
            Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1f]),
            Bytes::from_static(&[0x68, 0xce]),
        );

        let mut pts = 0i64;
        let mut last: Option<(u16, u32)> = None;
        for (i, size) in sizes.iter().enumerate() {
            let nal_type = if i == 0 { 0x65 } else { 0x41 };
            let mut unit = vec![0, 0, 0, 1, nal_type];
            unit.extend(std::iter::repeat_n(0xab, *size));
            pts += steps[i];

            let packets = packetizer.packetize(&unit, pts);
            prop_assert!(!packets.is_empty());
            prop_assert!(packets.last().unwrap().marker);
            prop_assert_eq!(packets.iter().filter(|p| p.marker).count(), 1);
            for packet in packets {
                if let Some((sequence, timestamp)) = last {
                    prop_assert_eq!(packet.sequence, sequence.wrapping_add(1));
                    prop_assert!(packet.timestamp >= timestamp);
                }
                last = Some((packet.sequence, packet.timestamp));
            }
        }
        let (sequence, _) = last.unwrap();
        prop_assert_eq!(packetizer.next_sequence(), sequence.wrapping_add(1));
    }
}

#[derive(Debug, Clone)]
enum Op {
    Start,
    ServiceStart,
    StaleServiceStart,
    Stop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Start),
        Just(Op::ServiceStart),
        Just(Op::StaleServiceStart),
        Just(Op::Stop),
    ]
}

proptest! {
    #[test]
    fn state_machine_never_runs_two_sessions(ops in prop::collection::vec(op(), 1..64)) {
        let mut machine = SessionStateMachine::<u32>::new();
        let mut issued: Vec<StartToken> = Vec::new();
        let mut next_handle = 0u32;
        let mut live: Option<u32> = None;

        for op in ops {
            let before = machine.state();
            match op {
                Op::Start => {
                    let token = machine.begin_start();
                    prop_assert_eq!(token.is_some(), before == ModuleState::Initiated);
                    if let Some(token) = token {
                        issued.push(token);
                    }
                }
                Op::ServiceStart => {
                    let Some(&token) = issued.last() else { continue };
                    next_handle += 1;
                    match machine.set_running(token, next_handle) {
                        Ok(()) => {
                            prop_assert_eq!(before, ModuleState::PendingStart(token));
                            prop_assert!(live.is_none());
                            live = Some(next_handle);
                        }
                        Err(handle) => {
                            prop_assert_eq!(handle, next_handle);
                            prop_assert_eq!(machine.state(), before);
                        }
                    }
                }
                Op::StaleServiceStart => {
                    let stale =
                        issued.iter().rev().skip(1).copied().find(|t| Some(t) != issued.last());
                    if let Some(stale) = stale {
                        prop_assert!(machine.set_running(stale, u32::MAX).is_err());
                        prop_assert_eq!(machine.state(), before);
                    }
                }
                Op::Stop => match machine.begin_stop() {
                    StopAction::Teardown(handle) => {
                        prop_assert_eq!(Some(handle), live.take());
                        machine.finish_stop();
                    }
                    StopAction::Discarded(token) => {
                        prop_assert_eq!(before, ModuleState::PendingStart(token))
                    }
                    StopAction::Ignored => prop_assert_eq!(before, ModuleState::Initiated),
                },
            }
            prop_assert_eq!(machine.is_running(), live.is_some());
        }
    }
}
