use std::path::Path;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{CastError, Result};
use crate::media::nal::split_annex_b;
use crate::media::{MediaFrame, VideoParams};

const NAL_IDR: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;

#[derive(Debug, Clone)]
struct AccessUnit {
    data: Bytes,
    key_frame: bool,
}

/// Replays an H.264 Annex B elementary stream as timed access units.
///
/// The file is split into access units once at load time; SPS and PPS are
/// taken from the first occurrence. Playback loops until cancelled.
#[derive(Debug, Clone)]
pub struct AnnexBFileSource {
    units: Vec<AccessUnit>,
    params: VideoParams,
    fps: u32,
}

impl AnnexBFileSource {
    pub fn open(path: impl AsRef<Path>, fps: u32) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let source = Self::from_bytes(&data, fps)?;
        tracing::info!(
            path = %path.display(),
            access_units = source.units.len(),
            fps,
            "loaded H.264 file"
        );
        Ok(source)
    }

    pub fn from_bytes(data: &[u8], fps: u32) -> Result<Self> {
        let mut units = Vec::new();
        let mut current = BytesMut::new();
        let mut has_vcl = false;
        let mut key_frame = false;
        let mut sps = None;
        let mut pps = None;

        let mut flush = |current: &mut BytesMut, has_vcl: &mut bool, key_frame: &mut bool| {
            if *has_vcl {
                units.push(AccessUnit {
                    data: current.split().freeze(),
                    key_frame: *key_frame,
                });
            }
            *has_vcl = false;
            *key_frame = false;
        };

        for nal in split_annex_b(data) {
            let nal_type = nal[0] & 0x1f;
            match nal_type {
                NAL_AUD | NAL_SEI | NAL_SPS | NAL_PPS => {
                    if has_vcl {
                        flush(&mut current, &mut has_vcl, &mut key_frame);
                    }
                    if nal_type == NAL_SPS && sps.is_none() {
                        sps = Some(Bytes::copy_from_slice(nal));
                    }
                    if nal_type == NAL_PPS && pps.is_none() {
                        pps = Some(Bytes::copy_from_slice(nal));
                    }
                }
                1..=NAL_IDR => {
                    // first_mb_in_slice == 0 is ue(v) "1": a new picture starts.
                    let first_slice = nal.get(1).is_some_and(|b| b & 0x80 != 0);
                    if has_vcl && first_slice {
                        flush(&mut current, &mut has_vcl, &mut key_frame);
                    }
                    has_vcl = true;
                    key_frame |= nal_type == NAL_IDR;
                }
                _ => {}
            }
            current.put_slice(&[0, 0, 0, 1]);
            current.put_slice(nal);
        }
        flush(&mut current, &mut has_vcl, &mut key_frame);

        let (Some(sps), Some(pps)) = (sps, pps) else {
            return Err(CastError::InvalidParameter("H.264 stream has no SPS/PPS".into()));
        };
        if units.is_empty() {
            return Err(CastError::InvalidParameter("H.264 stream has no pictures".into()));
        }

        Ok(Self {
            units,
            params: VideoParams::h264(sps, pps),
            fps: fps.max(1),
        })
    }

    pub fn video_params(&self) -> &VideoParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Emit access units at the configured rate until `cancel` fires or
    /// `deliver` returns `false`.
    pub async fn run<F>(self, mut deliver: F, cancel: CancellationToken)
    where
        F: FnMut(MediaFrame) -> bool + Send,
    {
        let frame_us = 1_000_000 / i64::from(self.fps);
        let mut ticker = tokio::time::interval(Duration::from_micros(frame_us as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for (index, unit) in (0i64..).zip(self.units.iter().cycle()) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let frame = MediaFrame::video(unit.data.clone(), index * frame_us, unit.key_frame);
            if !deliver(frame) {
                tracing::debug!(index, "frame consumer gone");
                break;
            }
        }
    }
}
