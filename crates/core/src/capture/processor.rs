use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{RgbImage, RgbaImage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::capture::{FramePool, RawFrame, Rotation};
use crate::error::{CastError, Result};

pub const RESIZE_RANGE: RangeInclusive<u32> = 1..=150;
pub const QUALITY_RANGE: RangeInclusive<u8> = 1..=100;
pub const MAX_FPS_RANGE: RangeInclusive<u32> = 1..=60;

/// Resize factor meaning "keep source size".
pub const RESIZE_DISABLED: u32 = 100;

/// Pixels cut from each edge before rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CropInsets {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropInsets {
    /// `(x, y, width, height)` of the kept area, or `None` when nothing
    /// is cut or the insets leave no pixels.
    pub fn region(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if *self == Self::default() {
            return None;
        }
        let keep_w = width.checked_sub(self.left.saturating_add(self.right)).filter(|w| *w > 0)?;
        let keep_h = height.checked_sub(self.top.saturating_add(self.bottom)).filter(|h| *h > 0)?;
        Some((self.left, self.top, keep_w, keep_h))
    }
}

/// Processing parameters that can change while capture runs.
///
/// Setters validate their range and return
/// [`CastError::InvalidParameter`] instead of clamping.
#[derive(Debug)]
pub struct CaptureControls {
    resize_factor: AtomicU32,
    quality: AtomicU8,
    max_fps: AtomicU32,
    grayscale: AtomicBool,
    rotation: Mutex<Rotation>,
    crop: Mutex<CropInsets>,
}

impl Default for CaptureControls {
    fn default() -> Self {
        Self {
            resize_factor: AtomicU32::new(50),
            quality: AtomicU8::new(80),
            max_fps: AtomicU32::new(30),
            grayscale: AtomicBool::new(false),
            rotation: Mutex::new(Rotation::Deg0),
            crop: Mutex::new(CropInsets::default()),
        }
    }
}

impl CaptureControls {
    pub fn set_resize_factor(&self, percent: u32) -> Result<()> {
        check_range("resize factor", percent, &RESIZE_RANGE)?;
        let old = self.resize_factor.swap(percent, Ordering::Relaxed);
        if old != percent {
            tracing::debug!(old, new = percent, "resize factor changed");
        }
        Ok(())
    }

    pub fn set_quality(&self, quality: u8) -> Result<()> {
        check_range("JPEG quality", quality, &QUALITY_RANGE)?;
        self.quality.store(quality, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_max_fps(&self, fps: u32) -> Result<()> {
        check_range("max fps", fps, &MAX_FPS_RANGE)?;
        self.max_fps.store(fps, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_grayscale(&self, enabled: bool) {
        self.grayscale.store(enabled, Ordering::Relaxed);
    }

    pub fn set_rotation(&self, rotation: Rotation) {
        *self.rotation.lock() = rotation;
    }

    pub fn set_crop(&self, crop: CropInsets) {
        *self.crop.lock() = crop;
    }

    pub fn resize_factor(&self) -> u32 {
        self.resize_factor.load(Ordering::Relaxed)
    }

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    pub fn max_fps(&self) -> u32 {
        self.max_fps.load(Ordering::Relaxed)
    }

    pub fn grayscale(&self) -> bool {
        self.grayscale.load(Ordering::Relaxed)
    }

    pub fn rotation(&self) -> Rotation {
        *self.rotation.lock()
    }

    pub fn crop(&self) -> CropInsets {
        *self.crop.lock()
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    range: &RangeInclusive<T>,
) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(CastError::InvalidParameter(format!(
            "{name} {value} outside {}..={}",
            range.start(),
            range.end()
        )))
    }
}

/// Scale derived from the resize factor; recomputed only when the factor
/// changes.
#[derive(Debug, Clone, Copy)]
struct ResizeTransform {
    factor: u32,
    scale: f64,
}

impl ResizeTransform {
    fn new(factor: u32) -> Self {
        Self {
            factor,
            scale: f64::from(factor) / 100.0,
        }
    }

    fn update(&mut self, factor: u32) {
        if factor != self.factor {
            *self = Self::new(factor);
        }
    }

    fn apply(&self, width: u32, height: u32) -> (u32, u32) {
        if self.factor == RESIZE_DISABLED {
            return (width, height);
        }
        let scaled = |v: u32| ((f64::from(v) * self.scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

/// Turns raw RGBA frames into JPEG images.
///
/// Steps, in order: max-fps throttle, crop, rotate, resize, grayscale,
/// JPEG. The source buffer goes back to the pool once encoded.
pub struct FrameProcessor {
    controls: Arc<CaptureControls>,
    pool: Arc<FramePool>,
    transform: ResizeTransform,
    last_emit: Option<Instant>,
    last_jpeg_len: usize,
}

impl FrameProcessor {
    pub fn new(controls: Arc<CaptureControls>, pool: Arc<FramePool>) -> Self {
        let transform = ResizeTransform::new(controls.resize_factor());
        Self {
            controls,
            pool,
            transform,
            last_emit: None,
            last_jpeg_len: 0,
        }
    }

    /// `Ok(None)` when the frame was throttled.
    pub fn process(&mut self, frame: RawFrame) -> Result<Option<Bytes>> {
        let RawFrame {
            width,
            height,
            data,
            timestamp,
        } = frame;

        let interval = Duration::from_secs(1) / self.controls.max_fps().max(1);
        if self
            .last_emit
            .is_some_and(|last| timestamp.saturating_duration_since(last) < interval)
        {
            self.pool.checkin(width, height, data);
            return Ok(None);
        }

        let len = data.len();
        let source = RgbaImage::from_raw(width, height, data).ok_or_else(|| {
            CastError::UnsupportedImageFormat(format!(
                "{width}x{height} RGBA frame with {len} bytes"
            ))
        })?;

        let jpeg = self.render(&source)?;
        self.pool.checkin(width, height, source.into_raw());
        self.last_emit = Some(timestamp);
        Ok(Some(jpeg))
    }

    fn render(&mut self, source: &RgbaImage) -> Result<Bytes> {
        let cropped = self
            .controls
            .crop()
            .region(source.width(), source.height())
            .map(|(x, y, w, h)| imageops::crop_imm(source, x, y, w, h).to_image());
        let image = cropped.as_ref().unwrap_or(source);

        let rotated = match self.controls.rotation() {
            Rotation::Deg0 => None,
            Rotation::Deg90 => Some(imageops::rotate90(image)),
            Rotation::Deg180 => Some(imageops::rotate180(image)),
            Rotation::Deg270 => Some(imageops::rotate270(image)),
        };
        let image = rotated.as_ref().unwrap_or(image);

        self.transform.update(self.controls.resize_factor());
        let (width, height) = self.transform.apply(image.width(), image.height());
        let resized = ((width, height) != image.dimensions())
            .then(|| imageops::resize(image, width, height, FilterType::Triangle));
        let image = resized.as_ref().unwrap_or(image);

        let mut out = Vec::with_capacity(self.last_jpeg_len.max(4096));
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.controls.quality());
        if self.controls.grayscale() {
            encoder.encode_image(&imageops::grayscale(image))?;
        } else {
            let rgb: RgbImage = image.convert();
            encoder.encode_image(&rgb)?;
        }
        self.last_jpeg_len = out.len();
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, at: Instant) -> RawFrame {
        RawFrame {
            width,
            height,
            data: vec![200; (width * height * 4) as usize],
            timestamp: at,
        }
    }

    fn decode(jpeg: &[u8]) -> image::DynamicImage {
        image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg).unwrap()
    }

    fn processor() -> (FrameProcessor, Arc<CaptureControls>, Arc<FramePool>) {
        let controls = Arc::new(CaptureControls::default());
        controls.set_resize_factor(100).unwrap();
        let pool = Arc::new(FramePool::new());
        (FrameProcessor::new(controls.clone(), pool.clone()), controls, pool)
    }

    #[test]
    fn setters_validate_ranges() {
        let controls = CaptureControls::default();
        assert!(controls.set_resize_factor(0).is_err());
        assert!(controls.set_resize_factor(151).is_err());
        assert!(controls.set_resize_factor(150).is_ok());
        assert!(controls.set_quality(0).is_err());
        assert!(controls.set_quality(100).is_ok());
        assert!(controls.set_max_fps(61).is_err());
    }

    #[test]
    fn crop_region() {
        let crop = CropInsets {
            left: 2,
            top: 1,
            right: 2,
            bottom: 1,
        };
        assert_eq!(crop.region(10, 10), Some((2, 1, 6, 8)));
        assert_eq!(crop.region(4, 10), None);
        assert_eq!(CropInsets::default().region(10, 10), None);
    }

    #[test]
    fn encodes_and_returns_buffer() {
        let (mut p, _, pool) = processor();
        let jpeg = p.process(frame(16, 8, Instant::now())).unwrap().unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        let img = decode(&jpeg);
        assert_eq!((img.width(), img.height()), (16, 8));
        assert_eq!(pool.idle(16, 8), 1);
    }

    #[test]
    fn rotate_then_resize_then_grayscale() {
        let (mut p, controls, _) = processor();
        controls.set_rotation(Rotation::Deg90);
        controls.set_resize_factor(50).unwrap();
        controls.set_grayscale(true);
        let jpeg = p.process(frame(32, 16, Instant::now())).unwrap().unwrap();
        let img = decode(&jpeg);
        assert_eq!((img.width(), img.height()), (8, 16));
        assert_eq!(img.color(), image::ColorType::L8);
    }

    #[test]
    fn throttles_to_max_fps() {
        let (mut p, controls, pool) = processor();
        controls.set_max_fps(10).unwrap();
        let t0 = Instant::now();
        assert!(p.process(frame(4, 4, t0)).unwrap().is_some());
        assert!(p.process(frame(4, 4, t0 + Duration::from_millis(50))).unwrap().is_none());
        assert!(p.process(frame(4, 4, t0 + Duration::from_millis(100))).unwrap().is_some());
        assert!(pool.idle(4, 4) >= 1);
    }

    #[test]
    fn short_buffer_is_unsupported_format() {
        let (mut p, _, _) = processor();
        let bad = RawFrame {
            width: 4,
            height: 4,
            data: vec![0; 10],
            timestamp: Instant::now(),
        };
        assert!(matches!(p.process(bad), Err(CastError::UnsupportedImageFormat(_))));
    }

    #[test]
    fn transform_cached_until_factor_changes() {
        let mut t = ResizeTransform::new(50);
        assert_eq!(t.apply(100, 60), (50, 30));
        t.update(50);
        assert_eq!(t.factor, 50);
        t.update(150);
        assert_eq!(t.apply(100, 60), (150, 90));
        assert_eq!(ResizeTransform::new(1).apply(10, 10), (1, 1));
    }
}
