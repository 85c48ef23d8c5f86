//! TOML settings for the capture pipeline and the servers.
//!
//! Every field has a default, so an empty file is valid:
//!
//! ```
//! use screencast::config::Settings;
//!
//! let settings = Settings::from_toml_str("[mjpeg]\npin = \"1234\"\n").unwrap();
//! assert_eq!(settings.mjpeg.pin.as_deref(), Some("1234"));
//! assert_eq!(settings.capture.quality, 80);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::processor::{MAX_FPS_RANGE, QUALITY_RANGE, RESIZE_RANGE};
use crate::capture::{CaptureControls, CropInsets, Rotation};
use crate::error::{CastError, Result};
use crate::mjpeg::MjpegServerConfig;
use crate::rtsp::session::DEFAULT_SESSION_TIMEOUT_SECS;
use crate::rtsp::RtspServerConfig;
use crate::transport::Protocol;

const PIN_LENGTH: std::ops::RangeInclusive<usize> = 4..=8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureSettings,
    pub mjpeg: MjpegSettings,
    pub rtsp: RtspSettings,
}

/// Frame source and processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Width of the synthetic source.
    pub width: u32,
    pub height: u32,
    /// Percent; 100 keeps the captured size.
    pub resize_factor: u32,
    pub quality: u8,
    pub max_fps: u32,
    pub grayscale: bool,
    /// Degrees, one of 0, 90, 180 or 270.
    pub rotation: u16,
    pub crop: CropInsets,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            resize_factor: 50,
            quality: 80,
            max_fps: 30,
            grayscale: false,
            rotation: 0,
            crop: CropInsets::default(),
        }
    }
}

impl CaptureSettings {
    /// Push these settings into live controls.
    pub fn apply(&self, controls: &CaptureControls) -> Result<()> {
        controls.set_resize_factor(self.resize_factor)?;
        controls.set_quality(self.quality)?;
        controls.set_max_fps(self.max_fps)?;
        controls.set_grayscale(self.grayscale);
        controls.set_rotation(Rotation::try_from(self.rotation)?);
        controls.set_crop(self.crop);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MjpegSettings {
    pub bind_addr: String,
    pub pin: Option<String>,
    /// Milliseconds between resends of an unchanged frame.
    pub idle_resend_ms: u64,
}

impl Default for MjpegSettings {
    fn default() -> Self {
        let defaults = MjpegServerConfig::default();
        Self {
            bind_addr: defaults.bind_addr,
            pin: defaults.pin,
            idle_resend_ms: defaults.idle_resend.as_millis() as u64,
        }
    }
}

impl MjpegSettings {
    pub fn server_config(&self) -> MjpegServerConfig {
        MjpegServerConfig {
            bind_addr: self.bind_addr.clone(),
            pin: self.pin.clone(),
            idle_resend: Duration::from_millis(self.idle_resend_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspSettings {
    /// Server mode listen address.
    pub bind_addr: String,
    pub path: String,
    pub session_timeout_secs: u64,
    /// Client mode target, `rtsp://` or `rtsps://`.
    pub url: Option<String>,
    pub protocol: Protocol,
    /// Annex B H.264 elementary stream to send.
    pub file: Option<PathBuf>,
    pub fps: u32,
}

impl Default for RtspSettings {
    fn default() -> Self {
        let defaults = RtspServerConfig::default();
        Self {
            bind_addr: defaults.bind_addr,
            path: defaults.path,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            url: None,
            protocol: Protocol::default(),
            file: None,
            fps: 30,
        }
    }
}

impl RtspSettings {
    pub fn server_config(&self) -> RtspServerConfig {
        RtspServerConfig {
            bind_addr: self.bind_addr.clone(),
            path: self.path.clone(),
            session_timeout_secs: self.session_timeout_secs,
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CastError::Config(e.message().to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CastError::Config(format!("{}: {e}", path.display())))?;
        let settings = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Check ranges that deserialization alone cannot express.
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        in_range(
            "capture.resize_factor",
            capture.resize_factor,
            RESIZE_RANGE.start(),
            RESIZE_RANGE.end(),
        )?;
        in_range("capture.quality", capture.quality, QUALITY_RANGE.start(), QUALITY_RANGE.end())?;
        in_range("capture.max_fps", capture.max_fps, MAX_FPS_RANGE.start(), MAX_FPS_RANGE.end())?;
        Rotation::try_from(capture.rotation).map_err(|e| CastError::Config(e.to_string()))?;
        if capture.width == 0 || capture.height == 0 {
            return Err(CastError::Config("capture size must be non-zero".into()));
        }

        if let Some(pin) = &self.mjpeg.pin {
            if !PIN_LENGTH.contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CastError::Config("mjpeg.pin must be 4 to 8 digits".into()));
            }
        }
        check_port("mjpeg.bind_addr", &self.mjpeg.bind_addr)?;
        check_port("rtsp.bind_addr", &self.rtsp.bind_addr)?;
        if !self.rtsp.path.starts_with('/') {
            return Err(CastError::Config("rtsp.path must start with '/'".into()));
        }
        in_range("rtsp.fps", self.rtsp.fps, MAX_FPS_RANGE.start(), MAX_FPS_RANGE.end())?;
        Ok(())
    }
}

fn in_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    min: &T,
    max: &T,
) -> Result<()> {
    if value < *min || value > *max {
        return Err(CastError::Config(format!("{name} {value} outside {min}..={max}")));
    }
    Ok(())
}

fn check_port(name: &str, addr: &str) -> Result<()> {
    let port = addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .ok_or_else(|| CastError::Config(format!("{name} '{addr}' has no port")))?;
    if port == 0 {
        return Err(CastError::Config(format!("{name} port must be non-zero")));
    }
    Ok(())
}
