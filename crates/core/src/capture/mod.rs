//! Screen capture: frame acquisition and JPEG processing.
//!
//! ```text
//! FrameSource ──SourceEvent──▶ processing task ──JPEG──▶ watch channel
//!  (own thread)   (bounded)     (FrameProcessor)          (MJPEG server)
//!       ▲
//!       └── rotation poller (250 ms) restarts the source on change
//! ```
//!
//! The OS capture facility is abstracted as [`FrameSource`]. Sources fill
//! RGBA buffers checked out of a shared [`FramePool`] and hand them over
//! through a [`FrameSink`], which never blocks: when the processor lags,
//! the newest frame is dropped and its buffer returned to the pool.
//!
//! [`AnnexBFileSource`] is the encoded counterpart for RTSP modes: it
//! replays H.264 access units from a file instead of raw pixels.

pub mod annexb;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod synthetic;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CastError, Result};

pub use annexb::AnnexBFileSource;
pub use pipeline::ScreenCapture;
pub use pool::FramePool;
pub use processor::{CaptureControls, CropInsets, FrameProcessor};
pub use synthetic::{OrientationHandle, SyntheticSource};

/// Frames waiting between the source thread and the processor.
pub const SOURCE_QUEUE_CAPACITY: usize = 2;

/// Lifecycle of a capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Init,
    Started,
    Stopped,
    Error,
    Destroyed,
}

/// Clockwise rotation in 90° steps, used both for display orientation and
/// for the output rotation setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether width and height trade places.
    pub fn is_transposed(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }

    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg90,
            Self::Deg90 => Self::Deg180,
            Self::Deg180 => Self::Deg270,
            Self::Deg270 => Self::Deg0,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = CastError;

    fn try_from(degrees: u16) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(CastError::InvalidParameter(format!(
                "rotation must be 0, 90, 180 or 270, got {other}"
            ))),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> u16 {
        rotation.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// One captured RGBA frame. Owned by exactly one pipeline stage at a time.
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA, `width * height * 4` bytes.
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What the processing task receives from a source.
#[derive(Debug)]
pub enum SourceEvent {
    Frame(RawFrame),
    /// A frame could not be read. Fatal errors end the pipeline; anything
    /// else is logged and the next frame awaited.
    Failed(CastError),
}

/// Delivery handle given to a [`FrameSource`] on start.
///
/// Frames travel on a bounded queue and are dropped when it is full.
/// Failures travel on their own unbounded queue so they are never lost
/// behind frames.
#[derive(Debug, Clone)]
pub struct FrameSink {
    frames: mpsc::Sender<RawFrame>,
    failures: mpsc::UnboundedSender<CastError>,
    pool: Arc<FramePool>,
}

impl FrameSink {
    /// A sink holding up to `capacity` undelivered frames, and the
    /// receiving end read by the processing task.
    pub fn channel(capacity: usize, pool: Arc<FramePool>) -> (Self, SinkReceiver) {
        let (frames, frames_rx) = mpsc::channel(capacity);
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let sink = Self {
            frames,
            failures,
            pool,
        };
        let receiver = SinkReceiver {
            frames: frames_rx,
            failures: failures_rx,
        };
        (sink, receiver)
    }

    /// A buffer for a `width` x `height` frame, reused when possible.
    pub fn buffer(&self, width: u32, height: u32) -> Vec<u8> {
        self.pool.checkout(width, height)
    }

    /// Hand a frame over without blocking. Returns `false` when the frame
    /// was dropped because the processor is behind or gone.
    pub fn deliver(&self, frame: RawFrame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(
                mpsc::error::TrySendError::Full(frame) | mpsc::error::TrySendError::Closed(frame),
            ) => {
                self.pool.checkin(frame.width, frame.height, frame.data);
                false
            }
        }
    }

    /// Report a failed frame read. Returns `false` once the processor is gone.
    pub fn fail(&self, error: CastError) -> bool {
        match self.failures.send(error) {
            Ok(()) => true,
            Err(mpsc::error::SendError(error)) => {
                tracing::warn!(error = %error, "capture failure after processor exit");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Receiving end of a [`FrameSink`]. Pending failures are always read
/// before pending frames.
#[derive(Debug)]
pub struct SinkReceiver {
    frames: mpsc::Receiver<RawFrame>,
    failures: mpsc::UnboundedReceiver<CastError>,
}

impl SinkReceiver {
    /// The next event, or `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<SourceEvent> {
        tokio::select! {
            biased;
            Some(error) = self.failures.recv() => Some(SourceEvent::Failed(error)),
            Some(frame) = self.frames.recv() => Some(SourceEvent::Frame(frame)),
            else => None,
        }
    }
}

/// Platform capture facility.
///
/// `start` must return promptly and deliver frames from the source's own
/// thread or task. The surface size is fixed between `start` and `stop`;
/// a new orientation needs a full stop/start cycle.
pub trait FrameSource: Send + 'static {
    /// Frame size the next `start` will produce.
    fn size(&self) -> (u32, u32);

    /// Current display orientation, sampled by the rotation poller.
    fn orientation(&self) -> Rotation;

    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Release the capture surface. Called only after a successful `start`.
    fn stop(&mut self);
}
