use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::{FrameSink, FrameSource, RawFrame, Rotation};
use crate::error::{CastError, Result};

/// Changes the orientation a [`SyntheticSource`] reports, as a device
/// rotation would.
#[derive(Debug, Clone)]
pub struct OrientationHandle(Arc<AtomicU8>);

impl OrientationHandle {
    pub fn set(&self, rotation: Rotation) {
        self.0.store(encode(rotation), Ordering::SeqCst);
    }

    pub fn get(&self) -> Rotation {
        decode(self.0.load(Ordering::SeqCst))
    }

    /// Turn by another 90°.
    pub fn rotate(&self) {
        self.set(self.get().next());
    }
}

fn encode(rotation: Rotation) -> u8 {
    (rotation.degrees() / 90) as u8
}

fn decode(value: u8) -> Rotation {
    match value % 4 {
        0 => Rotation::Deg0,
        1 => Rotation::Deg90,
        2 => Rotation::Deg180,
        _ => Rotation::Deg270,
    }
}

/// Moving test pattern rendered on a dedicated thread.
///
/// Stands in for a real screen: the size is fixed per start, and a
/// rotation reported through [`OrientationHandle`] swaps width and height
/// on the next start.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    fps: u32,
    orientation: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            fps: fps.max(1),
            orientation: Arc::new(AtomicU8::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn orientation_handle(&self) -> OrientationHandle {
        OrientationHandle(self.orientation.clone())
    }
}

impl FrameSource for SyntheticSource {
    fn size(&self) -> (u32, u32) {
        if self.orientation().is_transposed() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    fn orientation(&self) -> Rotation {
        decode(self.orientation.load(Ordering::SeqCst))
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.thread.is_some() {
            return Err(CastError::invalid_state("SyntheticSource", "start", "running"));
        }
        let (width, height) = self.size();
        let interval = Duration::from_secs(1) / self.fps;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let thread = thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || {
                tracing::debug!(width, height, "synthetic capture started");
                let mut tick = 0u32;
                while running.load(Ordering::SeqCst) && !sink.is_closed() {
                    let mut data = sink.buffer(width, height);
                    paint(&mut data, width, height, tick);
                    sink.deliver(RawFrame {
                        width,
                        height,
                        data,
                        timestamp: Instant::now(),
                    });
                    tick = tick.wrapping_add(1);
                    thread::sleep(interval);
                }
                tracing::debug!("synthetic capture stopped");
            })?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("synthetic capture thread panicked");
            }
        }
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Diagonal gradient with a white bar sweeping left to right.
fn paint(data: &mut [u8], width: u32, height: u32, tick: u32) {
    let bar = (tick.wrapping_mul(4)) % width;
    for (i, px) in data.chunks_exact_mut(4).enumerate() {
        let x = i as u32 % width;
        let y = i as u32 / width;
        if x.abs_diff(bar) < 4 {
            px.copy_from_slice(&[255, 255, 255, 255]);
        } else {
            px.copy_from_slice(&[
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                (tick % 256) as u8,
                255,
            ]);
        }
    }
}
