use std::collections::HashMap;

use parking_lot::Mutex;

/// Idle buffers kept per frame size.
const MAX_IDLE_PER_SIZE: usize = 4;

/// Reusable RGBA frame buffers keyed by `(width, height)`.
///
/// A source checks a buffer out per frame and the processor hands it back
/// once the frame is encoded. A size change (rotation, new surface) simply
/// starts a new bucket; stale buckets are dropped by [`retain_size`].
///
/// [`retain_size`]: Self::retain_size
#[derive(Debug, Default)]
pub struct FramePool {
    buckets: Mutex<HashMap<(u32, u32), Vec<Vec<u8>>>>,
}

impl FramePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer of exactly `width * height * 4` bytes. Contents are
    /// unspecified when reused.
    pub fn checkout(&self, width: u32, height: u32) -> Vec<u8> {
        let len = width as usize * height as usize * 4;
        if let Some(mut buf) = self
            .buckets
            .lock()
            .get_mut(&(width, height))
            .and_then(Vec::pop)
        {
            buf.resize(len, 0);
            return buf;
        }
        tracing::trace!(width, height, "frame buffer allocated");
        vec![0; len]
    }

    pub fn checkin(&self, width: u32, height: u32, buf: Vec<u8>) {
        if buf.len() != width as usize * height as usize * 4 {
            return;
        }
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry((width, height)).or_default();
        if bucket.len() < MAX_IDLE_PER_SIZE {
            bucket.push(buf);
        }
    }

    /// Drop every bucket except the one for the current frame size.
    pub fn retain_size(&self, width: u32, height: u32) {
        self.buckets.lock().retain(|&size, _| size == (width, height));
    }

    pub fn idle(&self, width: u32, height: u32) -> usize {
        self.buckets.lock().get(&(width, height)).map_or(0, Vec::len)
    }
}
