use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capture::{
    CaptureControls, CaptureState, FramePool, FrameProcessor, FrameSink, FrameSource,
    SOURCE_QUEUE_CAPACITY, SinkReceiver, SourceEvent,
};
use crate::error::{CastError, Result};
use crate::report::ErrorClass;

/// How often the display orientation is sampled.
pub const ROTATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Owns a [`FrameSource`] and turns its frames into a stream of JPEGs.
///
/// The latest JPEG is published on the `watch` channel given to
/// [`new`](Self::new). Failures that end the pipeline are sent to the
/// error channel and leave the capture in [`CaptureState::Error`].
///
/// State contract:
///
/// | call | legal from | result |
/// |------|-----------|--------|
/// | `start` | Init | Started (Error if the source refuses) |
/// | `stop` | Started, Error | Stopped |
/// | `destroy` | any | Destroyed |
///
/// Anything else returns [`CastError::InvalidState`].
pub struct ScreenCapture {
    state: Arc<Mutex<CaptureState>>,
    source: SharedSource,
    controls: Arc<CaptureControls>,
    pool: Arc<FramePool>,
    frames: watch::Sender<Option<Bytes>>,
    errors: mpsc::UnboundedSender<CastError>,
    restarting: Arc<AtomicBool>,
    sink: Option<FrameSink>,
    running: Option<Running>,
}

impl ScreenCapture {
    pub fn new(
        source: Box<dyn FrameSource>,
        controls: Arc<CaptureControls>,
        frames: watch::Sender<Option<Bytes>>,
        errors: mpsc::UnboundedSender<CastError>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState::Init)),
            source: Arc::new(Mutex::new(source)),
            controls,
            pool: Arc::new(FramePool::new()),
            frames,
            errors,
            restarting: Arc::new(AtomicBool::new(false)),
            sink: None,
            running: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    pub fn controls(&self) -> &Arc<CaptureControls> {
        &self.controls
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Start the source and the processing tasks. Must be called inside a
    /// tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != CaptureState::Init {
            return Err(CastError::invalid_state("ScreenCapture", "start", state));
        }

        let (sink, rx) = FrameSink::channel(SOURCE_QUEUE_CAPACITY, self.pool.clone());
        let started = {
            let mut source = self.source.lock();
            let (width, height) = source.size();
            tracing::info!(width, height, orientation = %source.orientation(), "starting capture");
            source.start(sink.clone())
        };
        if let Err(e) = started {
            // no tasks were spawned, so `stop` has nothing to join
            tracing::warn!(error = %e, "capture source refused to start");
            *self.state.lock() = CaptureState::Error;
            return Err(e);
        }
        *self.state.lock() = CaptureState::Started;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let processor = FrameProcessor::new(self.controls.clone(), self.pool.clone());
        tracker.spawn(process_frames(
            rx,
            processor,
            self.frames.clone(),
            self.state.clone(),
            self.errors.clone(),
            cancel.clone(),
        ));
        tracker.spawn(poll_rotation(
            self.source.clone(),
            sink.clone(),
            self.pool.clone(),
            self.restarting.clone(),
            self.state.clone(),
            self.errors.clone(),
            cancel.clone(),
        ));
        tracker.close();

        self.sink = Some(sink);
        self.running = Some(Running { cancel, tracker });
        Ok(())
    }

    /// Tear the source down and recreate it at its current size. Ignored
    /// unless started, and while another restart is in progress.
    pub async fn restart(&self) -> Result<bool> {
        if self.state() != CaptureState::Started {
            tracing::debug!(state = ?self.state(), "restart ignored");
            return Ok(false);
        }
        let Some(sink) = &self.sink else {
            return Ok(false);
        };
        restart_source(&self.source, sink, &self.pool, &self.restarting).await
    }

    /// Stop capture and wait until every capture task has exited.
    pub async fn stop(&mut self) -> Result<()> {
        let state = self.state();
        if !matches!(state, CaptureState::Started | CaptureState::Error) {
            return Err(CastError::invalid_state("ScreenCapture", "stop", state));
        }

        // `running` is only set once the source has started
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.tracker.wait().await;
            let source = self.source.clone();
            tokio::task::spawn_blocking(move || source.lock().stop())
                .await
                .map_err(|e| CastError::TaskFailed {
                    task: "capture-stop".into(),
                    reason: e.to_string(),
                })?;
        }
        self.sink = None;
        *self.state.lock() = CaptureState::Stopped;
        tracing::info!("capture stopped");
        Ok(())
    }

    /// Final teardown. Stops first when still running.
    pub async fn destroy(&mut self) -> Result<()> {
        match self.state() {
            CaptureState::Destroyed => {
                tracing::warn!("capture already destroyed");
                return Ok(());
            }
            CaptureState::Started | CaptureState::Error => self.stop().await?,
            CaptureState::Init | CaptureState::Stopped => {}
        }
        *self.state.lock() = CaptureState::Destroyed;
        Ok(())
    }
}

fn fail(state: &Mutex<CaptureState>, errors: &mpsc::UnboundedSender<CastError>, error: CastError) {
    tracing::error!(error = %error, "capture failed");
    *state.lock() = CaptureState::Error;
    if let Err(mpsc::error::SendError(error)) = errors.send(error) {
        tracing::warn!(error = %error, "no one left to report capture failure to");
    }
}

async fn process_frames(
    mut rx: SinkReceiver,
    mut processor: FrameProcessor,
    frames: watch::Sender<Option<Bytes>>,
    state: Arc<Mutex<CaptureState>>,
    errors: mpsc::UnboundedSender<CastError>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let error = match event {
            SourceEvent::Frame(frame) => {
                let joined = tokio::task::spawn_blocking(move || {
                    let result = processor.process(frame);
                    (processor, result)
                })
                .await;
                let result = match joined {
                    Ok((returned, result)) => {
                        processor = returned;
                        result
                    }
                    Err(e) => {
                        fail(
                            &state,
                            &errors,
                            CastError::TaskFailed {
                                task: "frame-processor".into(),
                                reason: e.to_string(),
                            },
                        );
                        break;
                    }
                };
                match result {
                    Ok(Some(jpeg)) => {
                        frames.send_replace(Some(jpeg));
                        continue;
                    }
                    Ok(None) => continue,
                    Err(e) => e,
                }
            }
            SourceEvent::Failed(e) => e,
        };

        if error.class() == ErrorClass::Fatal {
            fail(&state, &errors, error);
            break;
        }
        tracing::debug!(error = %error, "frame skipped");
    }
    tracing::debug!("frame processing stopped");
}

async fn poll_rotation(
    source: SharedSource,
    sink: FrameSink,
    pool: Arc<FramePool>,
    restarting: Arc<AtomicBool>,
    state: Arc<Mutex<CaptureState>>,
    errors: mpsc::UnboundedSender<CastError>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ROTATION_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = source.lock().orientation();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = source.lock().orientation();
        if current == last || *state.lock() != CaptureState::Started {
            continue;
        }
        tracing::info!(from = %last, to = %current, "orientation changed, restarting capture");
        last = current;

        if let Err(e) = restart_source(&source, &sink, &pool, &restarting).await {
            fail(&state, &errors, e);
            break;
        }
    }
}

async fn restart_source(
    source: &SharedSource,
    sink: &FrameSink,
    pool: &Arc<FramePool>,
    restarting: &Arc<AtomicBool>,
) -> Result<bool> {
    if restarting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::debug!("restart already in progress");
        return Ok(false);
    }

    let (source, sink, pool) = (source.clone(), sink.clone(), pool.clone());
    let joined = tokio::task::spawn_blocking(move || {
        let mut source = source.lock();
        source.stop();
        let (width, height) = source.size();
        pool.retain_size(width, height);
        tracing::debug!(width, height, "capture surface recreated");
        source.start(sink)
    })
    .await;
    restarting.store(false, Ordering::SeqCst);

    joined
        .map_err(|e| CastError::TaskFailed {
            task: "capture-restart".into(),
            reason: e.to_string(),
        })?
        .map(|()| true)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, AtomicUsize};
    use std::time::Instant;

    use super::*;
    use crate::capture::{RawFrame, Rotation};

    /// Delivers one frame per start from the calling thread.
    struct StubSource {
        orientation: Arc<AtomicU8>,
        starts: Arc<AtomicUsize>,
        refuse: bool,
        fail_with: Option<fn() -> CastError>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                orientation: Arc::new(AtomicU8::new(0)),
                starts: Arc::new(AtomicUsize::new(0)),
                refuse: false,
                fail_with: None,
            }
        }
    }

    impl FrameSource for StubSource {
        fn size(&self) -> (u32, u32) {
            if self.orientation().is_transposed() { (4, 8) } else { (8, 4) }
        }

        fn orientation(&self) -> Rotation {
            if self.orientation.load(Ordering::SeqCst) == 0 {
                Rotation::Deg0
            } else {
                Rotation::Deg90
            }
        }

        fn start(&mut self, sink: FrameSink) -> Result<()> {
            if self.refuse {
                return Err(CastError::CaptureSecurity("grant revoked".into()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (width, height) = self.size();
            let frame = || RawFrame {
                width,
                height,
                data: sink.buffer(width, height),
                timestamp: Instant::now(),
            };
            if let Some(error) = self.fail_with {
                // overfill the frame queue before failing
                for _ in 0..=SOURCE_QUEUE_CAPACITY {
                    sink.deliver(frame());
                }
                sink.fail(error());
                return Ok(());
            }
            sink.deliver(frame());
            Ok(())
        }

        fn stop(&mut self) {}
    }

    type Harness = (
        ScreenCapture,
        watch::Receiver<Option<Bytes>>,
        mpsc::UnboundedReceiver<CastError>,
    );

    fn capture(source: StubSource) -> Harness {
        let (frames, frames_rx) = watch::channel(None);
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let controls = Arc::new(CaptureControls::default());
        controls.set_resize_factor(100).unwrap();
        (ScreenCapture::new(Box::new(source), controls, frames, errors), frames_rx, errors_rx)
    }

    #[tokio::test]
    async fn start_produces_jpeg_and_stop_joins() {
        let (mut capture, mut frames, _errors) = capture(StubSource::new());
        capture.start().unwrap();
        assert_eq!(capture.state(), CaptureState::Started);
        assert!(matches!(capture.start(), Err(CastError::InvalidState { .. })));

        frames.changed().await.unwrap();
        let jpeg = frames.borrow().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);

        capture.stop().await.unwrap();
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert!(matches!(capture.stop().await, Err(CastError::InvalidState { .. })));
        capture.destroy().await.unwrap();
        capture.destroy().await.unwrap();
        assert_eq!(capture.state(), CaptureState::Destroyed);
    }

    #[tokio::test]
    async fn stop_from_init_is_contract_violation() {
        let (mut capture, _f, _e) = capture(StubSource::new());
        assert!(matches!(capture.stop().await, Err(CastError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn refused_start_enters_error_and_can_stop() {
        let mut source = StubSource::new();
        source.refuse = true;
        let (mut capture, _f, _e) = capture(source);
        assert!(matches!(capture.start(), Err(CastError::CaptureSecurity(_))));
        assert_eq!(capture.state(), CaptureState::Error);
        tokio::time::timeout(Duration::from_secs(3), capture.stop())
            .await
            .expect("stop after a refused start must not hang")
            .unwrap();
        assert_eq!(capture.state(), CaptureState::Stopped);
    }

    #[tokio::test]
    async fn refused_start_can_be_destroyed() {
        let mut source = StubSource::new();
        source.refuse = true;
        let (mut capture, _f, _e) = capture(source);
        assert!(capture.start().is_err());
        tokio::time::timeout(Duration::from_secs(3), capture.destroy())
            .await
            .expect("destroy after a refused start must not hang")
            .unwrap();
        assert_eq!(capture.state(), CaptureState::Destroyed);
    }

    #[tokio::test]
    async fn fatal_failure_behind_full_queue_is_reported() {
        let mut source = StubSource::new();
        source.fail_with = Some(|| CastError::UnsupportedImageFormat("YUV".into()));
        let (mut capture, _f, mut errors) = capture(source);
        capture.start().unwrap();
        let error = tokio::time::timeout(Duration::from_secs(3), errors.recv())
            .await
            .expect("fatal failure was dropped")
            .unwrap();
        assert!(matches!(error, CastError::UnsupportedImageFormat(_)));
        assert_eq!(capture.state(), CaptureState::Error);
        capture.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rotation_change_restarts_source_once() {
        let source = StubSource::new();
        let orientation = source.orientation.clone();
        let starts = source.starts.clone();
        let (mut capture, _f, _e) = capture(source);
        capture.start().unwrap();

        tokio::time::sleep(ROTATION_POLL_INTERVAL * 2).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        orientation.store(1, Ordering::SeqCst);
        tokio::time::sleep(ROTATION_POLL_INTERVAL * 3).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(capture.pool().idle(8, 4), 0);

        capture.stop().await.unwrap();
    }
}
