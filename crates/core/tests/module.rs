//! Module lifecycle driving a real MJPEG session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use screencast::CastError;
use screencast::capture::{
    CaptureControls, FrameSink, FrameSource, RawFrame, Rotation, SOURCE_QUEUE_CAPACITY,
    SyntheticSource,
};
use screencast::mjpeg::MjpegServerConfig;
use screencast::module::{
    CaptureGrant, LoopbackHost, MjpegSessionFactory, ModuleController, ModuleEvent, ModuleHandle,
    ModuleState,
};
use screencast::report::{ErrorClass, ErrorReporter, UserAction};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Either refuses to start, or floods the frame queue and then fails.
struct BrokenSource {
    refuse: bool,
}

impl FrameSource for BrokenSource {
    fn size(&self) -> (u32, u32) {
        (8, 8)
    }

    fn orientation(&self) -> Rotation {
        Rotation::Deg0
    }

    fn start(&mut self, sink: FrameSink) -> screencast::Result<()> {
        if self.refuse {
            return Err(CastError::CaptureSecurity("projection token expired".into()));
        }
        for _ in 0..=SOURCE_QUEUE_CAPACITY {
            sink.deliver(RawFrame {
                width: 8,
                height: 8,
                data: sink.buffer(8, 8),
                timestamp: Instant::now(),
            });
        }
        sink.fail(CastError::UnsupportedImageFormat("RGB_565".into()));
        Ok(())
    }

    fn stop(&mut self) {}
}

fn broken(refuse: bool) -> ModuleEvent {
    ModuleEvent::StartProjection(CaptureGrant::Screen(Box::new(BrokenSource { refuse })))
}

/// A port that was free a moment ago.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn factory(port: u16) -> MjpegSessionFactory {
    let config = MjpegServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        idle_resend: Duration::from_millis(100),
        ..Default::default()
    };
    MjpegSessionFactory::new(config, Arc::new(CaptureControls::default()))
}

async fn wait_for(module: &ModuleHandle, state: ModuleState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while module.state().await.unwrap() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("module never reached {state:?}"));
}

async fn first_jpeg(port: u16) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /stream.mjpeg HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed");
            received.extend_from_slice(&buf[..n]);
            if let Some(start) = received.windows(2).position(|w| w == [0xff, 0xd8]) {
                return received[start..].to_vec();
            }
        }
    })
    .await
    .expect("no JPEG received")
}

#[tokio::test]
async fn start_stream_stop_and_restart() {
    let port = free_port();
    let reporter = Arc::new(ErrorReporter::new());
    let (module, controller) =
        ModuleController::spawn(LoopbackHost, factory(port), reporter.clone());

    for _ in 0..2 {
        module.start_module().await.unwrap();
        wait_for(&module, ModuleState::Running).await;

        let grant = CaptureGrant::Screen(Box::new(SyntheticSource::new(64, 48, 15)));
        module.send_event(ModuleEvent::StartProjection(grant)).await.unwrap();
        let jpeg = first_jpeg(port).await;
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);

        module.stop_module().await.unwrap();
        assert_eq!(module.state().await.unwrap(), ModuleState::Initiated);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
    assert!(reporter.current().is_none());

    module.shutdown().await.unwrap();
    controller.await.unwrap();
    assert!(module.state().await.is_err());
}

#[tokio::test]
async fn busy_port_is_reported_as_fixable() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let reporter = Arc::new(ErrorReporter::new());
    let mut reported = reporter.subscribe();
    let (module, _controller) =
        ModuleController::spawn(LoopbackHost, factory(port), reporter.clone());
    module.start_module().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), reported.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();
    let error = reporter.current().unwrap();
    assert_eq!(error.class, ErrorClass::Fixable);
    assert_eq!(error.action, UserAction::Retry);

    // once the port is free, recovering brings the server up and clears the error
    drop(blocker);
    wait_for(&module, ModuleState::Running).await;
    module.send_event(ModuleEvent::RecoverError).await.unwrap();
    assert!(reporter.current().is_none());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

    module.shutdown().await.unwrap();
}

#[tokio::test]
async fn events_before_start_are_dropped() {
    let reporter = Arc::new(ErrorReporter::new());
    let (module, _controller) =
        ModuleController::spawn(LoopbackHost, factory(free_port()), reporter);
    module.send_event(ModuleEvent::RecoverError).await.unwrap();
    module.stop_module().await.unwrap();
    assert_eq!(module.state().await.unwrap(), ModuleState::Initiated);
    module.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_grant_leaves_module_stoppable() {
    let reporter = Arc::new(ErrorReporter::new());
    let (module, controller) =
        ModuleController::spawn(LoopbackHost, factory(free_port()), reporter.clone());
    module.start_module().await.unwrap();
    wait_for(&module, ModuleState::Running).await;

    let refused = module.send_event(broken(true)).await;
    assert!(matches!(refused, Err(CastError::CaptureSecurity(_))), "{refused:?}");
    assert_eq!(reporter.current().unwrap().class, ErrorClass::Fixable);

    tokio::time::timeout(Duration::from_secs(3), module.stop_module())
        .await
        .expect("controller stuck after a refused grant")
        .unwrap();
    assert_eq!(module.state().await.unwrap(), ModuleState::Initiated);

    module.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), controller)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn fatal_failure_behind_full_frame_queue_stops_module() {
    let reporter = Arc::new(ErrorReporter::new());
    let mut reported = reporter.subscribe();
    let (module, _controller) =
        ModuleController::spawn(LoopbackHost, factory(free_port()), reporter.clone());
    module.start_module().await.unwrap();
    wait_for(&module, ModuleState::Running).await;

    module.send_event(broken(false)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), reported.wait_for(Option::is_some))
        .await
        .expect("fatal capture failure was never reported")
        .unwrap();
    let error = reporter.current().unwrap();
    assert_eq!(error.class, ErrorClass::Fatal);
    assert_eq!(error.action, UserAction::Exit);
    wait_for(&module, ModuleState::Initiated).await;

    module.shutdown().await.unwrap();
}
