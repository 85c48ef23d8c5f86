use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::capture::{CaptureControls, CaptureState, ScreenCapture};
use crate::error::{CastError, Result};
use crate::mjpeg::{MjpegServer, MjpegServerConfig, ServerEvent};
use crate::module::{CaptureGrant, ModuleEvent, Session, SessionFactory, TaskScope};

/// Screen capture served to browsers as MJPEG.
///
/// The HTTP server comes up with the session and shows the last frame (or
/// nothing) until a capture grant arrives. Stopping the stream keeps the
/// server up so connected browsers resume when capture restarts.
pub struct MjpegSession {
    config: MjpegServerConfig,
    controls: Arc<CaptureControls>,
    frames: watch::Sender<Option<Bytes>>,
    server: Option<MjpegServer>,
    capture: Option<ScreenCapture>,
    waiting_for_permission: bool,
}

impl MjpegSession {
    pub fn new(config: MjpegServerConfig, controls: Arc<CaptureControls>) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            config,
            controls,
            frames,
            server: None,
            capture: None,
            waiting_for_permission: false,
        }
    }

    async fn start_server(&mut self, scope: &TaskScope) -> Result<()> {
        let mut server = MjpegServer::new(self.config.clone(), self.frames.subscribe());
        server.start().await?;
        scope.spawn("mjpeg-events", log_server_events(server.subscribe(), scope.clone()));
        self.server = Some(server);
        Ok(())
    }

    async fn stop_server(&mut self) {
        if let Some(mut server) = self.server.take() {
            if let Err(e) = server.stop().await {
                tracing::warn!(error = %e, "MJPEG server stop failed");
            }
        }
    }

    async fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.destroy().await {
                tracing::warn!(error = %e, "capture teardown failed");
            }
        }
    }
}

async fn log_server_events(
    mut events: broadcast::Receiver<ServerEvent>,
    scope: TaskScope,
) -> Result<()> {
    let cancel = scope.token();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Ok(ServerEvent::ClientCount(count)) => tracing::info!(count, "MJPEG viewers"),
            Ok(ServerEvent::AddressBlocked(ip)) => {
                tracing::warn!(%ip, "viewer blocked after wrong PINs")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "server events lagged")
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

#[async_trait]
impl Session for MjpegSession {
    async fn start(&mut self, scope: &TaskScope) -> Result<()> {
        self.waiting_for_permission = true;
        self.start_server(scope).await
    }

    async fn handle_event(&mut self, event: ModuleEvent, scope: &TaskScope) -> Result<()> {
        match event {
            ModuleEvent::StartProjection(CaptureGrant::Screen(source)) => {
                self.stop_capture().await;
                self.waiting_for_permission = false;
                let mut capture = ScreenCapture::new(
                    source,
                    self.controls.clone(),
                    self.frames.clone(),
                    scope.error_sender(),
                );
                let started = capture.start();
                self.capture = Some(capture);
                started
            }
            ModuleEvent::StartProjection(CaptureGrant::Encoded(_)) => {
                Err(CastError::InvalidParameter(
                    "MJPEG streaming needs a screen capture grant".into(),
                ))
            }
            ModuleEvent::StopStream(reason) => {
                tracing::info!(%reason, "stopping MJPEG stream");
                self.stop_capture().await;
                Ok(())
            }
            ModuleEvent::RecoverError => {
                self.stop_capture().await;
                self.stop_server().await;
                self.waiting_for_permission = true;
                self.start_server(scope).await
            }
            ModuleEvent::CastPermissionsDenied => {
                tracing::info!(waiting = self.waiting_for_permission, "capture permission denied");
                self.waiting_for_permission = false;
                Ok(())
            }
        }
    }

    fn is_streaming(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|c| c.state() == CaptureState::Started)
    }

    async fn stop(&mut self) {
        self.stop_capture().await;
        self.stop_server().await;
        self.frames.send_replace(None);
    }
}

#[derive(Debug, Clone)]
pub struct MjpegSessionFactory {
    config: MjpegServerConfig,
    controls: Arc<CaptureControls>,
}

impl MjpegSessionFactory {
    /// `controls` is shared by every session, so settings survive restarts.
    pub fn new(config: MjpegServerConfig, controls: Arc<CaptureControls>) -> Self {
        Self { config, controls }
    }
}

impl SessionFactory for MjpegSessionFactory {
    fn create(&self) -> Box<dyn Session> {
        Box::new(MjpegSession::new(self.config.clone(), self.controls.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::SyntheticSource;

    fn session() -> MjpegSession {
        let controls = Arc::new(CaptureControls::default());
        MjpegSession::new(
            MjpegServerConfig {
                bind_addr: "127.0.0.1:0".into(),
                ..Default::default()
            },
            controls,
        )
    }

    #[tokio::test]
    async fn projection_feeds_frames_until_stopped() {
        let (scope, _errors) = TaskScope::new();
        let mut session = session();
        session.start(&scope).await.unwrap();
        assert!(!session.is_streaming());

        let mut frames = session.frames.subscribe();
        let grant = CaptureGrant::Screen(Box::new(SyntheticSource::new(32, 16, 30)));
        session
            .handle_event(ModuleEvent::StartProjection(grant), &scope)
            .await
            .unwrap();
        assert!(session.is_streaming());

        tokio::time::timeout(Duration::from_secs(5), frames.changed())
            .await
            .unwrap()
            .unwrap();
        let jpeg = frames.borrow().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);

        session
            .handle_event(ModuleEvent::StopStream("user".into()), &scope)
            .await
            .unwrap();
        assert!(!session.is_streaming());
        assert!(session.server.is_some());

        session.stop().await;
        scope.shutdown().await;
        assert!(session.server.is_none());
    }

    #[tokio::test]
    async fn encoded_grant_is_rejected() {
        let (scope, _errors) = TaskScope::new();
        let mut session = session();
        let source = crate::capture::AnnexBFileSource::from_bytes(
            &[0, 0, 0, 1, 0x67, 0x42, 0, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 0, 1, 0x65, 0x88],
            30,
        )
        .unwrap();
        let result = session
            .handle_event(ModuleEvent::StartProjection(CaptureGrant::Encoded(source)), &scope)
            .await;
        assert!(matches!(result, Err(CastError::InvalidParameter(_))));
    }
}
