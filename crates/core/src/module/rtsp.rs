use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::capture::AnnexBFileSource;
use crate::error::{CastError, Result};
use crate::media::MediaFrame;
use crate::module::{CaptureGrant, ModuleEvent, Session, SessionFactory, TaskScope};
use crate::protocol::RtspUrl;
use crate::rtsp::client::MEDIA_QUEUE_CAPACITY;
use crate::rtsp::{
    ClientEvent, RtspClient, RtspServer, RtspServerConfig, SessionManager, StreamDescription,
    media_queue,
};
use crate::transport::Protocol;

fn screen_grant_rejected() -> CastError {
    CastError::InvalidParameter("RTSP streaming needs an encoded capture grant".into())
}

async fn stop_stream(stream: &mut Option<TaskScope>) {
    if let Some(scope) = stream.take() {
        scope.shutdown().await;
    }
}

/// Serves the encoded stream to RTSP players.
///
/// The listener comes up on the first projection; each projection gets its
/// own child scope holding the server and the frame feeder.
pub struct RtspServerSession {
    config: RtspServerConfig,
    stream: Option<TaskScope>,
    sessions: Option<SessionManager>,
    local_addr: Option<SocketAddr>,
}

impl RtspServerSession {
    pub fn new(config: RtspServerConfig) -> Self {
        Self {
            config,
            stream: None,
            sessions: None,
            local_addr: None,
        }
    }

    /// Listening address while a projection is served.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn stop_stream(&mut self) {
        stop_stream(&mut self.stream).await;
        self.sessions = None;
        self.local_addr = None;
    }

    async fn start_stream(&mut self, source: AnnexBFileSource, scope: &TaskScope) -> Result<()> {
        self.stop_stream().await;

        let server = RtspServer::bind(
            self.config.clone(),
            StreamDescription::new(source.video_params().clone(), None),
        )
        .await?;
        self.local_addr = Some(server.local_addr()?);
        self.sessions = Some(server.sessions());

        let stream = scope.child();

        let (tx, rx) = mpsc::channel::<MediaFrame>(MEDIA_QUEUE_CAPACITY);
        stream.spawn("rtsp-server", server.run(rx, stream.token()));
        let token = stream.token();
        stream.spawn("h264-file", async move {
            source
                .run(
                    |frame| match tx.try_send(frame) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    },
                    token,
                )
                .await;
            Ok(())
        });
        self.stream = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl Session for RtspServerSession {
    async fn start(&mut self, _scope: &TaskScope) -> Result<()> {
        tracing::info!(
            addr = %self.config.bind_addr,
            path = %self.config.path,
            "RTSP server session ready"
        );
        Ok(())
    }

    async fn handle_event(&mut self, event: ModuleEvent, scope: &TaskScope) -> Result<()> {
        match event {
            ModuleEvent::StartProjection(CaptureGrant::Encoded(source)) => {
                self.start_stream(source, scope).await
            }
            ModuleEvent::StartProjection(CaptureGrant::Screen(_)) => Err(screen_grant_rejected()),
            ModuleEvent::StopStream(reason) => {
                tracing::info!(%reason, "stopping RTSP server stream");
                self.stop_stream().await;
                Ok(())
            }
            ModuleEvent::RecoverError => {
                self.stop_stream().await;
                Ok(())
            }
            ModuleEvent::CastPermissionsDenied => Ok(()),
        }
    }

    fn is_streaming(&self) -> bool {
        self.sessions
            .as_ref()
            .is_some_and(|s| !s.get_playing_sessions().is_empty())
    }

    async fn stop(&mut self) {
        self.stop_stream().await;
    }
}

#[derive(Debug, Clone)]
pub struct RtspServerSessionFactory {
    config: RtspServerConfig,
}

impl RtspServerSessionFactory {
    pub fn new(config: RtspServerConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for RtspServerSessionFactory {
    fn create(&self) -> Box<dyn Session> {
        Box::new(RtspServerSession::new(self.config.clone()))
    }
}

/// Publishes the encoded stream to a remote RTSP server.
pub struct RtspClientSession {
    url: RtspUrl,
    protocol: Protocol,
    stream: Option<TaskScope>,
    connected: Arc<AtomicBool>,
}

impl RtspClientSession {
    pub fn new(url: RtspUrl, protocol: Protocol) -> Self {
        Self {
            url,
            protocol,
            stream: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn start_stream(&mut self, source: AnnexBFileSource, scope: &TaskScope) -> Result<()> {
        self.stop_stream().await;

        let stream = scope.child();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let client = RtspClient::new(self.url.clone(), self.protocol, true).with_events(events_tx);
        let (tx, rx) = media_queue(MEDIA_QUEUE_CAPACITY);
        let video = source.video_params().clone();

        let token = stream.token();
        stream.spawn("rtsp-client", async move { client.run(video, None, rx, token).await });

        let token = stream.token();
        stream.spawn("h264-file", async move {
            source
                .run(
                    |frame| {
                        if tx.is_closed() {
                            return false;
                        }
                        tx.send_frame(frame);
                        true
                    },
                    token,
                )
                .await;
            Ok(())
        });

        let connected = self.connected.clone();
        stream.spawn("rtsp-client-events", async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::Connected { protocol } => {
                        tracing::info!(?protocol, "RTSP client connected");
                        connected.store(true, Ordering::Relaxed);
                    }
                    ClientEvent::Disconnected => {
                        tracing::info!("RTSP client disconnected");
                        connected.store(false, Ordering::Relaxed);
                    }
                }
            }
            connected.store(false, Ordering::Relaxed);
            Ok(())
        });

        self.stream = Some(stream);
        Ok(())
    }

    async fn stop_stream(&mut self) {
        stop_stream(&mut self.stream).await;
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Session for RtspClientSession {
    async fn start(&mut self, _scope: &TaskScope) -> Result<()> {
        tracing::info!(url = ?self.url, protocol = ?self.protocol, "RTSP client session ready");
        Ok(())
    }

    async fn handle_event(&mut self, event: ModuleEvent, scope: &TaskScope) -> Result<()> {
        match event {
            ModuleEvent::StartProjection(CaptureGrant::Encoded(source)) => {
                self.start_stream(source, scope).await
            }
            ModuleEvent::StartProjection(CaptureGrant::Screen(_)) => Err(screen_grant_rejected()),
            ModuleEvent::StopStream(reason) => {
                tracing::info!(%reason, "stopping RTSP client stream");
                self.stop_stream().await;
                Ok(())
            }
            ModuleEvent::RecoverError => {
                self.stop_stream().await;
                Ok(())
            }
            ModuleEvent::CastPermissionsDenied => Ok(()),
        }
    }

    fn is_streaming(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn stop(&mut self) {
        self.stop_stream().await;
    }
}

#[derive(Debug, Clone)]
pub struct RtspClientSessionFactory {
    url: RtspUrl,
    protocol: Protocol,
}

impl RtspClientSessionFactory {
    pub fn new(url: RtspUrl, protocol: Protocol) -> Self {
        Self { url, protocol }
    }
}

impl SessionFactory for RtspClientSessionFactory {
    fn create(&self) -> Box<dyn Session> {
        Box::new(RtspClientSession::new(self.url.clone(), self.protocol))
    }
}
