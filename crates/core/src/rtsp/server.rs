use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{CastError, Result};
use crate::media::{AudioParams, MediaFrame, RtpPacket, TrackPacketizers, VideoParams};
use crate::protocol::RtspRequest;
use crate::rtsp::handler::MethodHandler;
use crate::rtsp::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionManager, TrackDelivery, Viewer};
use crate::transport::interleaved::{self, MessageLimits};
use crate::transport::{TcpSocket, UdpTransport};

const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// A TCP viewer that cannot take a packet within this time is dropped.
const INTERLEAVED_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Packets a TCP viewer may fall behind by before it is dropped.
const INTERLEAVED_QUEUE_CAPACITY: usize = 1024;

/// Feeds one viewer's interleaved writer task: `(channel, packet)`.
type InterleavedQueue = mpsc::Sender<(u8, Bytes)>;

/// RTSP server settings.
#[derive(Debug, Clone)]
pub struct RtspServerConfig {
    pub bind_addr: String,
    /// Stream path players ask for, e.g. `rtsp://host:8554/screen`.
    pub path: String,
    pub session_timeout_secs: u64,
}

impl Default for RtspServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            path: "/screen".to_string(),
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
        }
    }
}

/// Codec parameters of the one stream the server offers.
#[derive(Debug, Clone)]
pub struct StreamDescription {
    pub video: VideoParams,
    pub audio: Option<AudioParams>,
    /// `o=` session id, fixed for the server's lifetime.
    pub sdp_session_id: u32,
}

impl StreamDescription {
    pub fn new(video: VideoParams, audio: Option<AudioParams>) -> Self {
        Self {
            video,
            audio,
            sdp_session_id: rand::rng().random_range(0..i32::MAX as u32),
        }
    }
}

/// State shared by the connection tasks and the fan-out task.
pub struct ServerContext {
    pub(crate) config: RtspServerConfig,
    pub(crate) stream: StreamDescription,
    pub(crate) sessions: SessionManager,
    /// One packetizer per track. Held by the fan-out task while
    /// packetizing and read by PLAY for `RTP-Info`.
    pub(crate) packetizers: Mutex<TrackPacketizers>,
    /// Local port of the shared RTP socket, announced as `server_port`.
    pub(crate) udp_port: u16,
}

impl ServerContext {
    pub fn new(config: RtspServerConfig, stream: StreamDescription, udp_port: u16) -> Self {
        let packetizers = TrackPacketizers::new(&stream.video, stream.audio.as_ref());
        Self {
            config,
            stream,
            sessions: SessionManager::new(),
            packetizers: Mutex::new(packetizers),
            udp_port,
        }
    }
}

/// RTSP server for players pulling the live stream.
///
/// [`bind`](Self::bind) claims the listening port; [`run`](Self::run)
/// serves connections and fans encoded frames out to every playing
/// session until cancelled.
pub struct RtspServer {
    listener: TcpListener,
    udp: UdpTransport,
    context: Arc<ServerContext>,
}

impl RtspServer {
    pub async fn bind(config: RtspServerConfig, stream: StreamDescription) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                CastError::AddressInUse(config.bind_addr.clone())
            } else {
                CastError::Io(e)
            }
        })?;
        let udp = UdpTransport::bind().await?;
        let udp_port = udp.local_port().ok_or(CastError::AddressNotFound)?;

        tracing::info!(
            addr = %config.bind_addr,
            path = %config.path,
            codec = ?stream.video.codec,
            udp_port,
            "RTSP server listening"
        );
        Ok(Self {
            listener,
            udp,
            context: Arc::new(ServerContext::new(config, stream, udp_port)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry handle, usable after `run` takes the server.
    pub fn sessions(&self) -> SessionManager {
        self.context.sessions.clone()
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.context.sessions.viewers()
    }

    /// Serve until `cancel` fires. Frames arriving on `media` are
    /// packetized once and delivered to every playing session. Returns
    /// after every connection task has finished.
    pub async fn run(
        self,
        media: mpsc::Receiver<MediaFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let tracker = TaskTracker::new();
        let udp = Arc::new(self.udp);

        tracker.spawn(fan_out(
            self.context.clone(),
            udp,
            media,
            tracker.clone(),
            cancel.clone(),
        ));
        tracker.spawn(reap_sessions(self.context.sessions.clone(), cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.context.clone();
                        tracker.spawn(Connection::handle(stream, peer, context, cancel.clone()));
                    }
                    Err(e) => tracing::warn!(error = %e, "TCP accept error"),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::debug!("RTSP server stopped");
        Ok(())
    }
}

/// One player's control connection.
struct Connection {
    socket: Arc<TcpSocket>,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    async fn handle(
        stream: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<ServerContext>,
        cancel: CancellationToken,
    ) {
        let socket = match TcpSocket::accepted(stream) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "failed to set up connection");
                return;
            }
        };
        tracing::info!(%peer_addr, "client connected");

        let handler = MethodHandler::new(context.clone(), socket.clone(), peer_addr);
        let mut conn = Connection {
            socket,
            handler,
            peer_addr,
        };

        let reason = tokio::select! {
            reason = conn.run() => reason,
            _ = cancel.cancelled() => "server shutting down",
        };
        conn.cleanup(&context.sessions).await;

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    async fn run(&mut self) -> &'static str {
        let limits = MessageLimits::default();
        loop {
            let raw = match self.socket.read_message(&limits).await {
                Ok(Some(raw)) => raw,
                Ok(None) => return "connection closed by client",
                Err(e) => {
                    tracing::debug!(peer = %self.peer_addr, error = %e, "read error");
                    return "read error";
                }
            };

            match RtspRequest::parse(&raw) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );
                    let response = self.handler.handle(&request);
                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self
                        .socket
                        .write_and_flush(&[response.serialize().as_bytes()])
                        .await
                        .is_err()
                    {
                        return "write error";
                    }
                }
                Err(e) => tracing::warn!(peer = %self.peer_addr, error = %e, "parse error"),
            }
        }
    }

    async fn cleanup(&self, sessions: &SessionManager) {
        let orphaned = self.handler.session_ids();
        if !orphaned.is_empty() {
            let removed = sessions.remove_sessions(orphaned);
            tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
        }
        self.socket.close().await;
    }
}

/// Packetizes each frame once. UDP viewers get their datagrams inline;
/// each interleaved viewer has its own queue and writer task, so a stalled
/// TCP connection never holds up the others.
async fn fan_out(
    context: Arc<ServerContext>,
    udp: Arc<UdpTransport>,
    mut media: mpsc::Receiver<MediaFrame>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let mut queues: HashMap<String, InterleavedQueue> = HashMap::new();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = media.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Packetize even without viewers so RTP-Info reflects live state.
        let packets: Vec<Bytes> = context
            .packetizers
            .lock()
            .packetize(&frame)
            .iter()
            .map(RtpPacket::to_bytes)
            .collect();
        if packets.is_empty() {
            continue;
        }

        let playing = context.sessions.get_playing_sessions();
        queues.retain(|id, queue| !queue.is_closed() && playing.iter().any(|s| &s.id == id));

        for session in playing {
            let Some(delivery) = session.track(frame.track) else {
                continue;
            };
            let delivered = match delivery {
                TrackDelivery::Udp { rtp, .. } => send_udp(&udp, rtp, &packets).await,
                TrackDelivery::Interleaved {
                    socket,
                    rtp_channel,
                    ..
                } => {
                    let queue = queues.entry(session.id.clone()).or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(INTERLEAVED_QUEUE_CAPACITY);
                        tracker.spawn(write_interleaved(
                            socket,
                            rx,
                            context.sessions.clone(),
                            session.id.clone(),
                            cancel.clone(),
                        ));
                        tx
                    });
                    enqueue(queue, rtp_channel, &packets)
                }
            };
            if let Err(e) = delivered {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "delivery failed, dropping session"
                );
                context.sessions.remove_session(&session.id);
                queues.remove(&session.id);
            }
        }
    }
    tracing::debug!("fan-out stopped");
}

async fn send_udp(udp: &UdpTransport, rtp: SocketAddr, packets: &[Bytes]) -> Result<()> {
    for packet in packets {
        udp.send_to(packet, rtp).await?;
    }
    Ok(())
}

fn enqueue(queue: &InterleavedQueue, channel: u8, packets: &[Bytes]) -> Result<()> {
    for packet in packets {
        queue.try_send((channel, packet.clone())).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CastError::Timeout("interleaved viewer stalled"),
            mpsc::error::TrySendError::Closed(_) => CastError::ChannelClosed("interleaved writer"),
        })?;
    }
    Ok(())
}

/// Drains one viewer's queue onto its control connection. Removes the
/// session when a write fails or stalls past [`INTERLEAVED_WRITE_TIMEOUT`].
async fn write_interleaved(
    socket: Arc<TcpSocket>,
    mut queue: mpsc::Receiver<(u8, Bytes)>,
    sessions: SessionManager,
    session_id: String,
    cancel: CancellationToken,
) {
    loop {
        let (channel, packet) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let written = async {
            let header = interleaved::frame_header(channel, packet.len())?;
            tokio::time::timeout(
                INTERLEAVED_WRITE_TIMEOUT,
                socket.write_and_flush(&[&header[..], &packet[..]]),
            )
            .await
            .map_err(|_| CastError::Timeout("interleaved write"))?
        }
        .await;
        if let Err(e) = written {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "interleaved delivery failed, dropping session"
            );
            sessions.remove_session(&session_id);
            break;
        }
    }
    tracing::trace!(session_id = %session_id, "interleaved writer stopped");
}

async fn reap_sessions(sessions: SessionManager, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let reaped = sessions.reap_expired(Instant::now());
                if reaped > 0 {
                    tracing::debug!(reaped, remaining = sessions.len(), "expired sessions removed");
                }
            }
        }
    }
}
