//! RTSP publishing client: pushes the local stream to a remote server.
//!
//! ```text
//! OPTIONS  -> 200 (401 -> retry once with credentials)
//! ANNOUNCE -> 200   body: SDP
//! SETUP    -> 200   per track, UDP client_port or TCP interleaved
//! RECORD   -> 200   Range: npt=0.000-
//! ... RTP ...       GET_PARAMETER keep-alive
//! TEARDOWN          on every exit path
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::RngExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CastError, Result};
use crate::media::{
    AUDIO_TRACK_ID, AudioParams, MediaFrame, TrackKind, TrackPacketizers, VIDEO_TRACK_ID,
    VideoParams,
};
use crate::protocol::response::SERVER_AGENT;
use crate::protocol::{Authenticator, RtspRequest, RtspResponse, RtspUrl, TransportHeader, sdp};
use crate::transport::interleaved::MessageLimits;
use crate::transport::udp::even_port_pair;
use crate::transport::{Protocol, RtpOutput, TcpSocket, UdpSocket};

/// Frames buffered between the encoder and the socket.
pub const MEDIA_QUEUE_CAPACITY: usize = 32;
/// Queue fill level, in percent, above which non-key video frames are dropped.
pub const CONGESTION_PERCENT: usize = 20;
/// Upper bound for waiting on one RTSP response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
/// Keep-alive interval used when the server announces no session timeout.
pub const MAX_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Connection milestones published while the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { protocol: Protocol },
    Disconnected,
}

/// Item travelling through the media queue.
#[derive(Debug)]
pub enum QueueItem {
    Frame(MediaFrame),
    /// The encoder renegotiated its parameter sets mid-stream.
    VideoParams(VideoParams),
}

/// Create the bounded queue that feeds a running client.
pub fn media_queue(capacity: usize) -> (MediaSender, MediaReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let buffered = Arc::new(AtomicUsize::new(0));
    (
        MediaSender {
            tx,
            buffered: buffered.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        MediaReceiver {
            rx,
            buffered,
            capacity: capacity.max(1),
        },
    )
}

/// Producer side of the media queue. Never blocks: a full queue drops the
/// new frame.
#[derive(Debug, Clone)]
pub struct MediaSender {
    tx: mpsc::Sender<QueueItem>,
    buffered: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
}

impl MediaSender {
    pub fn send_frame(&self, frame: MediaFrame) -> bool {
        let track = frame.track;
        match self.tx.try_send(QueueItem::Frame(frame)) {
            Ok(()) => {
                self.buffered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?track, "media queue full, frame discarded");
                false
            }
        }
    }

    pub fn send_video_params(&self, params: VideoParams) -> bool {
        let sent = self.tx.try_send(QueueItem::VideoParams(params)).is_ok();
        if !sent {
            tracing::warn!("media queue full, new video parameters discarded");
        }
        sent
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the media queue, owned by the client's send loop.
#[derive(Debug)]
pub struct MediaReceiver {
    rx: mpsc::Receiver<QueueItem>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
}

impl MediaReceiver {
    pub async fn recv(&mut self) -> Option<QueueItem> {
        let item = self.rx.recv().await?;
        if matches!(item, QueueItem::Frame(_)) {
            let _ = self
                .buffered
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
        Some(item)
    }

    /// Whether the frames still waiting fill more than
    /// [`CONGESTION_PERCENT`] of the queue.
    pub fn is_congested(&self) -> bool {
        self.buffered.load(Ordering::Relaxed) * 100 >= self.capacity * CONGESTION_PERCENT
    }
}

/// Per-connection RTSP request state: CSeq, session and credentials.
#[derive(Debug)]
struct CommandState {
    cseq: u32,
    session_id: Option<String>,
    session_timeout: Option<u64>,
    authorization: Option<String>,
    authenticator: Option<Authenticator>,
    sdp_session_id: u32,
}

impl CommandState {
    fn new(url: &RtspUrl) -> Self {
        Self {
            cseq: 0,
            session_id: None,
            session_timeout: None,
            authorization: None,
            authenticator: url.credentials().map(Authenticator::new),
            sdp_session_id: rand::rng().random_range(0..i32::MAX as u32),
        }
    }

    /// Start a request with the common headers in wire order.
    fn request(&mut self, method: &str, uri: &str) -> RtspRequest {
        self.cseq += 1;
        let mut request = RtspRequest::new(method, uri)
            .add_header("CSeq", &self.cseq.to_string())
            .add_header("User-Agent", SERVER_AGENT);
        if let Some(auth) = &self.authorization {
            request = request.add_header("Authorization", auth);
        }
        if let Some(session) = &self.session_id {
            request = request.add_header("Session", session);
        }
        request
    }

    fn observe(&mut self, response: &RtspResponse) {
        if let Some(id) = response.session_id() {
            self.session_id = Some(id.to_string());
        }
        if let Some(timeout) = response.session_timeout() {
            self.session_timeout = Some(timeout);
        }
    }

    /// `max(timeout - 5, 5)` seconds, capped at [`MAX_KEEP_ALIVE`].
    fn keep_alive_interval(&self) -> Duration {
        match self.session_timeout {
            Some(timeout) if timeout > 0 => {
                Duration::from_secs(timeout.saturating_sub(5).max(5)).min(MAX_KEEP_ALIVE)
            }
            _ => MAX_KEEP_ALIVE,
        }
    }
}

/// How one track's RTP reaches the server, as agreed in SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackTransport {
    Interleaved { rtp: u8, rtcp: u8 },
    Udp { client: (u16, u16), server: (u16, u16) },
}

struct Outputs {
    video: RtpOutput,
    audio: Option<RtpOutput>,
}

/// Publishes one session to a remote RTSP server.
///
/// A client is single-use: [`run`](Self::run) drives the whole connection
/// and returns when it ends.
pub struct RtspClient {
    url: RtspUrl,
    protocol: Protocol,
    only_video: bool,
    limits: MessageLimits,
    commands: parking_lot::Mutex<CommandState>,
    bytes_sent: Arc<AtomicU64>,
    events: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl RtspClient {
    pub fn new(url: RtspUrl, protocol: Protocol, only_video: bool) -> Self {
        let commands = parking_lot::Mutex::new(CommandState::new(&url));
        Self {
            url,
            protocol,
            only_video,
            limits: MessageLimits::default(),
            commands,
            bytes_sent: Arc::new(AtomicU64::new(0)),
            events: None,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shared counter of RTP bytes written, interleaved headers included.
    pub fn bytes_sent(&self) -> Arc<AtomicU64> {
        self.bytes_sent.clone()
    }

    /// Connect, negotiate and stream until `cancel` fires, the media queue
    /// closes or the connection fails. TEARDOWN is attempted on every exit.
    pub async fn run(
        &self,
        video: VideoParams,
        audio: Option<AudioParams>,
        mut media: MediaReceiver,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !video.is_complete() {
            return Err(CastError::ClientFailed(
                "SPS/PPS/VPS not set or incomplete for video codec".into(),
            ));
        }
        let audio = if self.only_video { None } else { audio };

        let socket = Arc::new(TcpSocket::new(&self.url.host, self.url.port, self.url.tls));
        let result = tokio::select! {
            r = self.stream(&socket, &video, audio.as_ref(), &mut media) => r,
            _ = cancel.cancelled() => Ok(()),
        };

        self.teardown(&socket).await;
        match &result {
            Ok(()) => self.emit(ClientEvent::Disconnected),
            Err(e) => tracing::warn!(url = ?self.url, error = %e, "RTSP client stopped with error"),
        }
        result
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn stream(
        &self,
        socket: &Arc<TcpSocket>,
        video: &VideoParams,
        audio: Option<&AudioParams>,
        media: &mut MediaReceiver,
    ) -> Result<()> {
        socket.connect().await?;
        let (video_transport, audio_transport) = self.handshake(socket, video, audio).await?;
        tracing::info!(url = ?self.url, protocol = ?self.protocol, "RTSP publishing started");
        self.emit(ClientEvent::Connected {
            protocol: self.protocol,
        });

        let outputs = Outputs {
            video: self.output(socket, video_transport).await?,
            audio: match audio_transport {
                Some(t) => Some(self.output(socket, t).await?),
                None => None,
            },
        };

        let result = tokio::select! {
            r = self.send_loop(video, audio, media, &outputs) => r,
            r = self.keep_alive_loop(socket) => r,
        };

        for output in std::iter::once(&outputs.video).chain(outputs.audio.as_ref()) {
            if let RtpOutput::Udp(udp) = output {
                udp.close().await;
            }
        }
        result
    }

    async fn handshake(
        &self,
        socket: &TcpSocket,
        video: &VideoParams,
        audio: Option<&AudioParams>,
    ) -> Result<(TrackTransport, Option<TrackTransport>)> {
        let base = self.url.base_uri();

        self.exchange(socket, "OPTIONS", &base, &[], None).await?;

        let session_id = self.commands.lock().sdp_session_id;
        let description = sdp::build_sdp(video, audio, session_id);
        self.exchange(socket, "ANNOUNCE", &base, &[], Some(&description))
            .await?;

        let video_transport = self.setup_track(socket, VIDEO_TRACK_ID).await?;
        let audio_transport = match audio {
            Some(_) => Some(self.setup_track(socket, AUDIO_TRACK_ID).await?),
            None => None,
        };

        self.exchange(
            socket,
            "RECORD",
            &base,
            &[("Range", "npt=0.000-".to_string())],
            None,
        )
        .await?;
        Ok((video_transport, audio_transport))
    }

    async fn setup_track(&self, socket: &TcpSocket, track_id: u8) -> Result<TrackTransport> {
        let uri = self.url.track_uri(track_id);
        let mut requested = None;
        let transport = match self.protocol {
            Protocol::Tcp => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{};mode=record",
                track_id * 2,
                track_id * 2 + 1
            ),
            Protocol::Udp => {
                let (rtp, rtcp) = even_port_pair()?;
                requested = Some((rtp, rtcp));
                format!("RTP/AVP;unicast;client_port={rtp}-{rtcp};mode=record")
            }
        };

        let response = self
            .exchange(socket, "SETUP", &uri, &[("Transport", transport)], None)
            .await?;
        let missing = || {
            CastError::ClientFailed(format!(
                "SETUP track {track_id}: missing/invalid Transport header"
            ))
        };
        let reply = response
            .get_header("Transport")
            .and_then(TransportHeader::parse)
            .ok_or_else(missing)?;

        match self.protocol {
            Protocol::Tcp => {
                let (rtp, rtcp) = reply.interleaved.ok_or_else(missing)?;
                Ok(TrackTransport::Interleaved { rtp, rtcp })
            }
            Protocol::Udp => {
                if reply.interleaved.is_some() {
                    return Err(CastError::ClientFailed(format!(
                        "SETUP track {track_id}: unexpected TCP transport"
                    )));
                }
                let server = reply.server_ports.ok_or_else(missing)?;
                let client = reply.client_ports.or(requested).ok_or_else(missing)?;
                Ok(TrackTransport::Udp { client, server })
            }
        }
    }

    async fn output(
        &self,
        socket: &Arc<TcpSocket>,
        transport: TrackTransport,
    ) -> Result<RtpOutput> {
        match transport {
            TrackTransport::Interleaved { rtp, .. } => Ok(RtpOutput::Interleaved {
                socket: socket.clone(),
                channel: rtp,
            }),
            TrackTransport::Udp { client, server } => {
                let udp = UdpSocket::new(&self.url.host, server.0, client.0);
                udp.connect().await?;
                Ok(RtpOutput::Udp(Arc::new(udp)))
            }
        }
    }

    /// Send one request and read its response, retrying once with
    /// credentials on 401. Non-2xx answers become classified errors.
    async fn exchange(
        &self,
        socket: &TcpSocket,
        method: &'static str,
        uri: &str,
        headers: &[(&str, String)],
        body: Option<&str>,
    ) -> Result<RtspResponse> {
        let mut response = self.send_request(socket, method, uri, headers, body).await?;

        if response.status_code == 401 {
            {
                let mut commands = self.commands.lock();
                let state = &mut *commands;
                let authenticator = state.authenticator.as_mut().ok_or(CastError::NoCredentials)?;
                let value =
                    authenticator.respond(response.headers_named("WWW-Authenticate"), method, uri);
                state.authorization = Some(value);
            }
            tracing::debug!(method, "retrying with credentials");
            response = self.send_request(socket, method, uri, headers, body).await?;
        }

        match response.status_code {
            200..=299 => Ok(response),
            401 => Err(CastError::AuthFailed),
            403 => Err(CastError::AccessDenied),
            status => Err(CastError::ClientFailed(format!(
                "{method}: [{status}] {}",
                response.status_text
            ))),
        }
    }

    async fn send_request(
        &self,
        socket: &TcpSocket,
        method: &'static str,
        uri: &str,
        headers: &[(&str, String)],
        body: Option<&str>,
    ) -> Result<RtspResponse> {
        let mut request = self.commands.lock().request(method, uri);
        for (name, value) in headers {
            request = request.add_header(name, value);
        }
        if let Some(body) = body {
            request = request.with_body("application/sdp", body.to_string());
        }
        let cseq = request.cseq().map(str::to_string);

        tracing::debug!(method, uri, cseq = cseq.as_deref(), "sending request");
        socket.write_and_flush(&[request.serialize().as_bytes()]).await?;

        let raw = tokio::time::timeout(RESPONSE_TIMEOUT, socket.read_message(&self.limits))
            .await
            .map_err(|_| CastError::Timeout(method))??
            .ok_or_else(|| {
                CastError::ClientFailed(format!("{method}: connection closed by server"))
            })?;
        let response = RtspResponse::parse(&raw)?;

        if response.cseq().map(|c| c.to_string()) != cseq {
            tracing::warn!(
                method,
                expected = cseq.as_deref(),
                got = ?response.cseq(),
                "CSeq mismatch"
            );
        }
        self.commands.lock().observe(&response);
        tracing::debug!(method, status = response.status_code, "response");
        Ok(response)
    }

    async fn keep_alive_loop(&self, socket: &TcpSocket) -> Result<()> {
        let base = self.url.base_uri();
        loop {
            let interval = self.commands.lock().keep_alive_interval();
            tokio::time::sleep(interval).await;

            let method = if self.commands.lock().session_id.is_some() {
                "GET_PARAMETER"
            } else {
                "OPTIONS"
            };
            tracing::trace!(method, "keep-alive");
            self.exchange(socket, method, &base, &[], None)
                .await
                .map_err(|e| match e {
                    CastError::NoCredentials | CastError::AuthFailed | CastError::AccessDenied => e,
                    other => CastError::ClientFailed(format!("keep-alive failed: {other}")),
                })?;
        }
    }

    async fn send_loop(
        &self,
        video: &VideoParams,
        audio: Option<&AudioParams>,
        media: &mut MediaReceiver,
        outputs: &Outputs,
    ) -> Result<()> {
        let mut tracks = TrackPacketizers::new(video, audio);

        while let Some(item) = media.recv().await {
            match item {
                QueueItem::Frame(frame) => {
                    if frame.track == TrackKind::Video && !frame.key_frame && media.is_congested() {
                        tracing::trace!(
                            pts = frame.presentation_time_us,
                            "congested, non-key frame dropped"
                        );
                        continue;
                    }
                    let output = match frame.track {
                        TrackKind::Video => &outputs.video,
                        TrackKind::Audio => match &outputs.audio {
                            Some(output) => output,
                            None => continue,
                        },
                    };
                    for packet in tracks.packetize(&frame) {
                        let written = output.send(&packet).await?;
                        self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
                    }
                }
                QueueItem::VideoParams(params) => {
                    tracing::warn!(codec = ?params.codec, "applying new video parameter sets");
                    tracks.replace_video(&params);
                }
            }
        }
        tracing::debug!("media queue closed");
        Ok(())
    }

    async fn teardown(&self, socket: &TcpSocket) {
        if socket.is_connected() {
            let base = self.url.base_uri();
            let request = self.commands.lock().request("TEARDOWN", &base);
            if socket.write_and_flush(&[request.serialize().as_bytes()]).await.is_ok() {
                let _ =
                    tokio::time::timeout(RESPONSE_TIMEOUT, socket.read_message(&self.limits)).await;
            }
        }
        socket.close().await;
    }
}
