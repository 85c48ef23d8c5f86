use std::net::SocketAddr;
use std::sync::Arc;

use crate::media::TrackKind;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::{TransportHeader, sdp};
use crate::rtsp::server::ServerContext;
use crate::rtsp::session::{SessionState, TrackDelivery};
use crate::transport::TcpSocket;

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// What a request URI points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Aggregate,
    Track(TrackKind),
}

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    context: Arc<ServerContext>,
    socket: Arc<TcpSocket>,
    client_addr: SocketAddr,
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        context: Arc<ServerContext>,
        socket: Arc<TcpSocket>,
        client_addr: SocketAddr,
    ) -> Self {
        Self {
            context,
            socket,
            client_addr,
            session_ids: Vec::new(),
        }
    }

    /// Session IDs owned by this connection.
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        if let Some(session) = request
            .session_id()
            .and_then(|id| self.context.sessions.get_session(id))
        {
            session.touch();
        }

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", cseq)
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");
        if self.resolve(uri) != Some(Target::Aggregate) {
            tracing::warn!(uri, "DESCRIBE for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        }

        let stream = &self.context.stream;
        let description =
            sdp::build_sdp(&stream.video, stream.audio.as_ref(), stream.sdp_session_id);
        let base = format!("{}/", uri.trim_end_matches('/'));

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(description)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let track = match self.resolve(&request.uri) {
            Some(Target::Track(track)) => track,
            Some(Target::Aggregate) => TrackKind::Video,
            None => {
                tracing::warn!(uri = %request.uri, "SETUP for unknown stream");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let Some(header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        let Some(requested) = TransportHeader::parse(header) else {
            tracing::warn!(%cseq, header, "SETUP invalid Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };
        if !requested.unicast || !requested.profile.to_ascii_uppercase().starts_with("RTP/AVP") {
            tracing::warn!(%cseq, transport = %requested, "unsupported transport requested");
            return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
        }

        let (delivery, reply) = if requested.is_tcp() {
            let id = track.track_id();
            let (rtp_channel, rtcp_channel) = requested.interleaved.unwrap_or((id * 2, id * 2 + 1));
            let mut reply = TransportHeader::new("RTP/AVP/TCP");
            reply.interleaved = Some((rtp_channel, rtcp_channel));
            (
                TrackDelivery::Interleaved {
                    socket: self.socket.clone(),
                    rtp_channel,
                    rtcp_channel,
                },
                reply,
            )
        } else {
            let Some((rtp, rtcp)) = requested.client_ports else {
                tracing::warn!(%cseq, transport = %requested, "UDP transport without client_port");
                return RtspResponse::unsupported_transport().add_header("CSeq", cseq);
            };
            let server_port = self.context.udp_port;
            let mut reply = TransportHeader::new("RTP/AVP");
            reply.client_ports = Some((rtp, rtcp));
            (
                TrackDelivery::Udp {
                    rtp: SocketAddr::new(self.client_addr.ip(), rtp),
                    rtcp: SocketAddr::new(self.client_addr.ip(), rtcp),
                },
                reply.with_server_ports(server_port, server_port.wrapping_add(1)),
            )
        };

        let session = match request.session_id() {
            Some(id) => match self.context.sessions.get_session(id) {
                Some(session) => session,
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found().add_header("CSeq", cseq);
                }
            },
            None => {
                let session = self.context.sessions.create_session(
                    &self.aggregate_uri(&request.uri),
                    self.context.config.session_timeout_secs,
                );
                self.session_ids.push(session.id.clone());
                session
            }
        };
        session.set_track(track, delivery);

        tracing::info!(
            session_id = %session.id,
            ?track,
            client = %self.client_addr,
            transport = %reply,
            "track set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &reply.to_string())
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = request
            .session_id()
            .and_then(|id| self.context.sessions.get_session(id))
        else {
            tracing::warn!(%cseq, session = ?request.session_id(), "PLAY for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        let tracks = session.track_kinds();
        if tracks.is_empty() {
            return RtspResponse::new(455, "Method Not Valid in This State")
                .add_header("CSeq", cseq);
        }

        let rtp_info = {
            let packetizers = self.context.packetizers.lock();
            tracks
                .iter()
                .filter_map(|&kind| {
                    let p = packetizers.get(kind)?;
                    Some(format!(
                        "url={}/trackID={};seq={};rtptime={}",
                        session.uri.trim_end_matches('/'),
                        kind.track_id(),
                        p.next_sequence(),
                        p.rtp_timestamp()
                    ))
                })
                .collect::<Vec<_>>()
                .join(",")
        };

        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, "session started playing");

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        match request
            .session_id()
            .and_then(|id| self.context.sessions.get_session(id))
        {
            Some(session) => {
                session.set_state(SessionState::Paused);
                tracing::info!(session_id = %session.id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
            }
            None => {
                tracing::warn!(%cseq, session = ?request.session_id(), "PAUSE for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        match request
            .session_id()
            .and_then(|id| self.context.sessions.remove_session(id))
        {
            Some(session) => {
                self.session_ids.retain(|id| id != &session.id);
                tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(
                    %cseq,
                    session = ?request.session_id(),
                    "TEARDOWN for unknown session"
                );
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// Keep-alive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");
        let mut response = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(session) = request
            .session_id()
            .and_then(|id| self.context.sessions.get_session(id))
        {
            response = response.add_header("Session", &session.session_header_value());
        }
        response
    }

    fn resolve(&self, uri: &str) -> Option<Target> {
        let path = uri_path(uri).trim_end_matches('/');
        let stream = self.context.config.path.trim_end_matches('/');
        if path == stream {
            return Some(Target::Aggregate);
        }
        let control = path.strip_prefix(stream)?.strip_prefix('/')?;
        match control.strip_prefix("trackID=")?.parse::<u8>().ok()? {
            id if id == TrackKind::Video.track_id() => Some(Target::Track(TrackKind::Video)),
            id if id == TrackKind::Audio.track_id() && self.context.stream.audio.is_some() => {
                Some(Target::Track(TrackKind::Audio))
            }
            _ => None,
        }
    }

    fn aggregate_uri(&self, uri: &str) -> String {
        match uri.rfind("/trackID=") {
            Some(pos) => uri[..pos].to_string(),
            None => uri.trim_end_matches('/').to_string(),
        }
    }
}

/// Path part of an absolute or relative RTSP URI, query removed.
fn uri_path(uri: &str) -> &str {
    let rest = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"));
    let path = match rest {
        Some(rest) => rest.find('/').map_or("/", |i| &rest[i..]),
        None => uri,
    };
    path.split('?').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioCodec, AudioParams, VideoParams};
    use crate::rtsp::server::{RtspServerConfig, StreamDescription};

    fn sps() -> Vec<u8> {
        vec![0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01]
    }

    async fn handler(audio: bool) -> (MethodHandler, tokio::net::TcpStream) {
        let audio = audio.then_some(AudioParams {
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channels: 2,
        });
        let video = VideoParams::h264(sps(), vec![0x68, 0xce, 0x3c, 0x80]);
        let stream = StreamDescription::new(video, audio);
        let context = Arc::new(ServerContext::new(RtspServerConfig::default(), stream, 5000));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        let (server_side, peer) = accepted.unwrap();
        let socket = Arc::new(TcpSocket::accepted(server_side).unwrap());
        (MethodHandler::new(context, socket, peer), client.unwrap())
    }

    fn request(method: &str, uri: &str, cseq: u32) -> RtspRequest {
        RtspRequest::new(method, uri).add_header("CSeq", &cseq.to_string())
    }

    #[test]
    fn uri_path_variants() {
        assert_eq!(uri_path("rtsp://h:8554/screen/trackID=0"), "/screen/trackID=0");
        assert_eq!(uri_path("rtsp://h:8554"), "/");
        assert_eq!(uri_path("/screen?x=1"), "/screen");
    }

    #[tokio::test]
    async fn options_lists_methods() {
        let (mut h, _c) = handler(false).await;
        let resp = h.handle(&request("OPTIONS", "*", 1));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.get_header("CSeq"), Some("1"));
        assert!(resp.get_header("Public").unwrap().contains("GET_PARAMETER"));
    }

    #[tokio::test]
    async fn describe_returns_sdp() {
        let (mut h, _c) = handler(true).await;
        let resp = h.handle(&request("DESCRIBE", "rtsp://127.0.0.1:8554/screen", 2));
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.get_header("Content-Type"), Some("application/sdp"));
        let body = resp.body.unwrap();
        assert!(body.contains("a=rtpmap:96 H264/90000"));
        assert!(body.contains("m=audio"));

        let resp = h.handle(&request("DESCRIBE", "rtsp://127.0.0.1:8554/other", 3));
        assert_eq!(resp.status_code, 404);
    }

    #[tokio::test]
    async fn udp_setup_play_teardown() {
        let (mut h, _c) = handler(false).await;
        let setup = request("SETUP", "rtsp://127.0.0.1:8554/screen/trackID=0", 3)
            .add_header("Transport", "RTP/AVP;unicast;client_port=7000-7001");
        let resp = h.handle(&setup);
        assert_eq!(resp.status_code, 200);
        assert_eq!(
            resp.get_header("Transport"),
            Some("RTP/AVP;unicast;client_port=7000-7001;server_port=5000-5001")
        );
        let session = resp.session_id().unwrap().to_string();
        assert_eq!(h.session_ids(), [session.clone()]);

        let play =
            request("PLAY", "rtsp://127.0.0.1:8554/screen", 4).add_header("Session", &session);
        let resp = h.handle(&play);
        assert_eq!(resp.status_code, 200);
        let info = resp.get_header("RTP-Info").unwrap();
        assert!(info.starts_with("url=rtsp://127.0.0.1:8554/screen/trackID=0;seq="));
        assert!(info.contains(";rtptime="));
        assert_eq!(h.context.sessions.get_playing_sessions().len(), 1);

        let teardown =
            request("TEARDOWN", "rtsp://127.0.0.1:8554/screen", 5).add_header("Session", &session);
        assert_eq!(h.handle(&teardown).status_code, 200);
        assert!(h.session_ids().is_empty());
        assert_eq!(h.handle(&teardown).status_code, 454);
    }

    #[tokio::test]
    async fn tcp_setup_uses_interleaved_channels() {
        let (mut h, _c) = handler(true).await;
        let video = request("SETUP", "rtsp://127.0.0.1:8554/screen/trackID=0", 1)
            .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1");
        let resp = h.handle(&video);
        assert_eq!(resp.get_header("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=0-1"));
        let session = resp.session_id().unwrap().to_string();

        let audio = request("SETUP", "rtsp://127.0.0.1:8554/screen/trackID=1", 2)
            .add_header("Transport", "RTP/AVP/TCP;unicast")
            .add_header("Session", &session);
        let resp = h.handle(&audio);
        assert_eq!(resp.get_header("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=2-3"));
        let s = h.context.sessions.get_session(&session).unwrap();
        assert_eq!(s.track_kinds(), vec![TrackKind::Video, TrackKind::Audio]);
    }

    #[tokio::test]
    async fn error_statuses() {
        let (mut h, _c) = handler(false).await;
        let multicast = request("SETUP", "rtsp://h/screen/trackID=0", 1)
            .add_header("Transport", "RTP/AVP;multicast");
        assert_eq!(h.handle(&multicast).status_code, 461);

        let no_ports = request("SETUP", "rtsp://h/screen/trackID=0", 2)
            .add_header("Transport", "RTP/AVP;unicast");
        assert_eq!(h.handle(&no_ports).status_code, 461);

        let missing = request("SETUP", "rtsp://h/screen/trackID=0", 3);
        assert_eq!(h.handle(&missing).status_code, 400);

        let audio_absent = request("SETUP", "rtsp://h/screen/trackID=1", 4)
            .add_header("Transport", "RTP/AVP;unicast;client_port=7000-7001");
        assert_eq!(h.handle(&audio_absent).status_code, 404);

        let play = request("PLAY", "rtsp://h/screen", 5).add_header("Session", "DEADBEEF");
        assert_eq!(h.handle(&play).status_code, 454);
        assert_eq!(h.handle(&request("RECORD", "rtsp://h/screen", 6)).status_code, 501);
    }
}
