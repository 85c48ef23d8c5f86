use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{CastError, Result};
use crate::mjpeg::clients::{Client, ClientRegistry, ClientStats};
use crate::mjpeg::http::{self, HttpRequest, HttpResponse};
use crate::mjpeg::pages::{self, FAVICON_PATH, PIN_REQUEST_PATH, Pages};
use crate::mjpeg::pin::{PinCheck, PinGuard};
use crate::mjpeg::{EVENT_CAPACITY, ServerEvent};
use crate::transport::TcpSocket;

const BOUNDARY_LEN: usize = 20;

/// MJPEG server settings.
#[derive(Debug, Clone)]
pub struct MjpegServerConfig {
    pub bind_addr: String,
    /// Viewers must enter this PIN before the stream is served.
    pub pin: Option<String>,
    /// Resend the last frame this often while capture produces nothing,
    /// so browsers keep the connection open.
    pub idle_resend: Duration,
}

impl Default for MjpegServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            pin: None,
            idle_resend: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Stopped,
}

/// Everything connection tasks need for one run.
struct Shared {
    pages: Pages,
    pin: PinGuard,
    clients: ClientRegistry,
    frames: watch::Receiver<Option<Bytes>>,
    events: broadcast::Sender<ServerEvent>,
    boundary: String,
    idle_resend: Duration,
}

/// Serves the latest JPEG as `multipart/x-mixed-replace` to browsers.
///
/// Each viewer gets its own two-frame buffer fed by a distributor task
/// watching the capture output; see [`FrameBuffer`] for the overflow
/// policy.
///
/// [`FrameBuffer`]: crate::mjpeg::clients::FrameBuffer
pub struct MjpegServer {
    config: MjpegServerConfig,
    frames: watch::Receiver<Option<Bytes>>,
    events: broadcast::Sender<ServerEvent>,
    clients: ClientRegistry,
    state: ServerState,
    shared: Option<Arc<Shared>>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MjpegServer {
    pub fn new(config: MjpegServerConfig, frames: watch::Receiver<Option<Bytes>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            frames,
            clients: ClientRegistry::new(events.clone()),
            events,
            state: ServerState::Created,
            shared: None,
            local_addr: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Path of the multipart stream, known once started.
    pub fn stream_path(&self) -> Option<&str> {
        self.shared.as_ref().map(|s| s.pages.stream_path.as_str())
    }

    pub fn clients(&self) -> Vec<ClientStats> {
        self.clients.stats()
    }

    /// Bind and start serving. Only valid once, from `Created`.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.state != ServerState::Created {
            return Err(CastError::invalid_state("MjpegServer", "start", self.state));
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => CastError::AddressInUse(self.config.bind_addr.clone()),
            std::io::ErrorKind::AddrNotAvailable => CastError::AddressNotFound,
            _ => CastError::Io(e),
        })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            pages: Pages::new(self.config.pin.is_some())?,
            pin: PinGuard::new(self.config.pin.clone()),
            clients: self.clients.clone(),
            frames: self.frames.clone(),
            events: self.events.clone(),
            boundary: pages::random_string(BOUNDARY_LEN),
            idle_resend: self.config.idle_resend,
        });

        self.tracker.spawn(distribute(
            self.frames.clone(),
            self.clients.clone(),
            self.cancel.clone(),
        ));
        self.tracker.spawn(accept_loop(
            listener,
            shared.clone(),
            self.tracker.clone(),
            self.cancel.clone(),
        ));

        tracing::info!(
            addr = %local_addr,
            stream = %shared.pages.stream_path,
            pin = shared.pin.enabled(),
            "MJPEG server listening"
        );
        self.shared = Some(shared);
        self.local_addr = Some(local_addr);
        self.state = ServerState::Running;
        Ok(local_addr)
    }

    /// Close every connection and wait for all tasks to finish. Only
    /// valid from `Running`.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != ServerState::Running {
            return Err(CastError::invalid_state("MjpegServer", "stop", self.state));
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.clients.clear();
        self.state = ServerState::Stopped;
        tracing::info!("MJPEG server stopped");
        Ok(())
    }
}

impl Drop for MjpegServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(handle_connection(stream, peer, shared.clone(), cancel.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "HTTP accept error"),
            },
        }
    }
}

/// Feeds every viewer buffer from the capture output.
async fn distribute(
    mut frames: watch::Receiver<Option<Bytes>>,
    clients: ClientRegistry,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    tracing::debug!("frame producer gone");
                    break;
                }
                let jpeg = frames.borrow_and_update().clone();
                if let Some(jpeg) = jpeg {
                    clients.broadcast(&jpeg);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let socket = match TcpSocket::accepted(stream) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "failed to set up connection");
            return;
        }
    };

    let result = tokio::select! {
        result = serve(&socket, peer, &shared) => result,
        _ = cancel.cancelled() => Ok(()),
    };
    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "HTTP connection ended");
    }
    socket.close().await;
}

enum Reply {
    Response(HttpResponse),
    Stream,
}

async fn serve(socket: &TcpSocket, peer: SocketAddr, shared: &Shared) -> Result<()> {
    loop {
        let Some(raw) = http::read_request_head(socket).await? else {
            return Ok(());
        };
        let request = HttpRequest::parse(&raw)?;
        tracing::debug!(%peer, method = %request.method, path = %request.path, "HTTP request");

        match route(&request, peer.ip(), shared) {
            Reply::Response(response) => {
                response.write_to(socket).await?;
                let close = request
                    .get_header("Connection")
                    .is_some_and(|v| v.eq_ignore_ascii_case("close"));
                if close || request.version == "HTTP/1.0" {
                    return Ok(());
                }
            }
            Reply::Stream => return stream_mjpeg(socket, peer, shared).await,
        }
    }
}

fn route(request: &HttpRequest, ip: IpAddr, shared: &Shared) -> Reply {
    if request.method != "GET" {
        return Reply::Response(HttpResponse::method_not_allowed());
    }
    let now = Instant::now();
    let pages = &shared.pages;
    let pin = &shared.pin;

    let path = request.path.as_str();
    let response = if path == "/" {
        if pin.is_blocked(ip, now) {
            HttpResponse::forbidden(&pages.blocked)
        } else if pin.is_authorized(ip, now) {
            HttpResponse::html(&pages.index)
        } else {
            HttpResponse::html(&pages.pin_request)
        }
    } else if path == FAVICON_PATH {
        HttpResponse::new(200, "OK").with_body("image/png", pages.favicon.clone())
    } else if path == PIN_REQUEST_PATH && pin.enabled() {
        match request.query_param("pin") {
            _ if pin.is_blocked(ip, now) => HttpResponse::forbidden(&pages.blocked),
            None => HttpResponse::html(&pages.pin_request),
            Some(candidate) => match pin.check(ip, candidate, now) {
                PinCheck::Accepted => HttpResponse::html(&pages.index),
                PinCheck::Rejected { .. } => HttpResponse::html(&pages.pin_error),
                PinCheck::Blocked => {
                    let _ = shared.events.send(ServerEvent::AddressBlocked(ip));
                    HttpResponse::forbidden(&pages.blocked)
                }
            },
        }
    } else if path == pages.stream_path || path == pages.jpeg_path {
        if pin.is_blocked(ip, now) {
            HttpResponse::forbidden(&pages.blocked)
        } else if !pin.is_authorized(ip, now) {
            redirect_home(request)
        } else if path == pages.stream_path {
            return Reply::Stream;
        } else {
            match shared.frames.borrow().clone() {
                Some(jpeg) => HttpResponse::new(200, "OK").with_body("image/jpeg", jpeg),
                None => {
                    HttpResponse::new(503, "Service Unavailable").add_header("Retry-After", "1")
                }
            }
        }
    } else {
        redirect_home(request)
    };
    Reply::Response(response)
}

fn redirect_home(request: &HttpRequest) -> HttpResponse {
    match request.get_header("Host") {
        Some(host) => HttpResponse::moved_permanently(&format!("http://{host}/")),
        None => HttpResponse::moved_permanently("/"),
    }
}

async fn stream_mjpeg(socket: &TcpSocket, peer: SocketAddr, shared: &Shared) -> Result<()> {
    let client = shared.clients.register(peer);
    let result = write_stream(socket, &client, shared).await;
    shared.clients.remove(client.id);
    result
}

async fn write_stream(socket: &TcpSocket, client: &Client, shared: &Shared) -> Result<()> {
    let boundary = &shared.boundary;
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={boundary}\r\n\
         Cache-Control: no-cache, no-store, must-revalidate\r\n\
         Pragma: no-cache\r\n\
         Connection: close\r\n\r\n\
         --{boundary}\r\n"
    );
    socket.write_and_flush(&[head.as_bytes()]).await?;
    client.add_bytes(head.len());

    let mut last = shared.frames.borrow().clone();
    if let Some(jpeg) = &last {
        client.add_bytes(write_part(socket, boundary, jpeg).await?);
    }

    loop {
        let jpeg = match tokio::time::timeout(shared.idle_resend, client.buffer.pop()).await {
            Ok(jpeg) => {
                last = Some(jpeg.clone());
                jpeg
            }
            Err(_) => match &last {
                Some(jpeg) => jpeg.clone(),
                None => continue,
            },
        };
        if !shared.pin.is_authorized(client.addr.ip(), Instant::now()) {
            tracing::info!(client_id = client.id, "viewer no longer authorized");
            return Ok(());
        }
        client.add_bytes(write_part(socket, boundary, &jpeg).await?);
    }
}

/// One multipart part followed by the next boundary. Returns bytes written.
async fn write_part(socket: &TcpSocket, boundary: &str, jpeg: &[u8]) -> Result<usize> {
    let header = format!("Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", jpeg.len());
    let trailer = format!("\r\n--{boundary}\r\n");
    socket
        .write_and_flush(&[header.as_bytes(), jpeg, trailer.as_bytes()])
        .await?;
    Ok(header.len() + jpeg.len() + trailer.len())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn config(pin: Option<&str>) -> MjpegServerConfig {
        MjpegServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            pin: pin.map(str::to_string),
            idle_resend: Duration::from_millis(200),
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "GET {path} HTTP/1.1\r\nHost: screen.local:8080\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn lifecycle_contract() {
        let (_tx, rx) = watch::channel(None);
        let mut server = MjpegServer::new(config(None), rx);
        assert!(server.stop().await.is_err());
        server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.start().await.is_err());
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.stop().await, Err(CastError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn bind_conflict_is_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (_tx, rx) = watch::channel(None);
        let mut server = MjpegServer::new(
            MjpegServerConfig {
                bind_addr: taken.local_addr().unwrap().to_string(),
                ..config(None)
            },
            rx,
        );
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, CastError::AddressInUse(_)));
        assert_eq!(err.class(), crate::report::ErrorClass::Fixable);
    }

    #[tokio::test]
    async fn routes_without_pin() {
        let (tx, rx) = watch::channel(None);
        let mut server = MjpegServer::new(config(None), rx);
        let addr = server.start().await.unwrap();

        let index = get(addr, "/").await;
        assert!(index.starts_with("HTTP/1.1 200 OK"));
        assert!(index.contains("/stream.mjpeg"));

        assert!(get(addr, "/favicon.ico").await.contains("Content-Type: image/png"));
        assert!(get(addr, "/stream.jpeg").await.starts_with("HTTP/1.1 503"));

        tx.send_replace(Some(Bytes::from_static(b"\xff\xd8jpeg")));
        let single = get(addr, "/stream.jpeg").await;
        assert!(single.contains("Content-Type: image/jpeg"));
        assert!(single.ends_with("jpeg"));

        let other = get(addr, "/nope").await;
        assert!(other.starts_with("HTTP/1.1 301"));
        assert!(other.contains("Location: http://screen.local:8080/\r\n"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pin_gate_and_block() {
        let (_tx, rx) = watch::channel(None);
        let mut server = MjpegServer::new(config(Some("2468")), rx);
        let mut events = server.subscribe();
        let addr = server.start().await.unwrap();
        let stream_path = server.stream_path().unwrap().to_string();
        assert_ne!(stream_path, "/stream.mjpeg");

        assert!(get(addr, "/").await.contains("Stream requires PIN"));
        assert!(get(addr, &stream_path).await.starts_with("HTTP/1.1 301"));

        for _ in 0..4 {
            assert!(get(addr, "/pinrequest?pin=1111").await.contains("Wrong PIN"));
        }
        assert!(get(addr, "/pinrequest?pin=1111").await.starts_with("HTTP/1.1 403"));
        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::AddressBlocked("127.0.0.1".parse().unwrap())
        );
        assert!(get(addr, "/pinrequest?pin=2468").await.starts_with("HTTP/1.1 403"));
        assert!(get(addr, "/").await.starts_with("HTTP/1.1 403"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn correct_pin_opens_stream() {
        let (tx, rx) = watch::channel(Some(Bytes::from_static(b"\xff\xd8first")));
        let mut server = MjpegServer::new(config(Some("2468")), rx);
        let addr = server.start().await.unwrap();
        let stream_path = server.stream_path().unwrap().to_string();

        assert!(get(addr, "/pinrequest?pin=2468").await.contains(&stream_path));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {stream_path} HTTP/1.1\r\nHost: x\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let mut seen = String::new();
        while !seen.contains("first\r\n--") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(seen.contains("multipart/x-mixed-replace; boundary="));
        assert!(seen.contains("Content-Type: image/jpeg\r\nContent-Length: 7\r\n\r\n"));

        tx.send_replace(Some(Bytes::from_static(b"\xff\xd8second")));
        while !seen.contains("second") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert_eq!(server.clients().len(), 1);
        assert!(server.clients()[0].bytes_sent > 0);

        server.stop().await.unwrap();
        assert!(server.clients().is_empty());
    }
}
