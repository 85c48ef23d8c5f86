use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{CastError, Result};
use crate::transport::CONNECT_TIMEOUT;
use crate::transport::interleaved::{self, MessageLimits};
use crate::transport::tls;

/// Plain TCP or TLS, erased so both share one socket type.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// RTSP control connection.
///
/// One instance is owned by one session. Writers queue on the write mutex,
/// so a multi-part write (interleaved header plus RTP packet, or RTSP head
/// plus body) reaches the wire contiguously even when the media task and
/// the keep-alive task write at the same time. Readers queue on a second
/// mutex so that waiting for a response never stalls media writes.
///
/// The socket never reconnects on its own: after an error or [`close`]
/// the owner has to create a new one.
///
/// [`close`]: Self::close
pub struct TcpSocket {
    host: String,
    port: u16,
    tls: bool,
    connect_timeout: Duration,
    reader: Mutex<Option<BufReader<ReadHalf<BoxedStream>>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    connected: AtomicBool,
    peer: parking_lot::Mutex<Option<SocketAddr>>,
}

impl TcpSocket {
    /// A client socket; nothing happens until [`connect`](Self::connect).
    pub fn new(host: &str, port: u16, tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls,
            connect_timeout: CONNECT_TIMEOUT,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            peer: parking_lot::Mutex::new(None),
        }
    }

    /// Wrap a connection accepted by a listener.
    pub fn accepted(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = tokio::io::split(Box::new(stream) as BoxedStream);
        Ok(Self {
            host: peer.ip().to_string(),
            port: peer.port(),
            tls: false,
            connect_timeout: CONNECT_TIMEOUT,
            reader: Mutex::new(Some(BufReader::new(read))),
            writer: Mutex::new(Some(write)),
            connected: AtomicBool::new(true),
            peer: parking_lot::Mutex::new(Some(peer)),
        })
    }

    /// Limit for [`connect`](Self::connect), TLS handshake included.
    /// Defaults to [`CONNECT_TIMEOUT`].
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve, connect and run the TLS handshake when enabled, all within
    /// the connect timeout. A no-op on a connected socket.
    pub async fn connect(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }
        // lock order is writer then reader, as in `close`
        let mut reader = self.reader.lock().await;

        let target = format!("{}:{}", self.host, self.port);
        let connect = async {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
                .await
                .map_err(|e| CastError::Resolve(format!("{}: {e}", self.host)))?
                .collect();
            if addrs.is_empty() {
                return Err(CastError::Resolve(self.host.clone()));
            }

            let mut last_error = None;
            let mut connected = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        connected = Some((stream, addr));
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%addr, error = %e, "connect attempt failed");
                        last_error = Some(e);
                    }
                }
            }
            let Some((stream, addr)) = connected else {
                return Err(last_error
                    .map(CastError::Io)
                    .unwrap_or_else(|| CastError::Resolve(self.host.clone())));
            };
            stream.set_nodelay(true)?;

            let stream: BoxedStream = if self.tls {
                Box::new(tls::upgrade(stream, &self.host).await?)
            } else {
                Box::new(stream)
            };
            Ok((stream, addr))
        };

        let (stream, addr) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| CastError::ConnectTimeout {
                addr: target.clone(),
            })??;

        let (read, write) = tokio::io::split(stream);
        *reader = Some(BufReader::new(read));
        *writer = Some(write);
        *self.peer.lock() = Some(addr);
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(peer = %addr, tls = self.tls, "TCP connected");
        Ok(())
    }

    /// Write all parts back to back and flush, holding the write lock for
    /// the whole sequence.
    pub async fn write_and_flush(&self, parts: &[&[u8]]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CastError::NotConnected)?;
        let result = async {
            for part in parts {
                writer.write_all(part).await?;
            }
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    /// One line without its terminator, `None` at end of stream.
    pub async fn read_line(&self) -> Result<Option<String>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CastError::NotConnected)?;
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Fill `buf` completely.
    pub async fn read_bytes(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CastError::NotConnected)?;
        reader.read_exact(buf).await?;
        Ok(())
    }

    /// Next RTSP message, skipping interleaved frames. `None` at end of stream.
    pub async fn read_message(&self, limits: &MessageLimits) -> Result<Option<String>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CastError::NotConnected)?;
        interleaved::read_message(reader, limits).await
    }

    /// Shut the connection down. Safe to call more than once.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
            tracing::debug!(remote = %self.remote(), "TCP closed");
        }
        // A reader blocked in read_message keeps its lock until the peer
        // answers the shutdown, so do not wait for it.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    /// `host:port` as configured.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("remote", &self.remote())
            .field("tls", &self.tls)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (Arc<TcpSocket>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = Arc::new(TcpSocket::new("127.0.0.1", port, false));
        let (connected, accepted) = tokio::join!(client.connect(), listener.accept());
        connected.unwrap();
        (client, accepted.unwrap().0)
    }

    #[tokio::test]
    async fn write_before_connect_fails() {
        let socket = TcpSocket::new("127.0.0.1", 1, false);
        assert!(matches!(
            socket.write_and_flush(&[b"x"]).await,
            Err(CastError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn line_and_bytes_roundtrip() {
        let (client, mut server) = pair().await;
        server.write_all(b"RTSP/1.0 200 OK\r\nabcd").await.unwrap();
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("RTSP/1.0 200 OK"));
        let mut buf = [0u8; 4];
        client.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        client.write_and_flush(&[b"hello ", b"world"]).await.unwrap();
        let mut got = [0u8; 11];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");
    }

    #[tokio::test]
    async fn concurrent_writes_stay_contiguous() {
        let (client, mut server) = pair().await;
        let mut tasks = Vec::new();
        for id in 0..8u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let head = [b'$', id, 0, 64];
                let body = [id; 64];
                client.write_and_flush(&[&head, &body]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut wire = vec![0u8; 8 * 68];
        server.read_exact(&mut wire).await.unwrap();
        for frame in wire.chunks(68) {
            assert_eq!(frame[0], b'$');
            assert!(frame[4..].iter().all(|&b| b == frame[1]));
        }
    }

    #[tokio::test]
    async fn stalled_tls_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // accept and never answer the ClientHello
        let peer = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

        let socket = TcpSocket::new("localhost", port, true)
            .with_connect_timeout(Duration::from_millis(300));
        let result = tokio::time::timeout(Duration::from_secs(3), socket.connect())
            .await
            .expect("connect ignored its timeout");
        assert!(matches!(result, Err(CastError::ConnectTimeout { .. })), "{result:?}");
        assert!(!socket.is_connected());
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn connect_on_connected_socket_does_not_wait_for_reader() {
        let (client, _server) = pair().await;
        let reading = {
            let client = client.clone();
            tokio::spawn(async move { client.read_line().await })
        };
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(1), client.connect())
            .await
            .expect("connect blocked behind a pending read")
            .unwrap();
        client.write_and_flush(&[b"x"]).await.unwrap();
        reading.abort();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = pair().await;
        assert!(client.is_connected());
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
        assert!(client.write_and_flush(&[b"x"]).await.is_err());
    }
}
