use std::net::SocketAddr;

use tokio::sync::Mutex;

use crate::error::{CastError, Result};

/// One track's connected RTP (or RTCP) datagram socket in client mode.
///
/// [`connect`](Self::connect) resolves the remote host once and binds the
/// local port. Sends are fire-and-forget; loss is the caller's concern.
#[derive(Debug)]
pub struct UdpSocket {
    remote_host: String,
    remote_port: u16,
    local_port: u16,
    inner: Mutex<Option<(tokio::net::UdpSocket, SocketAddr)>>,
}

impl UdpSocket {
    /// `local_port == 0` binds an ephemeral port.
    pub fn new(remote_host: &str, remote_port: u16, local_port: u16) -> Self {
        Self {
            remote_host: remote_host.to_string(),
            remote_port,
            local_port,
            inner: Mutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }

        let remote = tokio::net::lookup_host((self.remote_host.as_str(), self.remote_port))
            .await
            .map_err(|e| CastError::Resolve(format!("{}: {e}", self.remote_host)))?
            .next()
            .ok_or_else(|| CastError::Resolve(self.remote_host.clone()))?;

        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], self.local_port).into()
        } else {
            ([0u16; 8], self.local_port).into()
        };
        let socket = tokio::net::UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        tracing::debug!(%remote, local = ?socket.local_addr().ok(), "UDP connected");
        *inner = Some((socket, remote));
        Ok(())
    }

    /// Send one datagram.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize> {
        let inner = self.inner.lock().await;
        let (socket, _) = inner.as_ref().ok_or(CastError::NotConnected)?;
        Ok(socket.send(bytes).await?)
    }

    pub async fn local_port(&self) -> Option<u16> {
        let inner = self.inner.lock().await;
        inner.as_ref().and_then(|(s, _)| s.local_addr().ok()).map(|a| a.port())
    }

    pub async fn close(&self) {
        self.inner.lock().await.take();
    }

    /// `host:port` of the receiver.
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Shared outbound RTP socket for server mode.
///
/// Address-only: it knows nothing about sessions. The RTSP server resolves
/// each playing session to a client address and calls [`send_to`](Self::send_to).
#[derive(Debug)]
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral socket for outbound RTP.
    pub async fn bind() -> Result<Self> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        tracing::debug!(local = ?socket.local_addr().ok(), "RTP send socket bound");
        Ok(Self { socket })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|a| a.port())
    }

    pub async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr).await?)
    }
}

/// Reserve an even/odd pair of free UDP ports for RTP and RTCP
/// (RFC 3550 §11).
pub fn even_port_pair() -> Result<(u16, u16)> {
    for _ in 0..32 {
        let reserved = std::net::UdpSocket::bind("0.0.0.0:0")?;
        let port = reserved.local_addr()?.port();
        let even = port & !1;
        drop(reserved);
        if even == 0 {
            continue;
        }
        let rtp = std::net::UdpSocket::bind(("0.0.0.0", even));
        let rtcp = std::net::UdpSocket::bind(("0.0.0.0", even + 1));
        if rtp.is_ok() && rtcp.is_ok() {
            return Ok((even, even + 1));
        }
    }
    Err(CastError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "no free even/odd UDP port pair",
    )))
}
