//! Byte-level network transport for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): the RTSP control connection, optionally upgraded to
//!   TLS ([`tls`]) right after connect. Reads and writes are each serialized
//!   through a per-socket mutex, so interleaved RTP frames written by
//!   concurrent tasks never mix their bytes.
//!
//! - **UDP** ([`udp`]): fire-and-forget RTP datagrams. A connected socket
//!   per track in client mode, one shared ephemeral socket in server mode.
//!
//! - **Interleaved** ([`interleaved`]): RTP multiplexed onto the RTSP TCP
//!   connection with `$` framing (RFC 2326 §10.12).

pub mod interleaved;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::RtpPacket;

pub use tcp::TcpSocket;
pub use udp::{UdpSocket, UdpTransport};

/// Upper bound for establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How RTP travels to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Interleaved on the RTSP connection.
    #[default]
    Tcp,
    Udp,
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unknown RTP protocol: {other}")),
        }
    }
}

/// Destination of one track's RTP packets.
#[derive(Clone)]
pub enum RtpOutput {
    Udp(Arc<UdpSocket>),
    Interleaved { socket: Arc<TcpSocket>, channel: u8 },
}

impl RtpOutput {
    /// Send one packet. Returns the number of bytes put on the wire.
    pub async fn send(&self, packet: &RtpPacket) -> Result<usize> {
        let bytes = packet.to_bytes();
        match self {
            Self::Udp(socket) => socket.write(&bytes).await,
            Self::Interleaved { socket, channel } => {
                let header = interleaved::frame_header(*channel, bytes.len())?;
                socket.write_and_flush(&[&header, &bytes]).await?;
                Ok(header.len() + bytes.len())
            }
        }
    }
}

impl std::fmt::Debug for RtpOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp(socket) => write!(f, "Udp({})", socket.remote()),
            Self::Interleaved { channel, .. } => write!(f, "Interleaved({channel})"),
        }
    }
}
