//! RTSP in both directions.
//!
//! - [`client`]: publish mode. ANNOUNCE the stream to a remote server and
//!   RECORD into it over UDP or interleaved TCP, optionally over TLS.
//! - [`server`]: pull mode. Players DESCRIBE, SETUP and PLAY the local
//!   stream; one fan-out task packetizes each frame once for everyone.

pub mod client;
pub mod handler;
pub mod server;
pub mod session;

pub use client::{ClientEvent, MediaReceiver, MediaSender, QueueItem, RtspClient, media_queue};
pub use handler::MethodHandler;
pub use server::{RtspServer, RtspServerConfig, ServerContext, StreamDescription};
pub use session::{Session, SessionManager, SessionState, TrackDelivery, Viewer};
