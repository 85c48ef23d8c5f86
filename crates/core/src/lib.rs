//! Screen capture streaming engine.
//!
//! Frames come from a [`capture::FrameSource`], pass through the capture
//! pipeline and leave either as MJPEG over HTTP ([`mjpeg`]) or as RTP over
//! RTSP ([`rtsp`], server or client mode). [`module`] runs one such
//! session at a time and makes start, stop and restart safe.

pub mod capture;
pub mod config;
pub mod error;
pub mod media;
pub mod mjpeg;
pub mod module;
pub mod protocol;
pub mod report;
pub mod rtsp;
pub mod transport;

pub use error::{CastError, Result};
pub use media::Packetizer;
