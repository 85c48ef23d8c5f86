//! MJPEG over HTTP for browsers.
//!
//! | Path | Response |
//! |------|----------|
//! | `/` | index page, or the PIN page until the address is authorized |
//! | `/favicon.ico` | PNG icon |
//! | `/pinrequest?pin=` | PIN check; 403 once the address is blocked |
//! | stream path | `multipart/x-mixed-replace` JPEG stream |
//! | stream path with `.jpeg` | latest single frame |
//! | anything else | 301 to `http://{Host}/` |

pub mod clients;
pub mod http;
pub mod pages;
pub mod pin;
pub mod server;

use std::net::IpAddr;

pub use clients::{ClientRegistry, ClientStats, FrameBuffer};
pub use pin::{PinCheck, PinGuard};
pub use server::{MjpegServer, MjpegServerConfig, ServerState};

/// Frames a viewer may have queued before the oldest is dropped.
pub const CLIENT_BUFFER_FRAMES: usize = 2;

const EVENT_CAPACITY: usize = 32;

/// Published to subscribers of [`MjpegServer::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Number of open streams after a viewer connected or left.
    ClientCount(usize),
    AddressBlocked(IpAddr),
}
