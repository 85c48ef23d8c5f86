//! RTSP signaling (RFC 2326) and SDP generation.
//!
//! This module is the text side of the streaming engine: parsing and
//! building RTSP requests and responses, the `Transport` header, endpoint
//! URLs, client authentication and the session description.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! ANNOUNCE rtsp://server:554/live RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Content-Type: application/sdp\r\n
//! Content-Length: 312\r\n
//! \r\n
//! v=0\r\n...
//! ```
//!
//! ## Methods
//!
//! | Method | RFC section | Used by |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | client, server |
//! | DESCRIBE | §10.2 | server |
//! | ANNOUNCE | §10.3 | client (publish) |
//! | SETUP | §10.4 | client, server |
//! | PLAY | §10.5 | server |
//! | PAUSE | §10.6 | server |
//! | TEARDOWN | §10.7 | client, server |
//! | GET_PARAMETER | §10.8 | keep-alive, both sides |
//! | RECORD | §10.11 | client (publish) |

pub mod auth;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport_header;
pub mod url;

pub use auth::{Authenticator, Credentials, DigestChallenge};
pub use request::RtspRequest;
pub use response::RtspResponse;
pub use transport_header::TransportHeader;
pub use url::RtspUrl;
