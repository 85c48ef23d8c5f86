//! Error types for the screen streaming engine.

use std::fmt;

/// Errors that can occur anywhere in the capture-to-network pipeline.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse), [`Url`](Self::Url): malformed RTSP/HTTP text.
/// - **Transport**: [`Io`](Self::Io), [`ConnectTimeout`](Self::ConnectTimeout),
///   [`Resolve`](Self::Resolve), [`Tls`](Self::Tls), [`NotConnected`](Self::NotConnected).
/// - **RTSP client**: [`NoCredentials`](Self::NoCredentials),
///   [`AuthFailed`](Self::AuthFailed), [`AccessDenied`](Self::AccessDenied),
///   [`ClientFailed`](Self::ClientFailed).
/// - **Server**: [`AddressInUse`](Self::AddressInUse),
///   [`AddressNotFound`](Self::AddressNotFound), [`PinMismatch`](Self::PinMismatch).
/// - **Capture**: [`CaptureSecurity`](Self::CaptureSecurity),
///   [`UnsupportedImageFormat`](Self::UnsupportedImageFormat), [`Encode`](Self::Encode).
/// - **Lifecycle**: [`InvalidState`](Self::InvalidState),
///   [`TaskFailed`](Self::TaskFailed), [`ChannelClosed`](Self::ChannelClosed).
///
/// See [`crate::report::ErrorClass`] for how each variant is classified.
#[derive(Debug, thiserror::Error)]
pub enum CastError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP or HTTP message.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// An `rtsp://` / `rtsps://` endpoint could not be parsed.
    #[error("invalid URL {url}: {reason}")]
    Url { url: String, reason: String },

    /// TCP connect did not complete within the connect timeout.
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// Host name resolution returned no usable address.
    #[error("cannot resolve host: {0}")]
    Resolve(String),

    /// TLS handshake or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A socket operation was attempted before `connect()` or after `close()`.
    #[error("socket not connected")]
    NotConnected,

    /// Remote RTSP server demanded credentials but the URL carried none.
    #[error("server requires credentials")]
    NoCredentials,

    /// Credentials were rejected after a 401 retry.
    #[error("authentication failed")]
    AuthFailed,

    /// Remote RTSP server answered 403.
    #[error("access denied")]
    AccessDenied,

    /// Any other RTSP client handshake or streaming failure.
    #[error("RTSP client failure: {0}")]
    ClientFailed(String),

    /// No response to an RTSP request within the response timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The server listening port is already bound.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// No local interface address could be resolved for the server.
    #[error("no usable network address")]
    AddressNotFound,

    /// A viewer supplied the wrong PIN.
    #[error("PIN mismatch")]
    PinMismatch,

    /// The capture grant was revoked or rejected by the platform.
    #[error("capture security failure: {0}")]
    CaptureSecurity(String),

    /// The capture backend produced a pixel layout the processor cannot read.
    #[error("unsupported capture image format: {0}")]
    UnsupportedImageFormat(String),

    /// JPEG or PNG encoding failed.
    #[error("image encode failed: {0}")]
    Encode(String),

    /// A setting was outside its permitted range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was called in a state where its contract forbids it.
    #[error("{component}: {operation} not allowed in state {state}")]
    InvalidState {
        component: &'static str,
        operation: &'static str,
        state: String,
    },

    /// A background task panicked or returned without classification.
    #[error("task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    /// The peer end of an internal channel went away.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl CastError {
    pub(crate) fn invalid_state(
        component: &'static str,
        operation: &'static str,
        state: impl fmt::Debug,
    ) -> Self {
        Self::InvalidState {
            component,
            operation,
            state: format!("{:?}", state),
        }
    }
}

impl From<image::ImageError> for CastError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => Self::UnsupportedImageFormat(e.to_string()),
            other => Self::Encode(other.to_string()),
        }
    }
}

/// Specific kind of parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyRequest,
    /// Start line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Text` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// Header block exceeded the configured limit.
    HeaderTooLarge,
    /// Declared `Content-Length` exceeded the configured limit.
    BodyTooLarge,
    /// RTP packet shorter than its fixed header or with the wrong version.
    InvalidRtp,
    /// Stream ended in the middle of a message.
    Incomplete,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::HeaderTooLarge => write!(f, "header too large"),
            Self::BodyTooLarge => write!(f, "body too large"),
            Self::InvalidRtp => write!(f, "invalid RTP packet"),
            Self::Incomplete => write!(f, "truncated message"),
        }
    }
}

/// Convenience alias for `Result<T, CastError>`.
pub type Result<T> = std::result::Result<T, CastError>;
