//! Error classification and reporting.
//!
//! Every failure that leaves a pipeline stage is funneled through
//! [`ErrorReporter::report`], which classifies it and decides whether the
//! running session has to be torn down:
//!
//! | Class | Examples | Disposition |
//! |-------|----------|-------------|
//! | Fixable | port in use, capture grant revoked, PIN mismatch | report, offer retry |
//! | Fatal | unsupported image format, task panic | stop session, offer exit |
//! | Connection | RTSP connect/auth failure | report; stop only while streaming |

use tokio::sync::watch;

use crate::error::CastError;

/// Sub-kind of a connection-level failure in RTSP client mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    PermissionDenied,
    AccessDenied,
    NoCredentials,
    AuthError,
    Failed,
}

/// Classification of a [`CastError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recoverable without restarting the host application.
    Fixable,
    /// The pipeline cannot continue.
    Fatal,
    /// Transport failure in RTSP client mode.
    Connection(ConnectionFailure),
}

/// Action offered to the user alongside a persistent error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Retry,
    Exit,
}

/// What the caller should do after reporting an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    StopSession,
    ReportOnly,
}

/// An error as surfaced to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub class: ErrorClass,
    pub message: String,
    pub action: UserAction,
}

impl CastError {
    /// Classify this error into the Fixable / Fatal / Connection taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AddressInUse(_)
            | Self::AddressNotFound
            | Self::PinMismatch
            | Self::CaptureSecurity(_)
            | Self::InvalidParameter(_)
            | Self::Config(_) => ErrorClass::Fixable,

            Self::UnsupportedImageFormat(_)
            | Self::Encode(_)
            | Self::TaskFailed { .. }
            | Self::InvalidState { .. }
            | Self::ChannelClosed(_) => ErrorClass::Fatal,

            Self::NoCredentials => ErrorClass::Connection(ConnectionFailure::NoCredentials),
            Self::AuthFailed => ErrorClass::Connection(ConnectionFailure::AuthError),
            Self::AccessDenied => ErrorClass::Connection(ConnectionFailure::AccessDenied),
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorClass::Connection(ConnectionFailure::PermissionDenied)
            }
            Self::Io(_)
            | Self::Parse { .. }
            | Self::Url { .. }
            | Self::ConnectTimeout { .. }
            | Self::Resolve(_)
            | Self::Tls(_)
            | Self::NotConnected
            | Self::ClientFailed(_)
            | Self::Timeout(_) => ErrorClass::Connection(ConnectionFailure::Failed),
        }
    }
}

/// Classifies errors, keeps the current persistent error, and tells the
/// caller whether the session must stop.
#[derive(Debug)]
pub struct ErrorReporter {
    current: watch::Sender<Option<ReportedError>>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    /// Subscribe to changes of the persistent error state.
    pub fn subscribe(&self) -> watch::Receiver<Option<ReportedError>> {
        self.current.subscribe()
    }

    /// Currently surfaced error, if any.
    pub fn current(&self) -> Option<ReportedError> {
        self.current.borrow().clone()
    }

    /// Classify `error`, publish it, and decide its disposition.
    ///
    /// `streaming` is whether media is actively flowing; connection-level
    /// failures only stop the session in that case.
    pub fn report(&self, error: &CastError, streaming: bool) -> Disposition {
        let class = error.class();
        let (action, disposition) = match class {
            ErrorClass::Fatal => (UserAction::Exit, Disposition::StopSession),
            ErrorClass::Fixable => (UserAction::Retry, Disposition::ReportOnly),
            ErrorClass::Connection(_) if streaming => (UserAction::Retry, Disposition::StopSession),
            ErrorClass::Connection(_) => (UserAction::Retry, Disposition::ReportOnly),
        };

        match class {
            ErrorClass::Fatal => tracing::error!(error = %error, "fatal error"),
            ErrorClass::Fixable => tracing::warn!(error = %error, "fixable error"),
            ErrorClass::Connection(kind) => {
                tracing::warn!(error = %error, ?kind, streaming, "connection error")
            }
        }

        self.current.send_replace(Some(ReportedError {
            class,
            message: error.to_string(),
            action,
        }));
        disposition
    }

    /// Clear the persistent error (after a successful retry).
    pub fn clear(&self) {
        if self.current.send_replace(None).is_some() {
            tracing::debug!("error state cleared");
        }
    }
}
