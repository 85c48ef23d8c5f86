//! Module lifecycle: safe start, stop and restart of one streaming session.
//!
//! A [`ModuleController`] owns the [`SessionStateMachine`] and processes
//! commands from a single queue, so transitions never interleave. Clients
//! talk to it through a cloneable [`ModuleHandle`].
//!
//! Starting is a two-step handshake with the host environment:
//!
//! 1. `start_module` issues a [`StartToken`] and calls
//!    [`ServiceHost::request_start`].
//! 2. The host later calls `on_service_start(token)`. Only the latest token
//!    is honored; the session is then built by the [`SessionFactory`] and
//!    started inside a fresh [`TaskScope`].
//!
//! `stop_module` cancels that scope and waits for every task in it.

pub mod controller;
pub mod mjpeg;
pub mod rtsp;
pub mod scope;
pub mod state;

use std::fmt;

use async_trait::async_trait;

use crate::capture::{AnnexBFileSource, FrameSource};
use crate::error::Result;

pub use controller::{LoopbackHost, ModuleController, ModuleHandle};
pub use mjpeg::{MjpegSession, MjpegSessionFactory};
pub use rtsp::{
    RtspClientSession, RtspClientSessionFactory, RtspServerSession, RtspServerSessionFactory,
};
pub use scope::TaskScope;
pub use state::{ModuleState, SessionStateMachine, StartToken, StopAction};

/// Permission to capture, as handed over by the host.
pub enum CaptureGrant {
    /// Raw screen frames for MJPEG.
    Screen(Box<dyn FrameSource>),
    /// Encoded H.264 access units for RTSP.
    Encoded(AnnexBFileSource),
}

impl fmt::Debug for CaptureGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Screen(source) => f.debug_tuple("Screen").field(&source.size()).finish(),
            Self::Encoded(source) => f.debug_tuple("Encoded").field(&source.len()).finish(),
        }
    }
}

/// Events delivered to a running session.
#[derive(Debug)]
pub enum ModuleEvent {
    StartProjection(CaptureGrant),
    /// Stop capture but keep servers up.
    StopStream(String),
    /// Restart the session's servers and clear the reported error.
    RecoverError,
    CastPermissionsDenied,
}

/// The environment that brings a session online, e.g. a foreground
/// service. It must answer a successful `request_start` by calling
/// [`ModuleHandle::on_service_start`] with the same token.
pub trait ServiceHost: Send + Sync + 'static {
    fn request_start(&self, token: StartToken, module: ModuleHandle) -> Result<()>;
}

/// Body of a running module.
#[async_trait]
pub trait Session: Send {
    /// Bring servers up. Tasks go into `scope`.
    async fn start(&mut self, scope: &TaskScope) -> Result<()>;

    async fn handle_event(&mut self, event: ModuleEvent, scope: &TaskScope) -> Result<()>;

    /// Whether media is flowing to at least one peer or server.
    fn is_streaming(&self) -> bool;

    /// Release everything not owned by the scope. The scope is shut down
    /// right after this returns.
    async fn stop(&mut self);
}

pub trait SessionFactory: Send + 'static {
    fn create(&self) -> Box<dyn Session>;
}
