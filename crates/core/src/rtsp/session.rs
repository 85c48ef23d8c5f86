//! Server-side RTSP sessions (RFC 2326 §3, §12.37).
//!
//! A session is created by the first SETUP and may gather one delivery
//! per track (a second SETUP carries the `Session` header). It is removed
//! by TEARDOWN, by its TCP connection closing, or by the idle reaper.
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (removed)
//! TCP disconnect -> (removed)
//! idle timeout   -> (removed)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::media::TrackKind;
use crate::transport::TcpSocket;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Playing,
    Paused,
}

/// Where one track's RTP goes for one session.
#[derive(Debug, Clone)]
pub enum TrackDelivery {
    Udp { rtp: SocketAddr, rtcp: SocketAddr },
    Interleaved { socket: Arc<TcpSocket>, rtp_channel: u8, rtcp_channel: u8 },
}

impl TrackDelivery {
    pub fn is_interleaved(&self) -> bool {
        matches!(self, Self::Interleaved { .. })
    }
}

#[derive(Debug)]
pub struct Session {
    /// 16-char uppercase hex identifier.
    pub id: String,
    /// Aggregate URI the session was set up under.
    pub uri: String,
    pub timeout_secs: u64,
    state: RwLock<SessionState>,
    tracks: RwLock<HashMap<TrackKind, TrackDelivery>>,
    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(uri: &str, timeout_secs: u64) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self {
            id: format!("{id:016X}"),
            uri: uri.to_string(),
            timeout_secs,
            state: RwLock::new(SessionState::Ready),
            tracks: RwLock::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn set_track(&self, track: TrackKind, delivery: TrackDelivery) {
        tracing::debug!(
            session_id = %self.id,
            ?track,
            interleaved = delivery.is_interleaved(),
            "track configured"
        );
        self.tracks.write().insert(track, delivery);
    }

    pub fn track(&self, track: TrackKind) -> Option<TrackDelivery> {
        self.tracks.read().get(&track).cloned()
    }

    /// Tracks that have been set up, video first.
    pub fn track_kinds(&self) -> Vec<TrackKind> {
        let tracks = self.tracks.read();
        [TrackKind::Video, TrackKind::Audio]
            .into_iter()
            .filter(|k| tracks.contains_key(k))
            .collect()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(
            session_id = %self.id,
            old_state = ?*current,
            new_state = ?state,
            "state transition"
        );
        *current = state;
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    /// Record that the client sent a request on this session.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Idle past its timeout. Sessions delivering over their own TCP
    /// connection never expire this way; they end with the connection.
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.tracks.read().values().any(TrackDelivery::is_interleaved) {
            return false;
        }
        now.duration_since(*self.last_activity.lock()) > Duration::from_secs(self.timeout_secs)
    }

    /// `Session` header value, e.g. `"0000000000000001;timeout=60"`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// A client in PLAY state, as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    pub client_addr: String,
    pub interleaved: bool,
}

/// Registry of live sessions, shared by connection tasks, the fan-out
/// task and the reaper.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&self, uri: &str, timeout_secs: u64) -> Arc<Session> {
        let session = Arc::new(Session::new(uri, timeout_secs));
        let mut sessions = self.sessions.write();
        sessions.insert(session.id.clone(), session.clone());
        tracing::debug!(
            session_id = %session.id,
            uri,
            total_sessions = sessions.len(),
            "session created"
        );
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove the sessions owned by a closed connection.
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let removed = ids.iter().filter(|id| sessions.remove(*id).is_some()).count();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    /// Drop sessions idle past their timeout. Returns how many went.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, s| {
            let keep = !s.is_expired(now);
            if !keep {
                tracing::info!(session_id = %id, "session timed out");
            }
            keep
        });
        before - sessions.len()
    }

    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.get_playing_sessions()
            .iter()
            .filter_map(|session| {
                let delivery = session.track(TrackKind::Video)?;
                let (client_addr, interleaved) = match &delivery {
                    TrackDelivery::Udp { rtp, .. } => (rtp.to_string(), false),
                    TrackDelivery::Interleaved { socket, .. } => (
                        socket
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| socket.remote()),
                        true,
                    ),
                };
                Some(Viewer {
                    session_id: session.id.clone(),
                    uri: session.uri.clone(),
                    client_addr,
                    interleaved,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp(port: u16) -> TrackDelivery {
        TrackDelivery::Udp {
            rtp: ([127, 0, 0, 1], port).into(),
            rtcp: ([127, 0, 0, 1], port + 1).into(),
        }
    }

    #[test]
    fn ids_are_unique_hex() {
        let a = Session::new("rtsp://h/screen", 60);
        let b = Session::new("rtsp://h/screen", 60);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert!(a.session_header_value().ends_with(";timeout=60"));
    }

    #[test]
    fn playing_sessions_and_viewers() {
        let manager = SessionManager::new();
        let s = manager.create_session("rtsp://h/screen", 60);
        s.set_track(TrackKind::Video, udp(6000));
        assert!(manager.viewers().is_empty());
        s.set_state(SessionState::Playing);
        let viewers = manager.viewers();
        assert_eq!(viewers.len(), 1);
        assert_eq!(viewers[0].client_addr, "127.0.0.1:6000");
        assert_eq!(s.track_kinds(), vec![TrackKind::Video]);

        assert_eq!(manager.remove_sessions(&[s.id.clone(), "nope".into()]), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn idle_udp_sessions_expire() {
        let manager = SessionManager::new();
        let s = manager.create_session("rtsp://h/screen", 1);
        s.set_track(TrackKind::Video, udp(6000));
        assert_eq!(manager.reap_expired(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(2);
        assert!(s.is_expired(later));
        assert_eq!(manager.reap_expired(later), 1);
        assert!(manager.get_session(&s.id).is_none());
    }
}
