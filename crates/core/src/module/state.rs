use std::fmt;

use rand::RngExt;

/// Single-use tag tying a start request to the host's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StartToken(u64);

impl StartToken {
    pub fn generate() -> Self {
        Self(rand::rng().random::<u64>())
    }
}

impl fmt::Display for StartToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Observable lifecycle state, without the running handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Initiated,
    PendingStart(StartToken),
    Running,
    PendingStop,
}

enum State<H> {
    Initiated,
    PendingStart(StartToken),
    Running(H),
    PendingStop,
}

/// What [`SessionStateMachine::begin_stop`] asks the caller to do.
pub enum StopAction<H> {
    /// Tear `H` down, then call [`SessionStateMachine::finish_stop`].
    Teardown(H),
    /// A pending start was discarded; already back in `Initiated`.
    Discarded(StartToken),
    Ignored,
}

/// Lifecycle of the one session a module may run.
///
/// ```text
///  Initiated ──begin_start──▶ PendingStart(token)
///      ▲                          │ accept_start(token) + set_running
///      │                          ▼
///  finish_stop ◀── PendingStop ◀── Running(handle)
/// ```
///
/// Transitions take `&mut self`; the owner serializes calls.
pub struct SessionStateMachine<H> {
    state: State<H>,
}

impl<H> Default for SessionStateMachine<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionStateMachine<H> {
    pub fn new() -> Self {
        Self {
            state: State::Initiated,
        }
    }

    pub fn state(&self) -> ModuleState {
        match &self.state {
            State::Initiated => ModuleState::Initiated,
            State::PendingStart(token) => ModuleState::PendingStart(*token),
            State::Running(_) => ModuleState::Running,
            State::PendingStop => ModuleState::PendingStop,
        }
    }

    /// From `Initiated`, issue a fresh token and move to `PendingStart`.
    /// Anywhere else this is a logged no-op returning `None`.
    pub fn begin_start(&mut self) -> Option<StartToken> {
        if !matches!(self.state, State::Initiated) {
            tracing::debug!(state = ?self.state(), "start ignored");
            return None;
        }
        let token = StartToken::generate();
        self.state = State::PendingStart(token);
        tracing::debug!(%token, "Initiated -> PendingStart");
        Some(token)
    }

    /// Undo [`begin_start`](Self::begin_start) after the host refused.
    pub fn abort_start(&mut self, token: StartToken) {
        if matches!(self.state, State::PendingStart(t) if t == token) {
            self.state = State::Initiated;
            tracing::debug!(%token, "PendingStart -> Initiated (start aborted)");
        }
    }

    /// Whether `token` is the outstanding one. A stale or duplicate token
    /// leaves the state untouched.
    pub fn accept_start(&self, token: StartToken) -> bool {
        match &self.state {
            State::PendingStart(pending) if *pending == token => true,
            State::PendingStart(pending) => {
                tracing::warn!(%token, pending = %pending, "stale start token ignored");
                false
            }
            _ => {
                tracing::warn!(%token, state = ?self.state(), "unexpected service start ignored");
                false
            }
        }
    }

    /// `PendingStart(token)` -> `Running(handle)`. Hands `handle` back when
    /// the token no longer matches.
    pub fn set_running(&mut self, token: StartToken, handle: H) -> Result<(), H> {
        if !self.accept_start(token) {
            return Err(handle);
        }
        self.state = State::Running(handle);
        tracing::debug!(%token, "PendingStart -> Running");
        Ok(())
    }

    pub fn begin_stop(&mut self) -> StopAction<H> {
        match std::mem::replace(&mut self.state, State::PendingStop) {
            State::Running(handle) => {
                tracing::debug!("Running -> PendingStop");
                StopAction::Teardown(handle)
            }
            State::PendingStart(token) => {
                self.state = State::Initiated;
                tracing::debug!(%token, "PendingStart -> Initiated (start discarded)");
                StopAction::Discarded(token)
            }
            other => {
                self.state = other;
                tracing::debug!(state = ?self.state(), "stop ignored");
                StopAction::Ignored
            }
        }
    }

    pub fn finish_stop(&mut self) {
        if matches!(self.state, State::PendingStop) {
            self.state = State::Initiated;
            tracing::debug!("PendingStop -> Initiated");
        }
    }

    pub fn running_mut(&mut self) -> Option<&mut H> {
        match &mut self.state {
            State::Running(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_start_yields_one_pending_token() {
        let mut sm = SessionStateMachine::<&str>::new();
        let token = sm.begin_start().unwrap();
        assert!(sm.begin_start().is_none());
        assert_eq!(sm.state(), ModuleState::PendingStart(token));

        assert!(sm.set_running(token, "session").is_ok());
        assert!(sm.begin_start().is_none());
        assert_eq!(sm.state(), ModuleState::Running);
    }

    #[test]
    fn stale_token_never_transitions() {
        let mut sm = SessionStateMachine::<u8>::new();
        let first = sm.begin_start().unwrap();
        sm.abort_start(first);
        let second = sm.begin_start().unwrap();
        assert_ne!(first, second);

        assert_eq!(sm.set_running(first, 1), Err(1));
        assert_eq!(sm.state(), ModuleState::PendingStart(second));
        // aborting with the stale token does nothing either
        sm.abort_start(first);
        assert_eq!(sm.state(), ModuleState::PendingStart(second));
    }

    #[test]
    fn stop_paths() {
        let mut sm = SessionStateMachine::<u8>::new();
        assert!(matches!(sm.begin_stop(), StopAction::Ignored));
        assert_eq!(sm.state(), ModuleState::Initiated);

        let token = sm.begin_start().unwrap();
        assert!(matches!(sm.begin_stop(), StopAction::Discarded(t) if t == token));
        assert_eq!(sm.state(), ModuleState::Initiated);
        assert!(!sm.accept_start(token));

        let token = sm.begin_start().unwrap();
        sm.set_running(token, 7).unwrap();
        assert_eq!(sm.running_mut(), Some(&mut 7));
        assert!(matches!(sm.begin_stop(), StopAction::Teardown(7)));
        assert_eq!(sm.state(), ModuleState::PendingStop);
        assert!(matches!(sm.begin_stop(), StopAction::Ignored));
        assert!(sm.begin_start().is_none());
        sm.finish_stop();
        assert_eq!(sm.state(), ModuleState::Initiated);
    }

    #[test]
    fn token_renders_as_hex() {
        let token = StartToken(0xAB);
        assert_eq!(token.to_string(), "00000000000000AB");
    }
}
