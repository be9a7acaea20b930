//! Logical broker session and its transitions.
//!
//! ```text
//!               begin_connect            connected
//! Disconnected ───────────────► Connecting ─────────► Connected
//!      ▲  ▲                         │                    │
//!      │  └──── connect_failed ─────┘                    │
//!      └──────────────────── link_lost ──────────────────┘
//!
//!  any ── begin_disconnect ──► Disconnecting ── disconnected ──► Disconnected
//! ```
//!
//! The session never touches the output line; only accepted commands do.

use super::backoff::Backoff;
use std::fmt;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid session transition '{transition}' from state {from}")]
pub struct TransitionError {
    pub from: SessionState,
    pub transition: &'static str,
}

#[derive(Clone, Debug, Default)]
pub struct Session {
    state: SessionState,
    retry_count: u32,
    next_backoff: Duration,
    subscribed: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delay to wait in `Disconnected` before the next attempt
    pub fn next_backoff(&self) -> Duration {
        self.next_backoff
    }

    /// Connected and the command subscription has been acknowledged
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Connected && self.subscribed
    }

    pub fn begin_connect(&mut self) -> Result<(), TransitionError> {
        self.require(SessionState::Disconnected, "begin_connect")?;
        self.move_to(SessionState::Connecting);
        Ok(())
    }

    pub fn connected(&mut self) -> Result<(), TransitionError> {
        self.require(SessionState::Connecting, "connected")?;
        self.retry_count = 0;
        self.next_backoff = Duration::ZERO;
        self.subscribed = false;
        self.move_to(SessionState::Connected);
        Ok(())
    }

    pub fn subscription_acknowledged(&mut self) -> Result<(), TransitionError> {
        self.require(SessionState::Connected, "subscription_acknowledged")?;
        self.subscribed = true;
        Ok(())
    }

    /// Failed attempt: the delay is computed from the count before it grows,
    /// so consecutive failures wait base, 2*base, 4*base...
    pub fn connect_failed(&mut self, policy: &Backoff) -> Result<(), TransitionError> {
        self.require(SessionState::Connecting, "connect_failed")?;
        self.next_backoff = policy.delay(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        self.move_to(SessionState::Disconnected);
        Ok(())
    }

    pub fn link_lost(&mut self, policy: &Backoff) -> Result<(), TransitionError> {
        self.require(SessionState::Connected, "link_lost")?;
        self.subscribed = false;
        self.next_backoff = policy.delay(self.retry_count);
        self.move_to(SessionState::Disconnected);
        Ok(())
    }

    /// Returns the state the session was in, so the caller knows whether a
    /// transport is open that needs a graceful goodbye.
    pub fn begin_disconnect(&mut self) -> Result<SessionState, TransitionError> {
        let previous = self.state;
        if previous == SessionState::Disconnecting {
            return Err(TransitionError {
                from: previous,
                transition: "begin_disconnect",
            });
        }
        self.move_to(SessionState::Disconnecting);
        Ok(previous)
    }

    pub fn disconnected(&mut self) -> Result<(), TransitionError> {
        self.require(SessionState::Disconnecting, "disconnected")?;
        self.subscribed = false;
        self.move_to(SessionState::Disconnected);
        Ok(())
    }

    fn require(&self, state: SessionState, transition: &'static str) -> Result<(), TransitionError> {
        if self.state == state {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state,
                transition,
            })
        }
    }

    fn move_to(&mut self, state: SessionState) {
        debug!("Session {} -> {}", self.state, state);
        self.state = state;
    }
}
