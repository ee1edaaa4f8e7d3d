//! Host session lifecycle.

use std::fmt;

use log::trace;

use crate::error::{Error, Result};

/// Where a host session stands.
///
/// ```text
/// Idle -> AwaitHandshake -> NegotiateSize -> Transfer -> Complete
///                    \             \             \
///                     +-------------+-------------+--> Aborted
/// ```
///
/// Commands without a size exchange go straight from `AwaitHandshake` to
/// `Transfer`; the signature command completes right after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No session running.
    Idle,
    /// Signature requested, waiting for the reply.
    AwaitHandshake,
    /// Size sent, waiting for the echo.
    NegotiateSize,
    /// Payload moving.
    Transfer,
    /// Every checkpoint acknowledged.
    Complete,
    /// Stopped on an error.
    Aborted,
}

impl SessionState {
    /// `Complete` or `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: Self) -> bool {
        use SessionState::{AwaitHandshake, Complete, Idle, NegotiateSize, Transfer};
        match (self, next) {
            (Idle, AwaitHandshake)
            | (AwaitHandshake, NegotiateSize | Transfer | Complete)
            | (NegotiateSize, Transfer)
            | (Transfer, Complete) => true,
            (from, Self::Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitHandshake => "awaiting handshake",
            Self::NegotiateSize => "negotiating size",
            Self::Transfer => "transferring",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Tracks one session at a time and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    aborted_in: Option<SessionState>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            aborted_in: None,
        }
    }
}

impl Session {
    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// State the last session was in when it aborted.
    pub fn aborted_in(&self) -> Option<SessionState> {
        self.aborted_in
    }

    /// Start a new session. A finished session is reset to `Idle` first.
    pub fn begin(&mut self) -> Result<()> {
        if self
            .state
            .is_terminal()
        {
            self.state = SessionState::Idle;
            self.aborted_in = None;
        }
        self.advance(SessionState::AwaitHandshake)
    }

    /// Move to `next`.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self
            .state
            .can_advance_to(next)
        {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        trace!("Session: {} -> {}", self.state, next);
        if next == SessionState::Aborted {
            self.aborted_in = Some(self.state);
        }
        self.state = next;
        Ok(())
    }

    /// Abort from any non-terminal state; no-op once terminal.
    pub fn abort(&mut self) {
        if !self
            .state
            .is_terminal()
        {
            self.aborted_in = Some(self.state);
            trace!("Session: {} -> aborted", self.state);
            self.state = SessionState::Aborted;
        }
    }
}
