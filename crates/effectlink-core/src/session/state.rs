//! Session lifecycle states shared by both connection roles.
//!
//! ```text
//! Connecting ──► Authenticating ──► Ready ──► Closing ──► Closed
//!      │                │             ▲
//!      └────────────────┴─────────────┘   (no password: straight to Ready)
//! ```
//!
//! `Closed` is terminal.  The current state lives in an atomic cell so the
//! read loop, dispatcher tasks and managers can all consult it without a
//! lock; transitions use compare-and-set so two racing closers cannot both
//! win.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Authenticating = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Authenticating,
            2 => SessionState::Ready,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Returns `true` once the session is shutting down or gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Atomic holder for a [`SessionState`].
#[derive(Debug)]
pub struct StateCell {
    inner: AtomicU8,
}

impl StateCell {
    pub fn new(initial: SessionState) -> Self {
        Self {
            inner: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to` if the cell still holds `from`.
    ///
    /// Returns `false` if another task changed the state first.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `to` from any non-terminal state.
    ///
    /// Returns the previous state, or `None` if the session was already
    /// closing or closed (the state is left unchanged).
    pub fn advance(&self, to: SessionState) -> Option<SessionState> {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            let state = SessionState::from_u8(current);
            if state.is_terminal() {
                return None;
            }
            match self.inner.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks the session closed regardless of its current state.
    ///
    /// Returns the previous state.
    pub fn close(&self) -> SessionState {
        SessionState::from_u8(self.inner.swap(SessionState::Closed as u8, Ordering::AcqRel))
    }
}
