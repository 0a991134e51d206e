//! Connection state machine and the per-call send/schedule guard

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Connection state of the live call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No call in progress
    #[default]
    Disconnected,
    /// Devices acquired, waiting for the session handshake
    Connecting,
    /// Session open; media flows both ways
    Connected,
    /// The last call attempt failed; a new attempt may be started
    Error,
}

impl ConnectionState {
    /// Whether a call attempt is currently underway
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Owns the connection state and publishes every change
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
    last_error: Option<String>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Disconnected`
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            last_error: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Short user-visible message for the last failure
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `Disconnected | Error -> Connecting`
    ///
    /// # Errors
    ///
    /// Returns error if a call is already connecting or connected
    pub fn begin_connect(&mut self) -> Result<()> {
        let current = self.state();
        if current.is_active() {
            return Err(Error::Session(format!("call already {current}")));
        }
        self.last_error = None;
        self.set(ConnectionState::Connecting);
        Ok(())
    }

    /// `Connecting -> Connected`; returns false from any other state
    pub fn mark_connected(&mut self) -> bool {
        if self.state() != ConnectionState::Connecting {
            return false;
        }
        self.set(ConnectionState::Connected);
        true
    }

    /// Any state `-> Error`, recording a user-visible message
    pub fn mark_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%message, from = %self.state(), "call entered error state");
        self.last_error = Some(message);
        self.set(ConnectionState::Error);
    }

    /// Any state except `Error` `-> Disconnected`
    ///
    /// An error stays visible until the next attempt. Returns whether the
    /// state changed.
    pub fn mark_disconnected(&mut self) -> bool {
        match self.state() {
            ConnectionState::Error | ConnectionState::Disconnected => false,
            _ => {
                self.set(ConnectionState::Disconnected);
                true
            }
        }
    }

    fn set(&self, next: ConnectionState) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "connection state changed");
        }
    }
}

/// Checked at the moment of every send and schedule
///
/// A guard is live only while its call token is uncancelled and the
/// connection is `Connected`. Work queued before a disconnect therefore
/// becomes a no-op even if it runs afterwards.
#[derive(Debug, Clone)]
pub struct CallGuard {
    token: CancellationToken,
    state: watch::Receiver<ConnectionState>,
}

impl CallGuard {
    /// Guard over a call token and a state observer
    #[must_use]
    pub const fn new(token: CancellationToken, state: watch::Receiver<ConnectionState>) -> Self {
        Self { token, state }
    }

    /// Whether sends and schedules may proceed right now
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled() && *self.state.borrow() == ConnectionState::Connected
    }

    /// The call token
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }
}
