//! Connection state machine and lifecycle events.
//!
//! # State Machine
//!
//! ```text
//! Idle ──connect()──> Connecting ──socket open──> Open
//!                       ▲    │                      │
//!                       │    └─20 failures─┐        ├─socket close──> Connecting
//!                       │                  ▼        ├─`error` msg───> FatallyErrored
//!                       └──connect()── FatallyErrored
//!                                                   └─idle/disconnect──> Closed
//! ```

use std::fmt;

use crate::error::Notification;
use crate::protocol::OutboundCommand;

/// Connection state of the session transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No target yet.
    #[default]
    Idle,

    /// Waiting for or performing a connection attempt.
    Connecting {
        /// Current attempt number (1-based)
        attempt: u32,
    },

    /// Socket is open; sends go straight to the wire.
    Open,

    /// Deliberately disconnected; no automatic retry.
    Closed,

    /// Terminal failure: backend rejection or retries exhausted.
    FatallyErrored {
        /// Human-readable error message
        message: String,
    },
}

impl ConnectionState {
    /// Returns true if the socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns true if a connection attempt is pending.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    /// Returns true if the session will not recover without a new `connect`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::FatallyErrored { .. })
    }

    /// Returns a short status label for display.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting { .. } => "Connecting...",
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::FatallyErrored { .. } => "Error",
        }
    }
}

/// What the session should load once the socket is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Model identifier known to the backend.
    Model(String),
    /// URL of a model archive.
    Url(String),
}

impl Target {
    /// Command that asks the backend to load this target.
    #[must_use]
    pub fn load_command(&self) -> OutboundCommand {
        match self {
            Target::Model(id) => OutboundCommand::SetModel(id.clone()),
            Target::Url(url) => OutboundCommand::SetUrl(url.clone()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Model(id) => write!(f, "model {id}"),
            Target::Url(url) => write!(f, "url {url}"),
        }
    }
}

/// Lifecycle notifications published by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A connection attempt was scheduled.
    Connecting {
        /// Attempt number (1-based)
        attempt: u32,
    },
    /// The socket opened.
    Open,
    /// The socket closed.
    Closed,
    /// Terminal user-visible error.
    Error(Notification),
    /// Deliberate disconnect; empty message when the user should not be notified.
    Disconnected(String),
}
