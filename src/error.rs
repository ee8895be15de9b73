//! Custom error types for the viewer.
//!
//! This module defines the primary error type, `ViewerError`, for the whole crate. Using
//! the `thiserror` crate, it provides one consistent way to report failures, from a
//! dropped socket to a malformed voltage frame.
//!
//! ## Error Hierarchy
//!
//! - **`TransientNetworkFailure`**: the socket failed or closed without the backend saying
//!   why. The session transport retries these until its attempt cap is reached.
//! - **`BackendRejected`**: the backend sent an explicit `error` message. Terminal, never
//!   retried.
//! - **`ProtocolViolation`**: an inbound message could not be parsed or did not match the
//!   loaded morphology (for example a voltage frame of the wrong length). The message is
//!   dropped and the session continues.
//! - **`NotConnected`**: a send was attempted after an explicit disconnect.
//! - **`Config`** / **`Configuration`**: configuration could not be loaded, or loaded but
//!   failed validation.
//! - **`Io`**, **`Json`**, **`Csv`**: wrapped errors from the standard library and the
//!   serialization crates.
//!
//! Errors that reach the user are converted into a [`Notification`], the single channel
//! through which user-visible problems are surfaced.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ViewerResult<T> = std::result::Result<T, ViewerError>;

/// Primary error type for the viewer.
#[derive(Error, Debug)]
pub enum ViewerError {
    /// Socket error or close without an explicit backend error.
    #[error("Network failure: {0}")]
    TransientNetworkFailure(String),

    /// The backend explicitly rejected the session.
    #[error("Backend rejected the session: {0}")]
    BackendRejected(String),

    /// Malformed or inconsistent inbound message.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Send attempted after an explicit disconnect.
    #[error("Session is not connected")]
    NotConnected,

    /// The session target (model id or URL) is unusable.
    #[error("Invalid session target: {0}")]
    InvalidTarget(String),

    /// Configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<figment::Error> for ViewerError {
    fn from(err: figment::Error) -> Self {
        ViewerError::Config(Box::new(err))
    }
}

impl ViewerError {
    /// Returns `true` if the error ends the session for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ViewerError::BackendRejected(_))
    }

    /// Returns `true` if the failed operation may succeed on a later attempt.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, ViewerError::TransientNetworkFailure(_))
    }

    /// Converts the error into a user-facing notification.
    #[must_use]
    pub fn notification(&self) -> Notification {
        match self {
            ViewerError::BackendRejected(msg) => Notification::new(msg.clone()),
            ViewerError::NotConnected => {
                Notification::new("Disconnected. Please reload the page to reconnect.")
            }
            other => Notification::new(other.to_string()),
        }
    }
}

/// A short user-visible message with optional raw detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Headline shown to the user.
    pub msg: String,
    /// Raw detail (backend traceback, socket error) if available.
    pub raw: Option<String>,
}

impl Notification {
    /// Creates a notification without detail.
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            raw: None,
        }
    }

    /// Attaches raw detail to the notification.
    #[must_use]
    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "{}: {}", self.msg, raw),
            None => write!(f, "{}", self.msg),
        }
    }
}
