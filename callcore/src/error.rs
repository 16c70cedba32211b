//! Call-related error types.

use crate::types::{CallId, SessionStatus, UserId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Malformed request; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{user} is not allowed to act on call {call_id}")]
    Unauthorized { call_id: CallId, user: UserId },

    /// Duplicate, stale or losing transition. Callers treat this as an idempotent no-op.
    #[error("conflicting transition: {0}")]
    Conflict(#[from] InvalidTransition),

    #[error("{0} is already engaged in another call")]
    Busy(UserId),

    #[error("media transport error: {0}")]
    Transport(#[from] TransportError),
}

impl CallError {
    pub fn unauthorized(call_id: &CallId, user: &UserId) -> Self {
        Self::Unauthorized {
            call_id: call_id.clone(),
            user: user.clone(),
        }
    }

    pub fn conflict(current: impl Into<String>, attempted: impl Into<String>) -> Self {
        Self::Conflict(InvalidTransition {
            current_state: current.into(),
            attempted: attempted.into(),
        })
    }

    /// Conflicts are acknowledged silently; everything else surfaces to the requester.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl InvalidTransition {
    pub fn status(current: SessionStatus, attempted: SessionStatus) -> Self {
        Self {
            current_state: current.to_string(),
            attempted: attempted.to_string(),
        }
    }
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Failures reported by a media transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A newer operation on the same client already completed.
    #[error("operation superseded by a newer one")]
    Superseded,

    /// Our uid is already present in the room.
    #[error("uid {0} already in use in this channel")]
    UidConflict(u32),

    #[error("transport not connected")]
    NotConnected,

    #[error("microphone capture failed: {0}")]
    Capture(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

/// How the media layer reacts to a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorClass {
    /// Check the connection state; if connected, the join already succeeded.
    Superseded,
    /// Regenerate identity and retry once.
    IdentifierConflict,
    /// Retry the whole join with backoff.
    Transient,
}

impl TransportError {
    pub fn class(&self) -> TransportErrorClass {
        match self {
            Self::Superseded => TransportErrorClass::Superseded,
            Self::UidConflict(_) => TransportErrorClass::IdentifierConflict,
            _ => TransportErrorClass::Transient,
        }
    }
}
