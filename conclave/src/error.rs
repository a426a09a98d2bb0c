//! Error taxonomy for collaboration sessions.
//!
//! Callers of the public surface only ever see [`CollabError::Validation`],
//! [`CollabError::NoParticipants`] or [`CollabError::NotFound`] synchronously.
//! Round-level errors (`RoundData`, `Provider`, `Timeout`) are recorded on the
//! session and logged; they never escape a running session.
//!
//! ## Criticality
//!
//! | Variant          | Critical by default |
//! |------------------|---------------------|
//! | RoundData        | no (flag on variant) |
//! | Provider         | no                  |
//! | Timeout          | no                  |
//! | Transition       | yes                 |
//! | Internal         | yes                 |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::PhaseKind;

/// Result alias used across the crate.
pub type CollabResult<T> = Result<T, CollabError>;

/// Failure reported by a single responder call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponderError {
    /// Network or backend failure.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Provider asked us to slow down.
    #[error("rate limited: retry after {0:?}")]
    RateLimited(Duration),

    /// Response could not be decoded.
    #[error("response parse error: {0}")]
    ParseError(String),

    /// Provider returned an empty completion.
    #[error("empty response")]
    EmptyResponse,

    /// No backend is configured for this responder id.
    #[error("responder unavailable: {0}")]
    Unavailable(String),
}

impl ResponderError {
    /// Whether the call may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed(_) | Self::RateLimited(_) | Self::EmptyResponse
        )
    }
}

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Session,
    Round,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Round => write!(f, "round"),
        }
    }
}

/// Unified error type for the collaboration engine.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Malformed request; no session was created.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A round's preconditions are not met.
    #[error("round {round} ({phase}) of session {session_id}: {reason}")]
    RoundData {
        session_id: String,
        round: u32,
        phase: PhaseKind,
        reason: String,
        critical: bool,
    },

    /// A single responder call failed.
    #[error("responder {responder_id} failed: {source}")]
    Provider {
        responder_id: String,
        #[source]
        source: ResponderError,
    },

    /// A session or round deadline expired.
    #[error("{scope} deadline expired for session {session_id}")]
    Timeout {
        session_id: String,
        scope: TimeoutScope,
        round: Option<u32>,
    },

    /// Unknown session id.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Selection produced an empty participant list.
    #[error("no available responders match the request")]
    NoParticipants,

    /// Invalid lifecycle transition.
    #[error("invalid transition {from} → {to}")]
    Transition { from: String, to: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything that indicates a broken engine rather than bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CollabError {
    /// Build a round-data error.
    pub fn round_data(
        session_id: impl Into<String>,
        round: u32,
        phase: PhaseKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::RoundData {
            session_id: session_id.into(),
            round,
            phase,
            reason: reason.into(),
            critical: false,
        }
    }

    /// Whether this error aborts the whole session.
    pub fn is_critical(&self) -> bool {
        match self {
            Self::RoundData { critical, .. } => *critical,
            Self::Transition { .. } | Self::Internal(_) => true,
            _ => false,
        }
    }

    /// Mark a round-data error as critical. Other variants are returned unchanged.
    pub fn into_critical(self) -> Self {
        match self {
            Self::RoundData {
                session_id,
                round,
                phase,
                reason,
                ..
            } => Self::RoundData {
                session_id,
                round,
                phase,
                reason,
                critical: true,
            },
            other => other,
        }
    }

    /// Whether this is a synchronous rejection of the request.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_data_is_not_critical_by_default() {
        let err = CollabError::round_data("s-1", 2, PhaseKind::Critique, "no previous contributions");
        assert!(!err.is_critical());
        assert!(err.to_string().contains("no previous contributions"));
        assert!(err.to_string().contains("critique"));
        assert!(err.into_critical().is_critical());
    }

    #[test]
    fn transition_and_internal_are_critical() {
        let err = CollabError::Transition {
            from: "completed".into(),
            to: "active".into(),
        };
        assert!(err.is_critical());
        assert!(CollabError::Internal("lock poisoned".into()).is_critical());
        assert!(!CollabError::NoParticipants.is_critical());
    }

    #[test]
    fn responder_error_retry_classification() {
        assert!(ResponderError::RequestFailed("reset".into()).is_retriable());
        assert!(ResponderError::RateLimited(Duration::from_secs(1)).is_retriable());
        assert!(!ResponderError::ParseError("bad json".into()).is_retriable());
        assert!(!ResponderError::Unavailable("gpt".into()).is_retriable());
    }

    #[test]
    fn provider_error_keeps_source() {
        let err = CollabError::Provider {
            responder_id: "claude".into(),
            source: ResponderError::EmptyResponse,
        };
        assert!(err.to_string().contains("claude"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_validation());
    }
}
