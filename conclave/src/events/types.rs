//! Session event types.
//!
//! Every observable step of a session is one of these typed messages, pushed
//! onto that session's [`EventStream`](super::EventStream).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TimeoutScope;
use crate::session::{EndReason, PhaseKind, RoundStatus, SessionId};

/// All session lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Participants were selected and the session deadline started.
    SessionStarted {
        session_id: SessionId,
        participants: Vec<String>,
        max_rounds: u32,
        time_limit_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A round began fanning out.
    RoundStarted {
        session_id: SessionId,
        round: u32,
        phase: PhaseKind,
        targets: Vec<String>,
        deadline_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A responder returned and its contribution was recorded.
    ContributionReceived {
        session_id: SessionId,
        round: u32,
        contribution_id: String,
        author_id: String,
        confidence: f64,
        tokens: u64,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A responder call failed after retries.
    ContributionFailed {
        session_id: SessionId,
        round: u32,
        responder_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A session or round deadline crossed a warning threshold.
    DeadlineWarning {
        session_id: SessionId,
        scope: TimeoutScope,
        round: Option<u32>,
        fraction: f64,
        remaining_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A round finished (completed or timed out).
    RoundCompleted {
        session_id: SessionId,
        round: u32,
        phase: PhaseKind,
        status: RoundStatus,
        contributions: usize,
        timestamp: DateTime<Utc>,
    },

    /// A round could not run or failed.
    RoundFailed {
        session_id: SessionId,
        round: u32,
        phase: PhaseKind,
        reason: String,
        critical: bool,
        timestamp: DateTime<Utc>,
    },

    ConsensusReached {
        session_id: SessionId,
        round: u32,
        agreement: f64,
        timestamp: DateTime<Utc>,
    },

    /// The session deadline fired.
    SessionTimedOut {
        session_id: SessionId,
        rounds_started: usize,
        timestamp: DateTime<Utc>,
    },

    /// Finalization ran and the output is available.
    SessionCompleted {
        session_id: SessionId,
        end_reason: EndReason,
        quality_score: f64,
        total_tokens: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SessionStarted { timestamp, .. }
            | Self::RoundStarted { timestamp, .. }
            | Self::ContributionReceived { timestamp, .. }
            | Self::ContributionFailed { timestamp, .. }
            | Self::DeadlineWarning { timestamp, .. }
            | Self::RoundCompleted { timestamp, .. }
            | Self::RoundFailed { timestamp, .. }
            | Self::ConsensusReached { timestamp, .. }
            | Self::SessionTimedOut { timestamp, .. }
            | Self::SessionCompleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::RoundStarted { .. } => "round_started",
            Self::ContributionReceived { .. } => "contribution_received",
            Self::ContributionFailed { .. } => "contribution_failed",
            Self::DeadlineWarning { .. } => "deadline_warning",
            Self::RoundCompleted { .. } => "round_completed",
            Self::RoundFailed { .. } => "round_failed",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::SessionTimedOut { .. } => "session_timed_out",
            Self::SessionCompleted { .. } => "session_completed",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::RoundStarted { session_id, .. }
            | Self::ContributionReceived { session_id, .. }
            | Self::ContributionFailed { session_id, .. }
            | Self::DeadlineWarning { session_id, .. }
            | Self::RoundCompleted { session_id, .. }
            | Self::RoundFailed { session_id, .. }
            | Self::ConsensusReached { session_id, .. }
            | Self::SessionTimedOut { session_id, .. }
            | Self::SessionCompleted { session_id, .. } => session_id,
        }
    }

    /// Round number, for round-scoped events.
    pub fn round(&self) -> Option<u32> {
        match self {
            Self::RoundStarted { round, .. }
            | Self::ContributionReceived { round, .. }
            | Self::ContributionFailed { round, .. }
            | Self::RoundCompleted { round, .. }
            | Self::RoundFailed { round, .. }
            | Self::ConsensusReached { round, .. } => Some(*round),
            Self::DeadlineWarning { round, .. } => *round,
            Self::SessionStarted { .. }
            | Self::SessionTimedOut { .. }
            | Self::SessionCompleted { .. } => None,
        }
    }

    /// The last event a session ever emits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionCompleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::RoundStarted {
            session_id: "s-1".into(),
            round: 2,
            phase: PhaseKind::Critique,
            targets: vec!["claude".into(), "gpt".into()],
            deadline_ms: 45_000,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "round_started");
        assert_eq!(json["phase"], "critique");

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_type(), "round_started");
    }

    #[test]
    fn test_event_accessors() {
        let event = SessionEvent::SessionCompleted {
            session_id: "s-9".into(),
            end_reason: EndReason::Timeout,
            quality_score: 0.0,
            total_tokens: 0,
            timestamp: Utc::now(),
        };
        assert_eq!(event.session_id(), "s-9");
        assert_eq!(event.round(), None);
        assert!(event.is_terminal());

        let warning = SessionEvent::DeadlineWarning {
            session_id: "s-9".into(),
            scope: TimeoutScope::Round,
            round: Some(3),
            fraction: 0.75,
            remaining_ms: 250,
            timestamp: Utc::now(),
        };
        assert_eq!(warning.round(), Some(3));
        assert!(!warning.is_terminal());
    }
}
