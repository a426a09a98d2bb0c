//! Session lifecycle: status machine, transitions and run metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{CollaborationRequest, Contribution, Participant, Round, RoundStatus, SessionId};
use crate::deadline::DeadlineHandle;
use crate::error::CollabError;
use crate::synthesis::Output;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Request accepted, participants being selected.
    Initializing,
    /// Rounds are running.
    Active,
    /// Consensus policy succeeded; awaiting finalization.
    ConsensusReached,
    /// Finalized (or budget/threshold reached and awaiting finalization).
    Completed,
    /// Session deadline fired; awaiting finalization.
    Timeout,
}

impl SessionStatus {
    /// Whether rounds may still run.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Initializing | Self::Active)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [SessionStatus] {
        match self {
            Self::Initializing => &[Self::Active],
            Self::Active => &[
                Self::Active,
                Self::ConsensusReached,
                Self::Completed,
                Self::Timeout,
            ],
            Self::ConsensusReached | Self::Timeout => &[Self::Completed],
            Self::Completed => &[],
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::Completed => write!(f, "completed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why the round loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    ConsensusReached,
    QualityThreshold,
    RoundBudgetExhausted,
    Timeout,
    /// A critical round failure stopped the loop.
    Aborted { reason: String },
    /// `complete_session` or `dispose` was called while rounds were running.
    Manual,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::QualityThreshold => write!(f, "quality_threshold"),
            Self::RoundBudgetExhausted => write!(f, "round_budget_exhausted"),
            Self::Timeout => write!(f, "timeout"),
            Self::Aborted { reason } => write!(f, "aborted: {}", reason),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A status transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Running counters for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub rounds_completed: u32,
    pub rounds_failed: u32,
    pub rounds_timed_out: u32,
    pub contributions: u32,
    pub failed_calls: u32,
    pub total_tokens: u64,
    pub duration_ms: u64,
}

/// A single collaboration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub request: CollaborationRequest,
    pub rounds: Vec<Round>,
    pub participants: Vec<Participant>,
    /// Session deadline; `None` before activation and after finalization.
    pub deadline: Option<DeadlineHandle>,
    pub status: SessionStatus,
    pub end_reason: Option<EndReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StatusTransition>,
    pub metrics: SessionMetrics,
    pub output: Option<Output>,
}

impl Session {
    pub fn new(request: CollaborationRequest, participants: Vec<Participant>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            rounds: Vec::new(),
            participants,
            deadline: None,
            status: SessionStatus::Initializing,
            end_reason: None,
            started_at: Utc::now(),
            ended_at: None,
            transitions: Vec::new(),
            metrics: SessionMetrics::default(),
            output: None,
        }
    }

    /// Move to a new status, rejecting backwards or skipped transitions.
    pub fn transition(&mut self, to: SessionStatus, reason: &str) -> Result<(), CollabError> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(CollabError::Transition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.transitions.push(StatusTransition {
            from: self.status,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.status = to;
        Ok(())
    }

    /// Whether the session produced its output.
    pub fn is_finalized(&self) -> bool {
        self.output.is_some()
    }

    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active)
    }

    /// Leave a participant out of later fan-outs. Its contributions stay.
    /// Returns whether it was active.
    pub fn deactivate_participant(&mut self, id: &str) -> bool {
        match self.participants.iter_mut().find(|p| p.id == id && p.is_active) {
            Some(p) => {
                p.is_active = false;
                true
            }
            None => false,
        }
    }

    /// Every contribution across all rounds, oldest round first.
    pub fn contributions(&self) -> impl Iterator<Item = &Contribution> {
        self.rounds.iter().flat_map(|r| r.contributions.iter())
    }

    pub fn current_round(&self) -> Option<&Round> {
        self.rounds.last()
    }

    /// Whether the session deadline ended the run.
    pub fn timed_out(&self) -> bool {
        self.end_reason == Some(EndReason::Timeout)
    }

    /// Recompute counters from the round list.
    pub fn refresh_metrics(&mut self) {
        let mut metrics = SessionMetrics {
            failed_calls: self.metrics.failed_calls,
            ..SessionMetrics::default()
        };
        for round in &self.rounds {
            match round.status {
                RoundStatus::Completed => metrics.rounds_completed += 1,
                RoundStatus::Failed => metrics.rounds_failed += 1,
                RoundStatus::Timeout => metrics.rounds_timed_out += 1,
                RoundStatus::Pending | RoundStatus::Running => {}
            }
            metrics.contributions += round.contributions.len() as u32;
            metrics.total_tokens += round.tokens();
        }
        let end = self.ended_at.unwrap_or_else(Utc::now);
        metrics.duration_ms = (end - self.started_at).num_milliseconds().max(0) as u64;
        self.metrics = metrics;
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        let reason = self
            .end_reason
            .as_ref()
            .map(|r| format!(" | end={}", r))
            .unwrap_or_default();
        format!(
            "[{}] {} rounds | {} contributions | {} participants{}",
            self.status,
            self.rounds.len(),
            self.contributions().count(),
            self.participants.len(),
            reason
        )
    }
}
