//! Value types shared by the round engine, orchestrator and synthesizer.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollabError;

pub type SessionId = String;
pub type ContributionId = String;

/// Phase of a collaboration round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Every participant drafts an answer.
    Propose,
    /// Every participant reviews the previous round.
    Critique,
    /// One participant merges everything so far.
    Synthesize,
    /// Everyone but the synthesizer checks the synthesis.
    Validate,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 4] = [
        PhaseKind::Propose,
        PhaseKind::Critique,
        PhaseKind::Synthesize,
        PhaseKind::Validate,
    ];

    /// Phase for a 1-indexed round number. Rounds past 4 repeat `Validate`.
    pub fn for_round(number: u32) -> Self {
        match number {
            0 | 1 => Self::Propose,
            2 => Self::Critique,
            3 => Self::Synthesize,
            _ => Self::Validate,
        }
    }

    pub fn purpose(self) -> &'static str {
        match self {
            Self::Propose => "Generate independent initial solutions",
            Self::Critique => "Review and critique the proposed solutions",
            Self::Synthesize => "Merge the strongest ideas into a single solution",
            Self::Validate => "Validate the synthesized solution",
        }
    }

    /// Round deadline used when nothing is configured.
    pub fn default_deadline(self) -> Duration {
        match self {
            Self::Propose => Duration::from_secs(60),
            Self::Critique => Duration::from_secs(45),
            Self::Synthesize => Duration::from_secs(90),
            Self::Validate => Duration::from_secs(30),
        }
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Propose => write!(f, "propose"),
            Self::Critique => write!(f, "critique"),
            Self::Synthesize => write!(f, "synthesize"),
            Self::Validate => write!(f, "validate"),
        }
    }
}

/// Request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(CollabError::Validation(format!(
                "priority must be one of low, medium, high, critical (got {other:?})"
            ))),
        }
    }
}

/// What a caller submits to start a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationRequest {
    pub prompt: String,
    #[serde(default)]
    pub priority: Priority,
    /// Session time limit in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
    /// Token budget used for the utilization metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_budget: Option<u64>,
    /// Restrict selection to these responder ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responders: Option<Vec<String>>,
    /// Strengths used to rank responders during selection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_strengths: Vec<String>,
    /// Extra material appended to the propose prompt (code, docs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl CollaborationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            priority: Priority::default(),
            time_limit_ms: None,
            max_rounds: None,
            cost_budget: None,
            responders: None,
            required_strengths: Vec::new(),
            context: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit_ms = Some(limit.as_millis() as u64);
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn with_cost_budget(mut self, tokens: u64) -> Self {
        self.cost_budget = Some(tokens);
        self
    }

    pub fn with_responders<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responders = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_strengths<I, S>(mut self, strengths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_strengths = strengths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_ms.map(Duration::from_millis)
    }
}

/// Role a participant plays in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Writes concrete code.
    Implementer,
    /// Careful step-by-step analysis.
    Reasoner,
    /// Alternative and unconventional approaches.
    Innovator,
    /// Finds defects.
    Reviewer,
    #[default]
    Generalist,
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Implementer => write!(f, "implementer"),
            Self::Reasoner => write!(f, "reasoner"),
            Self::Innovator => write!(f, "innovator"),
            Self::Reviewer => write!(f, "reviewer"),
            Self::Generalist => write!(f, "generalist"),
        }
    }
}

/// A responder bound into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Responder id; unique within a session.
    pub id: String,
    pub provider: String,
    pub model: String,
    pub role: ParticipantRole,
    pub strengths: Vec<String>,
    pub is_active: bool,
    /// Load counter snapshot at selection time.
    pub load: u32,
}

/// Execution state of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Per-call bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContributionMetadata {
    pub latency_ms: u64,
    pub retry_count: u32,
    pub model: String,
}

/// One participant's output within a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub id: ContributionId,
    pub round_id: String,
    pub round_number: u32,
    pub author_id: String,
    pub author_provider: String,
    pub content: String,
    /// Self-reported confidence, 0–100.
    pub confidence: f64,
    pub build_upon: Vec<ContributionId>,
    pub critiques: Vec<ContributionId>,
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
    pub metadata: ContributionMetadata,
}

/// Token estimate for a piece of text: one token per four characters, rounded up.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.chars().count() as u64).div_ceil(4)
}

/// One timed phase of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    /// 1-indexed position in the session.
    pub number: u32,
    pub phase: PhaseKind,
    pub purpose: String,
    pub deadline_ms: u64,
    /// Contributions in completion order.
    pub contributions: Vec<Contribution>,
    pub status: RoundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn new(number: u32, deadline: Duration) -> Self {
        let phase = PhaseKind::for_round(number);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            phase,
            purpose: phase.purpose().to_string(),
            deadline_ms: deadline.as_millis() as u64,
            contributions: Vec::new(),
            status: RoundStatus::Pending,
            failure: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn contribution_ids(&self) -> Vec<ContributionId> {
        self.contributions.iter().map(|c| c.id.clone()).collect()
    }

    pub fn tokens(&self) -> u64 {
        self.contributions.iter().map(|c| c.tokens).sum()
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.contributions.is_empty() {
            return 0.0;
        }
        self.contributions.iter().map(|c| c.confidence).sum::<f64>()
            / self.contributions.len() as f64
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.status, RoundStatus::Pending | RoundStatus::Running)
    }
}
