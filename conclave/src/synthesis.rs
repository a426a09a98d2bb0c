//! Output Synthesizer: turns a finished session into its [`Output`].
//!
//! Synthesis never fails. Missing data degrades to explicit markers:
//!
//! - final content is the last contribution of the last round; if that round
//!   is empty, every contribution labeled by author; if there are none at
//!   all, [`NO_OUTPUT_MARKER`]
//! - quality score is the mean confidence of all contributions (0 if none)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusLevel;
use crate::session::{
    Contribution, ContributionId, EndReason, PhaseKind, RoundStatus, Session, SessionId,
};

/// Content of an output built from zero contributions.
pub const NO_OUTPUT_MARKER: &str = "No output generated";

/// Token accounting for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub by_participant: BTreeMap<String, u64>,
    /// Keyed by 1-indexed round number.
    pub by_round: BTreeMap<u32, u64>,
    /// `total × cost_per_token`.
    pub estimated_cost: f64,
    /// Quality score per 1000 tokens.
    pub efficiency: f64,
    /// `total ÷ cost_budget × 100`, when the request set a budget.
    pub budget_utilization: Option<f64>,
}

/// Per-round digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub number: u32,
    pub phase: PhaseKind,
    pub status: RoundStatus,
    pub contributions: usize,
    pub tokens: u64,
    pub mean_confidence: f64,
    /// Last contribution appended in the round.
    pub final_contribution: Option<ContributionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// How the answer moved between the first and last productive rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImprovementMetrics {
    pub initial_confidence: f64,
    pub final_confidence: f64,
    pub confidence_gain: f64,
    pub rounds_completed: u32,
    /// Contributions that critique earlier work.
    pub critiques_recorded: u32,
}

/// The finalized artifact of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub session_id: SessionId,
    pub content: String,
    /// Every contribution, oldest round first.
    pub contributions: Vec<Contribution>,
    pub rounds: Vec<RoundSummary>,
    /// 0–100.
    pub quality_score: f64,
    pub consensus_level: ConsensusLevel,
    pub token_usage: TokenUsage,
    pub improvement: ImprovementMetrics,
    pub end_reason: Option<EndReason>,
    pub finalized_at: DateTime<Utc>,
}

impl Output {
    /// Whether the session produced any contribution.
    pub fn has_content(&self) -> bool {
        !self.contributions.is_empty()
    }

    /// Short multi-line report, suitable for logs and knowledge documents.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Session {} | quality {:.1} | consensus {} | {} tokens (${:.4})",
            self.session_id,
            self.quality_score,
            self.consensus_level,
            self.token_usage.total,
            self.token_usage.estimated_cost
        );
        if let Some(reason) = &self.end_reason {
            out.push_str(&format!(" | end {}", reason));
        }
        for round in &self.rounds {
            out.push_str(&format!(
                "\n  round {} {}: {} ({} contributions, {} tokens)",
                round.number, round.phase, round.status, round.contributions, round.tokens
            ));
        }
        out
    }
}

/// Build the output for a session. `cost_per_token` prices the token total.
pub fn synthesize(session: &Session, cost_per_token: f64) -> Output {
    let contributions: Vec<Contribution> = session.contributions().cloned().collect();

    let quality_score = if contributions.is_empty() {
        0.0
    } else {
        contributions.iter().map(|c| c.confidence).sum::<f64>() / contributions.len() as f64
    };

    let consensus_reached = session.end_reason == Some(EndReason::ConsensusReached);

    Output {
        session_id: session.id.clone(),
        content: final_content(session, &contributions),
        rounds: round_summaries(session),
        quality_score,
        consensus_level: ConsensusLevel::classify(&session.rounds, consensus_reached),
        token_usage: token_usage(session, quality_score, cost_per_token),
        improvement: improvement(session),
        end_reason: session.end_reason.clone(),
        finalized_at: Utc::now(),
        contributions,
    }
}

fn final_content(session: &Session, all: &[Contribution]) -> String {
    if let Some(last) = session.rounds.last().and_then(|r| r.contributions.last()) {
        return last.content.clone();
    }
    if all.is_empty() {
        return NO_OUTPUT_MARKER.to_string();
    }
    all.iter()
        .map(|c| format!("## {} (round {})\n\n{}", c.author_id, c.round_number, c.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn round_summaries(session: &Session) -> Vec<RoundSummary> {
    session
        .rounds
        .iter()
        .map(|r| RoundSummary {
            number: r.number,
            phase: r.phase,
            status: r.status,
            contributions: r.contributions.len(),
            tokens: r.tokens(),
            mean_confidence: r.mean_confidence(),
            final_contribution: r.contributions.last().map(|c| c.id.clone()),
            failure: r.failure.clone(),
        })
        .collect()
}

fn token_usage(session: &Session, quality_score: f64, cost_per_token: f64) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for round in &session.rounds {
        let entry = usage.by_round.entry(round.number).or_insert(0);
        for c in &round.contributions {
            *entry += c.tokens;
            *usage.by_participant.entry(c.author_id.clone()).or_insert(0) += c.tokens;
            usage.total += c.tokens;
        }
    }
    usage.estimated_cost = usage.total as f64 * cost_per_token;
    usage.efficiency = if usage.total == 0 {
        0.0
    } else {
        quality_score * 1000.0 / usage.total as f64
    };
    usage.budget_utilization = session
        .request
        .cost_budget
        .filter(|b| *b > 0)
        .map(|budget| usage.total as f64 * 100.0 / budget as f64);
    usage
}

fn improvement(session: &Session) -> ImprovementMetrics {
    let productive: Vec<_> = session
        .rounds
        .iter()
        .filter(|r| !r.contributions.is_empty())
        .collect();
    let initial = productive.first().map(|r| r.mean_confidence()).unwrap_or(0.0);
    let last = productive.last().map(|r| r.mean_confidence()).unwrap_or(0.0);
    ImprovementMetrics {
        initial_confidence: initial,
        final_confidence: last,
        confidence_gain: last - initial,
        rounds_completed: session
            .rounds
            .iter()
            .filter(|r| r.status == RoundStatus::Completed)
            .count() as u32,
        critiques_recorded: session
            .contributions()
            .filter(|c| !c.critiques.is_empty())
            .count() as u32,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::{
        estimate_tokens, CollaborationRequest, ContributionMetadata, Round,
    };

    fn contribution(round: &Round, author: &str, content: &str, confidence: f64) -> Contribution {
        Contribution {
            id: format!("{}-{}", round.number, author),
            round_id: round.id.clone(),
            round_number: round.number,
            author_id: author.into(),
            author_provider: "mock".into(),
            content: content.into(),
            confidence,
            build_upon: vec![],
            critiques: vec![],
            timestamp: Utc::now(),
            tokens: estimate_tokens(content),
            metadata: ContributionMetadata::default(),
        }
    }

    fn session_with(rounds: Vec<Round>) -> Session {
        let mut s = Session::new(
            CollaborationRequest::new("Build a login form").with_cost_budget(100),
            vec![],
        );
        s.rounds = rounds;
        s
    }

    #[test]
    fn test_empty_session_yields_marker() {
        let out = synthesize(&session_with(vec![]), 0.01);
        assert_eq!(out.content, NO_OUTPUT_MARKER);
        assert_eq!(out.quality_score, 0.0);
        assert_eq!(out.token_usage.total, 0);
        assert_eq!(out.token_usage.efficiency, 0.0);
        assert_eq!(out.token_usage.budget_utilization, Some(0.0));
        assert_eq!(out.consensus_level, ConsensusLevel::None);
        assert!(!out.has_content());
    }

    #[test]
    fn test_last_contribution_of_last_round_wins() {
        let mut r1 = Round::new(1, Duration::from_secs(60));
        r1.contributions.push(contribution(&r1, "a", "draft a", 60.0));
        r1.contributions.push(contribution(&r1, "b", "draft b", 80.0));
        let mut r2 = Round::new(2, Duration::from_secs(45));
        r2.contributions.push(contribution(&r2, "b", "critique b", 90.0));
        r2.contributions.push(contribution(&r2, "a", "critique a", 70.0));

        let out = synthesize(&session_with(vec![r1, r2]), 0.0);
        assert_eq!(out.content, "critique a");
        assert_eq!(out.quality_score, 75.0);
        assert_eq!(out.rounds.len(), 2);
        assert_eq!(out.rounds[1].final_contribution.as_deref(), Some("2-a"));
        assert_eq!(out.improvement.initial_confidence, 70.0);
        assert_eq!(out.improvement.final_confidence, 80.0);
        assert_eq!(out.improvement.confidence_gain, 10.0);
    }

    #[test]
    fn test_empty_last_round_concatenates_by_author() {
        let mut r1 = Round::new(1, Duration::from_secs(60));
        r1.contributions.push(contribution(&r1, "claude", "use OAuth", 80.0));
        r1.contributions.push(contribution(&r1, "gpt", "use sessions", 70.0));
        let r2 = Round::new(2, Duration::from_secs(45));

        let out = synthesize(&session_with(vec![r1, r2]), 0.0);
        assert!(out.content.contains("## claude (round 1)"));
        assert!(out.content.contains("use sessions"));
        assert!(out.content.find("claude").unwrap() < out.content.find("gpt").unwrap());
    }

    #[test]
    fn test_token_totals_are_exact() {
        let mut r1 = Round::new(1, Duration::from_secs(60));
        r1.contributions.push(contribution(&r1, "a", &"x".repeat(41), 50.0));
        r1.contributions.push(contribution(&r1, "b", &"y".repeat(8), 50.0));
        let mut r2 = Round::new(2, Duration::from_secs(45));
        r2.contributions.push(contribution(&r2, "a", &"z".repeat(3), 50.0));
        let session = session_with(vec![r1, r2]);

        let out = synthesize(&session, 0.5);
        let expected: u64 = session.contributions().map(|c| c.tokens).sum();
        assert_eq!(expected, 11 + 2 + 1);
        assert_eq!(out.token_usage.total, expected);
        assert_eq!(out.token_usage.by_participant["a"], 12);
        assert_eq!(out.token_usage.by_participant["b"], 2);
        assert_eq!(out.token_usage.by_round[&1], 13);
        assert_eq!(out.token_usage.by_round[&2], 1);
        assert_eq!(out.token_usage.estimated_cost, 7.0);
        assert_eq!(out.token_usage.budget_utilization, Some(14.0));
        assert!((out.token_usage.efficiency - 50.0 * 1000.0 / 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_mentions_rounds() {
        let mut r1 = Round::new(1, Duration::from_secs(60));
        r1.status = RoundStatus::Completed;
        r1.contributions.push(contribution(&r1, "a", "answer", 88.0));
        let mut session = session_with(vec![r1]);
        session.end_reason = Some(EndReason::RoundBudgetExhausted);

        let out = synthesize(&session, 0.0);
        let summary = out.summary();
        assert!(summary.contains("quality 88.0"));
        assert!(summary.contains("round 1 propose: completed"));
        assert!(summary.contains("end round_budget_exhausted"));
        assert_eq!(out.improvement.rounds_completed, 1);
    }
}
