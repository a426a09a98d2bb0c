//! Consensus policies: when may a session stop early?
//!
//! There is no universal definition of agreement between free-text
//! responders, so the check is a pluggable [`ConsensusPolicy`]. The default
//! policy never reports consensus; sessions then run their full round
//! budget. [`ConfidenceAgreement`] is an opt-in policy that treats a round
//! whose self-reported confidences are both high and tightly clustered as
//! agreement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::session::Round;

/// Outcome of a consensus check after a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsensusOutcome {
    /// Participants agree; `agreement` is in 0.0–1.0.
    Reached { agreement: f64 },
    /// Not there yet.
    Progressing,
    /// Too little data to judge.
    Insufficient,
}

impl ConsensusOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, Self::Reached { .. })
    }
}

impl std::fmt::Display for ConsensusOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reached { agreement } => write!(f, "reached ({:.2})", agreement),
            Self::Progressing => write!(f, "progressing"),
            Self::Insufficient => write!(f, "insufficient"),
        }
    }
}

/// Decides whether the rounds so far amount to consensus.
pub trait ConsensusPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called after every round with all rounds so far (latest last).
    fn evaluate(&self, rounds: &[Round]) -> ConsensusOutcome;
}

/// Never reports consensus.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

impl ConsensusPolicy for Disabled {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn evaluate(&self, _rounds: &[Round]) -> ConsensusOutcome {
        ConsensusOutcome::Progressing
    }
}

/// Consensus when the latest round's confidences are high and close together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceAgreement {
    /// Minimum contributions in the latest round.
    pub min_contributions: usize,
    /// Minimum mean confidence (0–100).
    pub min_mean_confidence: f64,
    /// Maximum spread between highest and lowest confidence (0–100).
    pub max_spread: f64,
}

impl Default for ConfidenceAgreement {
    fn default() -> Self {
        Self {
            min_contributions: 2,
            min_mean_confidence: 85.0,
            max_spread: 10.0,
        }
    }
}

impl ConsensusPolicy for ConfidenceAgreement {
    fn name(&self) -> &'static str {
        "confidence_agreement"
    }

    fn evaluate(&self, rounds: &[Round]) -> ConsensusOutcome {
        let Some(latest) = rounds.last() else {
            return ConsensusOutcome::Insufficient;
        };
        let n = latest.contributions.len();
        if n == 0 || n < self.min_contributions {
            return ConsensusOutcome::Insufficient;
        }

        let spread = confidence_spread(latest);
        if latest.mean_confidence() >= self.min_mean_confidence && spread <= self.max_spread {
            ConsensusOutcome::Reached {
                agreement: (1.0 - spread / 100.0).clamp(0.0, 1.0),
            }
        } else {
            ConsensusOutcome::Progressing
        }
    }
}

/// Serializable policy selection for configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConsensusSettings {
    #[default]
    Disabled,
    ConfidenceAgreement(ConfidenceAgreement),
}

impl ConsensusSettings {
    pub fn build(&self) -> Arc<dyn ConsensusPolicy> {
        match self {
            Self::Disabled => Arc::new(Disabled),
            Self::ConfidenceAgreement(policy) => Arc::new(policy.clone()),
        }
    }
}

/// Highest minus lowest confidence in a round (0 for empty rounds).
pub fn confidence_spread(round: &Round) -> f64 {
    let mut iter = round.contributions.iter().map(|c| c.confidence);
    let Some(first) = iter.next() else {
        return 0.0;
    };
    let (lo, hi) = iter.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c)));
    hi - lo
}

/// Coarse agreement classification reported in the session output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusLevel {
    /// No contributions at all.
    None,
    Weak,
    Moderate,
    Strong,
}

impl ConsensusLevel {
    /// Classify a finished session.
    ///
    /// A reached consensus is always `Strong`. Otherwise the confidence
    /// spread of the last round with contributions decides: ≤10 strong,
    /// ≤25 moderate, anything wider weak. A lone contribution has nothing to
    /// agree with and counts as moderate.
    pub fn classify(rounds: &[Round], consensus_reached: bool) -> Self {
        let Some(last) = rounds.iter().rev().find(|r| !r.contributions.is_empty()) else {
            return Self::None;
        };
        if consensus_reached {
            return Self::Strong;
        }
        if last.contributions.len() == 1 {
            return Self::Moderate;
        }
        match confidence_spread(last) {
            s if s <= 10.0 => Self::Strong,
            s if s <= 25.0 => Self::Moderate,
            _ => Self::Weak,
        }
    }
}

impl std::fmt::Display for ConsensusLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Weak => write!(f, "weak"),
            Self::Moderate => write!(f, "moderate"),
            Self::Strong => write!(f, "strong"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::session::{Contribution, ContributionMetadata};

    fn round_with(confidences: &[f64]) -> Round {
        let mut round = Round::new(1, Duration::from_secs(60));
        for (i, c) in confidences.iter().enumerate() {
            round.contributions.push(Contribution {
                id: format!("c-{}", i),
                round_id: round.id.clone(),
                round_number: 1,
                author_id: format!("p-{}", i),
                author_provider: "mock".into(),
                content: "answer".into(),
                confidence: *c,
                build_upon: vec![],
                critiques: vec![],
                timestamp: Utc::now(),
                tokens: 2,
                metadata: ContributionMetadata::default(),
            });
        }
        round
    }

    #[test]
    fn test_disabled_never_reaches() {
        let rounds = vec![round_with(&[99.0, 99.0, 99.0])];
        assert_eq!(Disabled.evaluate(&rounds), ConsensusOutcome::Progressing);
    }

    #[test]
    fn test_confidence_agreement_reached() {
        let policy = ConfidenceAgreement::default();
        let outcome = policy.evaluate(&[round_with(&[90.0, 95.0])]);
        assert!(outcome.is_reached());
        if let ConsensusOutcome::Reached { agreement } = outcome {
            assert!((agreement - 0.95).abs() < 1e-9);
        }
    }

    #[test]
    fn test_confidence_agreement_needs_tight_spread() {
        let policy = ConfidenceAgreement::default();
        assert_eq!(
            policy.evaluate(&[round_with(&[70.0, 100.0])]),
            ConsensusOutcome::Progressing
        );
    }

    #[test]
    fn test_confidence_agreement_needs_enough_contributions() {
        let policy = ConfidenceAgreement::default();
        assert_eq!(
            policy.evaluate(&[round_with(&[95.0])]),
            ConsensusOutcome::Insufficient
        );
        assert_eq!(policy.evaluate(&[]), ConsensusOutcome::Insufficient);
    }

    #[test]
    fn test_settings_json() {
        let json = r#"{"policy": "confidence_agreement", "min_contributions": 3, "min_mean_confidence": 80.0, "max_spread": 5.0}"#;
        let settings: ConsensusSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.build().name(), "confidence_agreement");

        let default: ConsensusSettings = serde_json::from_str(r#"{"policy": "disabled"}"#).unwrap();
        assert_eq!(default.build().name(), "disabled");
    }

    #[test]
    fn test_consensus_level_classification() {
        assert_eq!(ConsensusLevel::classify(&[], false), ConsensusLevel::None);
        assert_eq!(
            ConsensusLevel::classify(&[round_with(&[80.0, 85.0])], false),
            ConsensusLevel::Strong
        );
        assert_eq!(
            ConsensusLevel::classify(&[round_with(&[60.0, 80.0])], false),
            ConsensusLevel::Moderate
        );
        assert_eq!(
            ConsensusLevel::classify(&[round_with(&[30.0, 90.0])], false),
            ConsensusLevel::Weak
        );
        assert_eq!(
            ConsensusLevel::classify(&[round_with(&[30.0, 90.0])], true),
            ConsensusLevel::Strong
        );
        assert_eq!(
            ConsensusLevel::classify(&[round_with(&[50.0])], false),
            ConsensusLevel::Moderate
        );
    }
}
