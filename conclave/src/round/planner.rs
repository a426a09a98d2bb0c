//! Phase planners.
//!
//! Each [`PhaseKind`] maps through [`PLANNERS`] to a function that checks the
//! phase's preconditions against the rounds so far and produces a
//! [`RoundPlan`]. The executor in [`super::engine`] is phase-agnostic.

use super::prompts;
use crate::error::{CollabError, CollabResult};
use crate::session::{
    CollaborationRequest, Contribution, ContributionId, Participant, ParticipantRole, PhaseKind,
    Round,
};

pub const NO_PREVIOUS_CONTRIBUTIONS: &str = "no previous contributions";
pub const NO_CONTRIBUTIONS_TO_SYNTHESIZE: &str = "no contributions to synthesize";
pub const NO_SYNTHESIS_TO_VALIDATE: &str = "no synthesis to validate";
pub const NO_ACTIVE_PARTICIPANTS: &str = "no active participants";

/// Everything a planner may look at.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub session_id: &'a str,
    pub number: u32,
    pub phase: PhaseKind,
    pub request: &'a CollaborationRequest,
    /// Rounds strictly before this one.
    pub prior_rounds: &'a [Round],
    pub participants: &'a [Participant],
    /// Role preference for the synthesizer.
    pub synthesizer_roles: &'a [ParticipantRole],
}

impl<'a> PlanInput<'a> {
    fn fail(&self, reason: &str) -> CollabError {
        CollabError::round_data(self.session_id, self.number, self.phase, reason)
    }

    fn active(&self) -> impl Iterator<Item = &'a Participant> {
        self.participants.iter().filter(|p| p.is_active)
    }
}

/// What one round will do.
#[derive(Debug, Clone)]
pub struct RoundPlan {
    pub prompt: String,
    /// Participants called concurrently.
    pub targets: Vec<Participant>,
    /// Referenced by every contribution of the round.
    pub build_upon: Vec<ContributionId>,
    pub critiques: Vec<ContributionId>,
}

pub type PlannerFn = fn(&PlanInput<'_>) -> CollabResult<RoundPlan>;

/// Planner per phase, indexed by `PhaseKind as usize`.
pub const PLANNERS: [PlannerFn; 4] = [plan_propose, plan_critique, plan_synthesize, plan_validate];

/// Build the plan for `input.phase`.
pub fn plan(input: &PlanInput<'_>) -> CollabResult<RoundPlan> {
    PLANNERS[input.phase as usize](input)
}

/// The synthesizer: the first active participant holding the most preferred
/// role, falling back to the first active participant.
pub fn choose_synthesizer<'a>(
    participants: &'a [Participant],
    preference: &[ParticipantRole],
) -> Option<&'a Participant> {
    preference
        .iter()
        .find_map(|role| participants.iter().find(|p| p.is_active && p.role == *role))
        .or_else(|| participants.iter().find(|p| p.is_active))
}

fn plan_propose(input: &PlanInput<'_>) -> CollabResult<RoundPlan> {
    let targets: Vec<Participant> = input.active().cloned().collect();
    if targets.is_empty() {
        return Err(input.fail(NO_ACTIVE_PARTICIPANTS));
    }
    Ok(RoundPlan {
        prompt: prompts::propose(input.request),
        targets,
        build_upon: Vec::new(),
        critiques: Vec::new(),
    })
}

fn plan_critique(input: &PlanInput<'_>) -> CollabResult<RoundPlan> {
    let previous: Vec<&Contribution> = input
        .prior_rounds
        .last()
        .map(|r| r.contributions.iter().collect())
        .unwrap_or_default();
    if previous.is_empty() {
        return Err(input.fail(NO_PREVIOUS_CONTRIBUTIONS));
    }
    let targets: Vec<Participant> = input.active().cloned().collect();
    if targets.is_empty() {
        return Err(input.fail(NO_ACTIVE_PARTICIPANTS));
    }
    let ids: Vec<ContributionId> = previous.iter().map(|c| c.id.clone()).collect();
    Ok(RoundPlan {
        prompt: prompts::critique(input.request, &previous),
        targets,
        build_upon: ids.clone(),
        critiques: ids,
    })
}

fn plan_synthesize(input: &PlanInput<'_>) -> CollabResult<RoundPlan> {
    let all: Vec<&Contribution> = input
        .prior_rounds
        .iter()
        .flat_map(|r| r.contributions.iter())
        .collect();
    if all.is_empty() {
        return Err(input.fail(NO_CONTRIBUTIONS_TO_SYNTHESIZE));
    }
    let synthesizer = choose_synthesizer(input.participants, input.synthesizer_roles)
        .ok_or_else(|| input.fail(NO_ACTIVE_PARTICIPANTS))?;
    Ok(RoundPlan {
        prompt: prompts::synthesize(input.request, &all),
        targets: vec![synthesizer.clone()],
        build_upon: all.iter().map(|c| c.id.clone()).collect(),
        critiques: Vec::new(),
    })
}

/// The synthesis a validate round checks.
///
/// Earlier validate rounds are skipped, so a run of validate rounds keeps
/// checking the same synthesis. The round found must be a synthesize round
/// holding exactly one contribution.
pub fn synthesis_under_validation(prior_rounds: &[Round]) -> Option<&Contribution> {
    let source = prior_rounds
        .iter()
        .rev()
        .find(|r| r.phase != PhaseKind::Validate)?;
    match (source.phase, source.contributions.as_slice()) {
        (PhaseKind::Synthesize, [only]) => Some(only),
        _ => None,
    }
}

fn plan_validate(input: &PlanInput<'_>) -> CollabResult<RoundPlan> {
    let synthesis = synthesis_under_validation(input.prior_rounds)
        .ok_or_else(|| input.fail(NO_SYNTHESIS_TO_VALIDATE))?;
    let targets: Vec<Participant> = input
        .active()
        .filter(|p| p.id != synthesis.author_id)
        .cloned()
        .collect();
    Ok(RoundPlan {
        prompt: prompts::validate(input.request, synthesis),
        targets,
        build_upon: vec![synthesis.id.clone()],
        critiques: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::session::ContributionMetadata;

    fn participant(id: &str, role: ParticipantRole) -> Participant {
        Participant {
            id: id.into(),
            provider: "mock".into(),
            model: "m".into(),
            role,
            strengths: vec![],
            is_active: true,
            load: 0,
        }
    }

    fn round(number: u32, authors: &[&str]) -> Round {
        let mut r = Round::new(number, Duration::from_secs(30));
        for a in authors {
            r.contributions.push(Contribution {
                id: format!("r{}-{}", number, a),
                round_id: r.id.clone(),
                round_number: number,
                author_id: a.to_string(),
                author_provider: "mock".into(),
                content: format!("{} says hi", a),
                confidence: 70.0,
                build_upon: vec![],
                critiques: vec![],
                timestamp: Utc::now(),
                tokens: 3,
                metadata: ContributionMetadata::default(),
            });
        }
        r
    }

    fn input<'a>(
        number: u32,
        request: &'a CollaborationRequest,
        prior: &'a [Round],
        participants: &'a [Participant],
    ) -> PlanInput<'a> {
        PlanInput {
            session_id: "s-1",
            number,
            phase: PhaseKind::for_round(number),
            request,
            prior_rounds: prior,
            participants,
            synthesizer_roles: &[ParticipantRole::Reasoner],
        }
    }

    #[test]
    fn test_table_order_matches_phase_discriminants() {
        for (i, phase) in PhaseKind::ALL.iter().enumerate() {
            assert_eq!(*phase as usize, i);
        }
    }

    #[test]
    fn test_propose_targets_active_only() {
        let req = CollaborationRequest::new("Build a login form");
        let mut ps = vec![
            participant("a", ParticipantRole::Implementer),
            participant("b", ParticipantRole::Reasoner),
        ];
        ps[1].is_active = false;
        let plan = plan(&input(1, &req, &[], &ps)).unwrap();
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].id, "a");
        assert!(plan.build_upon.is_empty());
        assert!(plan.critiques.is_empty());
    }

    #[test]
    fn test_critique_without_previous_contributions_fails() {
        let req = CollaborationRequest::new("x");
        let ps = vec![participant("a", ParticipantRole::Generalist)];
        let err = plan(&input(2, &req, &[], &ps)).unwrap_err();
        assert!(err.to_string().contains(NO_PREVIOUS_CONTRIBUTIONS));
        assert!(!err.is_critical());

        let empty_prior = vec![round(1, &[])];
        let err = plan(&input(2, &req, &empty_prior, &ps)).unwrap_err();
        assert!(err.to_string().contains(NO_PREVIOUS_CONTRIBUTIONS));
    }

    #[test]
    fn test_critique_references_previous_round() {
        let req = CollaborationRequest::new("x");
        let ps = vec![participant("a", ParticipantRole::Generalist)];
        let prior = vec![round(1, &["a", "b"])];
        let plan = plan(&input(2, &req, &prior, &ps)).unwrap();
        assert_eq!(plan.build_upon, vec!["r1-a", "r1-b"]);
        assert_eq!(plan.critiques, plan.build_upon);
    }

    #[test]
    fn test_synthesize_picks_preferred_role() {
        let req = CollaborationRequest::new("x");
        let ps = vec![
            participant("impl", ParticipantRole::Implementer),
            participant("reason", ParticipantRole::Reasoner),
        ];
        let prior = vec![round(1, &["impl", "reason"]), round(2, &["impl"])];
        let plan = plan(&input(3, &req, &prior, &ps)).unwrap();
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].id, "reason");
        assert_eq!(plan.build_upon, vec!["r1-impl", "r1-reason", "r2-impl"]);
    }

    #[test]
    fn test_synthesize_falls_back_to_first_active() {
        let ps = vec![
            participant("x", ParticipantRole::Innovator),
            participant("y", ParticipantRole::Reviewer),
        ];
        let chosen = choose_synthesizer(&ps, &[ParticipantRole::Reasoner]).unwrap();
        assert_eq!(chosen.id, "x");
        assert!(choose_synthesizer(&[], &[]).is_none());
    }

    #[test]
    fn test_synthesize_needs_contributions() {
        let req = CollaborationRequest::new("x");
        let ps = vec![participant("a", ParticipantRole::Generalist)];
        let prior = vec![round(1, &[]), round(2, &[])];
        let err = plan(&input(3, &req, &prior, &ps)).unwrap_err();
        assert!(err.to_string().contains(NO_CONTRIBUTIONS_TO_SYNTHESIZE));
    }

    #[test]
    fn test_validate_excludes_synthesizer() {
        let req = CollaborationRequest::new("x");
        let ps = vec![
            participant("a", ParticipantRole::Reasoner),
            participant("b", ParticipantRole::Implementer),
        ];
        let mut prior = vec![round(1, &["a", "b"]), round(2, &["a", "b"]), round(3, &["a"])];
        let plan4 = plan(&input(4, &req, &prior, &ps)).unwrap();
        assert_eq!(plan4.targets.len(), 1);
        assert_eq!(plan4.targets[0].id, "b");
        assert_eq!(plan4.build_upon, vec!["r3-a"]);

        // a later validate round checks the same synthesis
        prior.push(round(4, &["b"]));
        let plan5 = plan(&input(5, &req, &prior, &ps)).unwrap();
        assert_eq!(plan5.build_upon, vec!["r3-a"]);
    }

    #[test]
    fn test_validate_without_synthesis_fails() {
        let req = CollaborationRequest::new("x");
        let ps = vec![participant("a", ParticipantRole::Reasoner)];
        let prior = vec![round(1, &["a"]), round(2, &["a"]), round(3, &[])];
        let err = plan(&input(4, &req, &prior, &ps)).unwrap_err();
        assert!(err.to_string().contains(NO_SYNTHESIS_TO_VALIDATE));
    }
}
