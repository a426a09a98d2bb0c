//! Round executor.
//!
//! ```text
//! plan (under session lock) ──► RoundStarted
//!        │
//!        ▼
//! JoinSet fan-out ──► contribution appended as each call completes
//!        │                      (completion order)
//!        ├── all calls done ─────────► Completed
//!        └── round/session deadline ─► Timeout (calls detached, not aborted)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::{self, PlanInput, RoundPlan};
use crate::config::EngineConfig;
use crate::deadline::{DeadlineCallbacks, DeadlineManager};
use crate::error::{CollabError, CollabResult, ResponderError, TimeoutScope};
use crate::events::{SessionEvent, SharedEventStream};
use crate::registry::ResponderRegistry;
use crate::responder::{extract_confidence, Responder};
use crate::session::{
    estimate_tokens, lock_session, Contribution, ContributionMetadata, Participant, PhaseKind,
    Round, RoundStatus, SharedSession,
};

/// Result of a round that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub number: u32,
    pub phase: PhaseKind,
    pub status: RoundStatus,
    /// Contributions recorded in this round.
    pub contributions: usize,
    pub failed_calls: usize,
}

struct CallOutcome {
    participant: Participant,
    result: Result<String, ResponderError>,
    latency: Duration,
    retries: u32,
}

/// Identifies the round being executed.
struct ActiveRound {
    session_id: String,
    round_id: String,
    number: u32,
    index: usize,
}

/// Executes one phase of collaboration against a shared session.
pub struct RoundEngine {
    responder: Arc<dyn Responder>,
    registry: Arc<ResponderRegistry>,
    deadlines: Arc<DeadlineManager>,
    config: Arc<EngineConfig>,
}

impl RoundEngine {
    pub fn new(
        responder: Arc<dyn Responder>,
        registry: Arc<ResponderRegistry>,
        deadlines: Arc<DeadlineManager>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            responder,
            registry,
            deadlines,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run round `number` of the session.
    ///
    /// The round is appended to `session.rounds` before any call is made and
    /// contributions are appended as they arrive, so a timed-out round keeps
    /// what already came back. Errors:
    /// - `RoundData` when the phase's preconditions are unmet (critical if the
    ///   phase is listed in `critical_phases`)
    /// - `Timeout` when the round deadline or `cancel` fired first
    pub async fn run_round(
        &self,
        session: &SharedSession,
        events: &SharedEventStream,
        number: u32,
        cancel: &CancellationToken,
    ) -> CollabResult<RoundOutcome> {
        let phase = PhaseKind::for_round(number);
        let deadline = self.config.round_deadlines.for_phase(phase);
        let (active, plan) = self.plan_round(session, events, number, phase, deadline)?;

        info!(
            session_id = %active.session_id,
            round = number,
            %phase,
            targets = plan.targets.len(),
            deadline_ms = deadline.as_millis() as u64,
            "Round started"
        );
        events.publish(SessionEvent::RoundStarted {
            session_id: active.session_id.clone(),
            round: number,
            phase,
            targets: plan.targets.iter().map(|p| p.id.clone()).collect(),
            deadline_ms: deadline.as_millis() as u64,
            timestamp: Utc::now(),
        });
        if plan.targets.is_empty() {
            warn!(session_id = %active.session_id, round = number, %phase, "No participants to call");
        }

        let round_cancel = cancel.child_token();
        let handle = self.deadlines.start(
            format!("{}/round-{}", active.session_id, number),
            deadline,
            round_callbacks(&active, events, &round_cancel),
        );

        let prompt: Arc<str> = Arc::from(plan.prompt.as_str());
        let mut join_set: JoinSet<CallOutcome> = JoinSet::new();
        for participant in plan.targets.iter().cloned() {
            join_set.spawn(call_with_retries(
                self.responder.clone(),
                participant,
                prompt.clone(),
                self.config.max_retries,
                self.config.retry_backoff(),
                round_cancel.clone(),
            ));
        }

        let mut received = 0usize;
        let mut failed = 0usize;
        let timed_out = loop {
            tokio::select! {
                biased;
                _ = round_cancel.cancelled() => break true,
                next = join_set.join_next() => match next {
                    None => break false,
                    Some(Ok(outcome)) => {
                        if self.record(session, events, &active, &plan, outcome) {
                            received += 1;
                        } else {
                            failed += 1;
                        }
                    }
                    Some(Err(e)) => {
                        failed += 1;
                        warn!(session_id = %active.session_id, round = number, error = %e, "Responder task panicked");
                    }
                },
            }
        };
        if timed_out {
            // In-flight calls finish on their own; their results are ignored.
            join_set.detach_all();
        }
        self.deadlines.stop(handle);

        let status = if timed_out {
            RoundStatus::Timeout
        } else {
            RoundStatus::Completed
        };
        let finalized = {
            let mut s = lock_session(session);
            let finalized = s.is_finalized();
            if !finalized {
                if let Some(round) = s.rounds.get_mut(active.index) {
                    round.status = status;
                    round.ended_at = Some(Utc::now());
                }
            }
            finalized
        };
        if !finalized {
            events.publish(SessionEvent::RoundCompleted {
                session_id: active.session_id.clone(),
                round: number,
                phase,
                status,
                contributions: received,
                timestamp: Utc::now(),
            });
        }

        if timed_out {
            let scope = if cancel.is_cancelled() {
                TimeoutScope::Session
            } else {
                TimeoutScope::Round
            };
            warn!(
                session_id = %active.session_id,
                round = number,
                %phase,
                %scope,
                kept = received,
                "Round stopped by deadline"
            );
            return Err(CollabError::Timeout {
                session_id: active.session_id,
                scope,
                round: Some(number),
            });
        }

        info!(
            session_id = %active.session_id,
            round = number,
            %phase,
            contributions = received,
            failed,
            "Round completed"
        );
        Ok(RoundOutcome {
            number,
            phase,
            status,
            contributions: received,
            failed_calls: failed,
        })
    }

    /// Check preconditions and append the round to the session.
    fn plan_round(
        &self,
        session: &SharedSession,
        events: &SharedEventStream,
        number: u32,
        phase: PhaseKind,
        deadline: Duration,
    ) -> CollabResult<(ActiveRound, RoundPlan)> {
        let mut s = lock_session(session);
        if s.is_finalized() || !s.status.is_running() {
            return Err(CollabError::Internal(format!(
                "session {} is not running ({})",
                s.id, s.status
            )));
        }

        let planned = planner::plan(&PlanInput {
            session_id: &s.id,
            number,
            phase,
            request: &s.request,
            prior_rounds: &s.rounds,
            participants: &s.participants,
            synthesizer_roles: &self.config.synthesizer_roles,
        });

        let mut round = Round::new(number, deadline);
        round.started_at = Some(Utc::now());
        let active = ActiveRound {
            session_id: s.id.clone(),
            round_id: round.id.clone(),
            number,
            index: s.rounds.len(),
        };

        match planned {
            Ok(plan) => {
                round.status = RoundStatus::Running;
                s.rounds.push(round);
                Ok((active, plan))
            }
            Err(err) => {
                let err = if self.config.is_critical_phase(phase) {
                    err.into_critical()
                } else {
                    err
                };
                let reason = match &err {
                    CollabError::RoundData { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                round.status = RoundStatus::Failed;
                round.failure = Some(reason.clone());
                round.ended_at = Some(Utc::now());
                s.rounds.push(round);
                drop(s);

                warn!(
                    session_id = %active.session_id,
                    round = number,
                    %phase,
                    critical = err.is_critical(),
                    %reason,
                    "Round cannot run"
                );
                events.publish(SessionEvent::RoundFailed {
                    session_id: active.session_id,
                    round: number,
                    phase,
                    reason,
                    critical: err.is_critical(),
                    timestamp: Utc::now(),
                });
                Err(err)
            }
        }
    }

    /// Record one finished call. Returns whether a contribution was added.
    fn record(
        &self,
        session: &SharedSession,
        events: &SharedEventStream,
        active: &ActiveRound,
        plan: &RoundPlan,
        outcome: CallOutcome,
    ) -> bool {
        let latency_ms = outcome.latency.as_millis() as u64;
        let author = outcome.participant;
        match outcome.result {
            Ok(content) => {
                self.registry.record_success(&author.id, latency_ms);
                let confidence =
                    extract_confidence(&content).unwrap_or(self.config.default_confidence);
                let contribution = Contribution {
                    id: uuid::Uuid::new_v4().to_string(),
                    round_id: active.round_id.clone(),
                    round_number: active.number,
                    author_id: author.id.clone(),
                    author_provider: author.provider.clone(),
                    tokens: estimate_tokens(&content),
                    content,
                    confidence,
                    build_upon: plan.build_upon.clone(),
                    critiques: plan.critiques.clone(),
                    timestamp: Utc::now(),
                    metadata: ContributionMetadata {
                        latency_ms,
                        retry_count: outcome.retries,
                        model: author.model.clone(),
                    },
                };
                let event = SessionEvent::ContributionReceived {
                    session_id: active.session_id.clone(),
                    round: active.number,
                    contribution_id: contribution.id.clone(),
                    author_id: author.id.clone(),
                    confidence,
                    tokens: contribution.tokens,
                    latency_ms,
                    timestamp: Utc::now(),
                };
                {
                    let mut s = lock_session(session);
                    if s.is_finalized() {
                        debug!(session_id = %active.session_id, responder = %author.id, "Dropping contribution after finalization");
                        return false;
                    }
                    match s.rounds.get_mut(active.index) {
                        Some(round) => round.contributions.push(contribution),
                        None => return false,
                    }
                }
                debug!(
                    session_id = %active.session_id,
                    round = active.number,
                    responder = %author.id,
                    latency_ms,
                    retries = outcome.retries,
                    "Contribution received"
                );
                events.publish(event);
                true
            }
            Err(source) => {
                self.registry.record_failure(&author.id, &source.to_string());
                let err = CollabError::Provider {
                    responder_id: author.id.clone(),
                    source,
                };
                warn!(
                    session_id = %active.session_id,
                    round = active.number,
                    responder = %author.id,
                    retries = outcome.retries,
                    error = %err,
                    "Responder call failed"
                );
                let dropped = !self.registry.is_available(&author.id);
                {
                    let mut s = lock_session(session);
                    if !s.is_finalized() {
                        s.metrics.failed_calls += 1;
                        if dropped {
                            s.deactivate_participant(&author.id);
                        }
                    }
                }
                if dropped {
                    warn!(
                        session_id = %active.session_id,
                        responder = %author.id,
                        "Responder unavailable; leaving it out of later rounds"
                    );
                }
                events.publish(SessionEvent::ContributionFailed {
                    session_id: active.session_id.clone(),
                    round: active.number,
                    responder_id: author.id,
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                false
            }
        }
    }
}

fn round_callbacks(
    active: &ActiveRound,
    events: &SharedEventStream,
    round_cancel: &CancellationToken,
) -> DeadlineCallbacks {
    let number = active.number;
    let warn_session = active.session_id.clone();
    let warn_events = events.clone();
    let expire_session = active.session_id.clone();
    let expire_token = round_cancel.clone();
    DeadlineCallbacks::new()
        .on_warning(move |w| {
            warn_events.publish(SessionEvent::DeadlineWarning {
                session_id: warn_session.clone(),
                scope: TimeoutScope::Round,
                round: Some(number),
                fraction: w.fraction,
                remaining_ms: w.remaining.as_millis() as u64,
                timestamp: Utc::now(),
            });
        })
        .on_expire(move |_| {
            debug!(session_id = %expire_session, round = number, "Round deadline expired");
            expire_token.cancel();
        })
}

/// One responder call with retries for retriable errors.
///
/// No new attempt starts once `cancel` fired; an attempt already in flight
/// is never interrupted.
async fn call_with_retries(
    responder: Arc<dyn Responder>,
    participant: Participant,
    prompt: Arc<str>,
    max_retries: u32,
    backoff: Duration,
    cancel: CancellationToken,
) -> CallOutcome {
    let start = Instant::now();
    let mut retries = 0;
    let result = loop {
        let attempt = responder
            .generate_response(&participant.id, &prompt)
            .await
            .and_then(|text| {
                if text.trim().is_empty() {
                    Err(ResponderError::EmptyResponse)
                } else {
                    Ok(text)
                }
            });
        match attempt {
            Err(e) if e.is_retriable() && retries < max_retries && !cancel.is_cancelled() => {
                retries += 1;
                let wait = match &e {
                    ResponderError::RateLimited(after) => (*after).max(backoff),
                    _ => backoff,
                };
                debug!(
                    responder = %participant.id,
                    attempt = retries,
                    error = %e,
                    wait_ms = wait.as_millis() as u64,
                    "Retrying responder call"
                );
                tokio::time::sleep(wait).await;
            }
            other => break other,
        }
    };
    CallOutcome {
        participant,
        result,
        latency: start.elapsed(),
        retries,
    }
}
