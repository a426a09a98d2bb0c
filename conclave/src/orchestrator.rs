//! Session Orchestrator: lifecycle, round loop and finalization.
//!
//! ```text
//!                 start_session
//!                      │ validate + select participants
//!                      ▼
//!   initializing ──► active ──┬──► consensus_reached ──┐
//!                      ▲  │   ├──► completed ──────────┤ finalize (once)
//!                      └──┘   └──► timeout ────────────┘     │
//!                 round N done                               ▼
//!                                                        completed + Output
//! ```
//!
//! Each session runs its round loop on its own task. The session deadline's
//! expiry callback moves the session to `timeout` and cancels the loop, which
//! then finalizes whatever rounds exist.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::consensus::{ConsensusOutcome, ConsensusPolicy};
use crate::deadline::{DeadlineCallbacks, DeadlineManager};
use crate::error::{CollabError, CollabResult, TimeoutScope};
use crate::events::{EventStream, SessionEvent, SharedEventStream};
use crate::knowledge::{JsonlKnowledgeStore, KnowledgeStore};
use crate::registry::{ResponderRegistry, SelectionCriteria};
use crate::responder::Responder;
use crate::round::RoundEngine;
use crate::session::{
    lock_session, CollaborationRequest, EndReason, RoundStatus, Session, SessionId,
    SessionStatus, SharedSession,
};
use crate::synthesis::{synthesize, Output};

/// Everything the orchestrator keeps per session.
struct SessionSlot {
    session: SharedSession,
    events: SharedEventStream,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl SessionSlot {
    fn snapshot(&self) -> Session {
        lock_session(&self.session).clone()
    }

    /// Leave `active` for `to` unless something else already did.
    fn settle(&self, to: SessionStatus, reason: EndReason) -> bool {
        let mut s = lock_session(&self.session);
        if s.status != SessionStatus::Active || s.is_finalized() {
            return false;
        }
        let note = reason.to_string();
        match s.transition(to, &note) {
            Ok(()) => {
                s.end_reason = Some(reason);
                true
            }
            Err(e) => {
                error!(session_id = %s.id, error = %e, "Rejected status transition");
                false
            }
        }
    }
}

/// Collaborators shared with every session task.
struct Core {
    config: Arc<EngineConfig>,
    registry: Arc<ResponderRegistry>,
    deadlines: Arc<DeadlineManager>,
    engine: RoundEngine,
    consensus: Arc<dyn ConsensusPolicy>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
}

type SessionTable = HashMap<SessionId, Arc<SessionSlot>>;

/// Builds a [`SessionOrchestrator`]; unset collaborators are derived from
/// the configuration.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    responder: Arc<dyn Responder>,
    registry: Option<Arc<ResponderRegistry>>,
    deadlines: Option<Arc<DeadlineManager>>,
    consensus: Option<Arc<dyn ConsensusPolicy>>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
}

impl OrchestratorBuilder {
    pub fn registry(mut self, registry: Arc<ResponderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn deadline_manager(mut self, deadlines: Arc<DeadlineManager>) -> Self {
        self.deadlines = Some(deadlines);
        self
    }

    pub fn consensus_policy(mut self, policy: Arc<dyn ConsensusPolicy>) -> Self {
        self.consensus = Some(policy);
        self
    }

    pub fn knowledge_store(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(store);
        self
    }

    pub fn build(self) -> CollabResult<SessionOrchestrator> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ResponderRegistry::from_configs(&config.responders)));
        let deadlines = self.deadlines.unwrap_or_else(|| {
            Arc::new(DeadlineManager::with_warning_fractions(&config.warning_fractions))
        });
        let consensus = self.consensus.unwrap_or_else(|| config.consensus.build());
        let knowledge = self.knowledge.or_else(|| {
            config.knowledge_store_path.as_ref().map(|path| {
                Arc::new(JsonlKnowledgeStore::new(path.clone())) as Arc<dyn KnowledgeStore>
            })
        });
        let engine = RoundEngine::new(
            self.responder,
            registry.clone(),
            deadlines.clone(),
            config.clone(),
        );
        info!(
            responders = registry.len(),
            consensus = consensus.name(),
            round_limit = config.round_limit,
            "Session orchestrator ready"
        );
        Ok(SessionOrchestrator {
            core: Arc::new(Core {
                config,
                registry,
                deadlines,
                engine,
                consensus,
                knowledge,
            }),
            sessions: RwLock::new(HashMap::new()),
        })
    }
}

/// Public entry point: start, observe and finalize collaboration sessions.
pub struct SessionOrchestrator {
    core: Arc<Core>,
    sessions: RwLock<SessionTable>,
}

/// Reject malformed requests before anything is created.
///
/// Priority needs no check here: it is an enum, and out-of-range text is
/// rejected when parsed.
pub fn validate_request(request: &CollaborationRequest, config: &EngineConfig) -> CollabResult<()> {
    if request.prompt.trim().is_empty() {
        return Err(CollabError::Validation("prompt must not be empty".into()));
    }
    if let Some(limit) = request.time_limit() {
        if limit < config.min_time_limit() {
            return Err(CollabError::Validation(format!(
                "time limit {}ms is below the minimum of {}ms",
                limit.as_millis(),
                config.min_time_limit_ms
            )));
        }
    }
    if request.max_rounds == Some(0) {
        return Err(CollabError::Validation("max_rounds must be at least 1".into()));
    }
    if request.cost_budget == Some(0) {
        return Err(CollabError::Validation("cost_budget must be positive".into()));
    }
    if request.responders.as_ref().is_some_and(|ids| ids.is_empty()) {
        return Err(CollabError::Validation(
            "responders, when given, must name at least one responder".into(),
        ));
    }
    Ok(())
}

impl SessionOrchestrator {
    pub fn builder(config: EngineConfig, responder: Arc<dyn Responder>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            responder,
            registry: None,
            deadlines: None,
            consensus: None,
            knowledge: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Arc<ResponderRegistry> {
        &self.core.registry
    }

    pub fn deadline_manager(&self) -> &Arc<DeadlineManager> {
        &self.core.deadlines
    }

    /// Rounds a request will run: its cap (or the default) clamped to the
    /// round limit.
    pub fn effective_max_rounds(&self, request: &CollaborationRequest) -> u32 {
        request
            .max_rounds
            .unwrap_or(self.core.config.default_max_rounds)
            .min(self.core.config.round_limit)
    }

    /// Validate, select participants, start the session deadline and spawn
    /// the round loop. Returns the session as it is on activation.
    pub fn start_session(&self, request: CollaborationRequest) -> CollabResult<Session> {
        let core = &self.core;
        validate_request(&request, &core.config)?;

        let criteria = SelectionCriteria::from_request(&request, core.config.max_participants);
        let participants = core.registry.select(&criteria);
        if participants.is_empty() {
            warn!(requested = ?request.responders, "No responders available for request");
            return Err(CollabError::NoParticipants);
        }

        let max_rounds = self.effective_max_rounds(&request);
        let time_limit = request
            .time_limit()
            .unwrap_or_else(|| core.config.default_time_limit());
        let participant_ids: Vec<String> = participants.iter().map(|p| p.id.clone()).collect();

        let mut session = Session::new(request, participants);
        session.transition(SessionStatus::Active, "participants selected")?;
        let session_id = session.id.clone();
        core.registry.acquire(&participant_ids);

        let (done, _) = watch::channel(false);
        let slot = Arc::new(SessionSlot {
            session: Arc::new(Mutex::new(session)),
            events: EventStream::new().shared(),
            cancel: CancellationToken::new(),
            done,
        });

        let handle = core.deadlines.start(
            format!("{}/session", session_id),
            time_limit,
            session_callbacks(&slot, &session_id),
        );
        lock_session(&slot.session).deadline = Some(handle);

        self.write().insert(session_id.clone(), slot.clone());

        info!(
            session_id = %session_id,
            participants = ?participant_ids,
            max_rounds,
            time_limit_ms = time_limit.as_millis() as u64,
            "Session started"
        );
        slot.events.publish(SessionEvent::SessionStarted {
            session_id: session_id.clone(),
            participants: participant_ids,
            max_rounds,
            time_limit_ms: time_limit.as_millis() as u64,
            timestamp: Utc::now(),
        });

        let snapshot = slot.snapshot();
        tokio::spawn(run_session(core.clone(), slot, max_rounds));
        Ok(snapshot)
    }

    /// Finalize now. A running session is cancelled and ends with
    /// [`EndReason::Manual`]; a finished one returns its existing output.
    pub async fn complete_session(&self, session_id: &str) -> CollabResult<Output> {
        let slot = self.slot(session_id)?;
        if let Some(output) = lock_session(&slot.session).output.clone() {
            return Ok(output);
        }
        if slot.settle(SessionStatus::Completed, EndReason::Manual) {
            info!(session_id, "Session completed on request");
        }
        slot.cancel.cancel();
        Ok(finalize(&self.core, &slot).await)
    }

    /// Wait until the session is finalized and return its output.
    pub async fn wait_for_completion(&self, session_id: &str) -> CollabResult<Output> {
        let slot = self.slot(session_id)?;
        let mut rx = slot.done.subscribe();
        rx.wait_for(|done| *done)
            .await
            .map_err(|_| CollabError::Internal(format!("session {session_id} was dropped")))?;
        let output = lock_session(&slot.session).output.clone();
        output.ok_or_else(|| CollabError::Internal(format!("session {session_id} has no output")))
    }

    /// Like [`wait_for_completion`](Self::wait_for_completion), giving up
    /// after `timeout`. Gives `Ok(None)` if the session is still running.
    pub async fn wait_for_completion_timeout(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> CollabResult<Option<Output>> {
        match tokio::time::timeout(timeout, self.wait_for_completion(session_id)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.read().get(session_id).map(|slot| slot.snapshot())
    }

    /// Sessions not yet finalized.
    pub fn get_active_sessions(&self) -> Vec<Session> {
        self.read()
            .values()
            .map(|slot| slot.snapshot())
            .filter(|s| !s.is_finalized())
            .collect()
    }

    /// Every session still held, finalized or not.
    pub fn sessions(&self) -> Vec<Session> {
        self.read().values().map(|slot| slot.snapshot()).collect()
    }

    /// Events so far plus a receiver for what follows.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> CollabResult<(Vec<SessionEvent>, broadcast::Receiver<SessionEvent>)> {
        Ok(self.slot(session_id)?.events.subscribe_with_history())
    }

    /// The session's event stream.
    pub fn events(&self, session_id: &str) -> CollabResult<SharedEventStream> {
        Ok(self.slot(session_id)?.events.clone())
    }

    /// Stop every timer, cancel running sessions and clear the registry.
    ///
    /// Cancelled sessions finalize in the background but are no longer
    /// reachable through this orchestrator.
    pub fn dispose(&self) {
        let slots: Vec<Arc<SessionSlot>> = self.write().drain().map(|(_, slot)| slot).collect();
        self.core.deadlines.stop_all();
        for slot in &slots {
            slot.settle(SessionStatus::Completed, EndReason::Manual);
            slot.cancel.cancel();
        }
        info!(sessions = slots.len(), "Orchestrator disposed");
    }

    fn slot(&self, session_id: &str) -> CollabResult<Arc<SessionSlot>> {
        self.read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CollabError::NotFound(session_id.to_string()))
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionTable> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionTable> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn session_callbacks(slot: &Arc<SessionSlot>, session_id: &str) -> DeadlineCallbacks {
    let warn_slot = slot.clone();
    let warn_id = session_id.to_string();
    let expire_slot = slot.clone();
    let expire_id = session_id.to_string();
    DeadlineCallbacks::new()
        .on_warning(move |w| {
            debug!(session_id = %warn_id, fraction = w.fraction, "Session deadline warning");
            warn_slot.events.publish(SessionEvent::DeadlineWarning {
                session_id: warn_id.clone(),
                scope: TimeoutScope::Session,
                round: None,
                fraction: w.fraction,
                remaining_ms: w.remaining.as_millis() as u64,
                timestamp: Utc::now(),
            });
        })
        .on_expire(move |_| {
            if expire_slot.settle(SessionStatus::Timeout, EndReason::Timeout) {
                let rounds_started = lock_session(&expire_slot.session).rounds.len();
                warn!(session_id = %expire_id, rounds_started, "Session deadline expired");
                expire_slot.events.publish(SessionEvent::SessionTimedOut {
                    session_id: expire_id.clone(),
                    rounds_started,
                    timestamp: Utc::now(),
                });
            }
            expire_slot.cancel.cancel();
        })
}

/// The round loop of one session, ending in finalization.
async fn run_session(core: Arc<Core>, slot: Arc<SessionSlot>, max_rounds: u32) {
    let session_id = lock_session(&slot.session).id.clone();

    for number in 1..=max_rounds {
        if slot.cancel.is_cancelled() {
            break;
        }
        match core
            .engine
            .run_round(&slot.session, &slot.events, number, &slot.cancel)
            .await
        {
            Ok(outcome) => {
                debug!(session_id = %session_id, round = number, contributions = outcome.contributions, "Round finished");
            }
            Err(_) if slot.cancel.is_cancelled() => break,
            Err(e) if e.is_critical() => {
                error!(session_id = %session_id, round = number, error = %e, "Critical round failure; aborting session");
                slot.settle(
                    SessionStatus::Completed,
                    EndReason::Aborted {
                        reason: e.to_string(),
                    },
                );
                break;
            }
            Err(CollabError::Timeout {
                scope: TimeoutScope::Session,
                ..
            }) => break,
            Err(e) => {
                warn!(session_id = %session_id, round = number, error = %e, "Round failed; continuing");
            }
        }
        if slot.cancel.is_cancelled() {
            break;
        }
        if check_early_exit(&core, &slot, number) {
            break;
        }
        if number < max_rounds {
            let mut s = lock_session(&slot.session);
            if s.status == SessionStatus::Active {
                let note = format!("round {} finished", number);
                if let Err(e) = s.transition(SessionStatus::Active, &note) {
                    error!(session_id = %session_id, error = %e, "Rejected status transition");
                }
            }
        }
    }

    slot.settle(SessionStatus::Completed, EndReason::RoundBudgetExhausted);
    finalize(&core, &slot).await;
}

/// Consensus first, then the quality threshold.
fn check_early_exit(core: &Core, slot: &SessionSlot, number: u32) -> bool {
    let (session_id, consensus, quality) = {
        let s = lock_session(&slot.session);
        let consensus = core.consensus.evaluate(&s.rounds);
        let contributions: Vec<f64> = s.contributions().map(|c| c.confidence).collect();
        let quality = (!contributions.is_empty())
            .then(|| contributions.iter().sum::<f64>() / contributions.len() as f64);
        (s.id.clone(), consensus, quality)
    };

    if let ConsensusOutcome::Reached { agreement } = consensus {
        if slot.settle(SessionStatus::ConsensusReached, EndReason::ConsensusReached) {
            info!(session_id = %session_id, round = number, agreement, policy = core.consensus.name(), "Consensus reached");
            slot.events.publish(SessionEvent::ConsensusReached {
                session_id,
                round: number,
                agreement,
                timestamp: Utc::now(),
            });
        }
        return true;
    }

    if let (Some(threshold), Some(quality)) = (core.config.quality_threshold, quality) {
        if quality >= threshold {
            if slot.settle(SessionStatus::Completed, EndReason::QualityThreshold) {
                info!(session_id = %session_id, round = number, quality, threshold, "Quality threshold met");
            }
            return true;
        }
    }
    false
}

/// Produce the output exactly once and release the session's resources.
async fn finalize(core: &Core, slot: &SessionSlot) -> Output {
    let (output, participant_ids, deadline) = {
        let mut s = lock_session(&slot.session);
        if let Some(output) = &s.output {
            return output.clone();
        }
        let now = Utc::now();
        for round in s.rounds.iter_mut().filter(|r| !r.is_finished()) {
            round.status = RoundStatus::Timeout;
            round.ended_at = Some(now);
        }
        if s.status.is_running() {
            s.end_reason.get_or_insert(EndReason::Manual);
        }
        if s.status != SessionStatus::Completed {
            if let Err(e) = s.transition(SessionStatus::Completed, "finalized") {
                error!(session_id = %s.id, error = %e, "Rejected status transition");
            }
        }
        s.ended_at = Some(now);
        s.refresh_metrics();
        let output = synthesize(&s, core.config.cost_per_token);
        s.output = Some(output.clone());
        let ids: Vec<String> = s.participants.iter().map(|p| p.id.clone()).collect();
        (output, ids, s.deadline.take())
    };

    slot.cancel.cancel();
    if let Some(handle) = deadline {
        core.deadlines.stop(handle);
    }
    core.registry.release(&participant_ids);

    if let Some(store) = &core.knowledge {
        let metadata = serde_json::json!({
            "quality_score": output.quality_score,
            "consensus_level": output.consensus_level,
            "total_tokens": output.token_usage.total,
            "end_reason": output.end_reason,
            "participants": participant_ids,
            "rounds": output.rounds.len(),
        });
        let text = format!("{}\n\n{}", output.summary(), output.content);
        if let Err(e) = store.add_document(&output.session_id, &text, metadata).await {
            warn!(session_id = %output.session_id, error = %e, "Failed to store session summary");
        }
    }

    info!(
        session_id = %output.session_id,
        end_reason = ?output.end_reason,
        quality = output.quality_score,
        tokens = output.token_usage.total,
        rounds = output.rounds.len(),
        "Session finalized"
    );
    slot.events.publish(SessionEvent::SessionCompleted {
        session_id: output.session_id.clone(),
        end_reason: output.end_reason.clone().unwrap_or(EndReason::Manual),
        quality_score: output.quality_score,
        total_tokens: output.token_usage.total,
        timestamp: Utc::now(),
    });
    slot.done.send_replace(true);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            min_time_limit_ms: 10_000,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_validation_rejects_blank_prompt() {
        let err = validate_request(&CollaborationRequest::new("   \n\t"), &config()).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_validation_rejects_short_time_limit() {
        let req = CollaborationRequest::new("x").with_time_limit(Duration::from_secs(5));
        let err = validate_request(&req, &config()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("minimum"));

        let ok = CollaborationRequest::new("x").with_time_limit(Duration::from_secs(10));
        assert!(validate_request(&ok, &config()).is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_rounds_and_budget() {
        let req = CollaborationRequest::new("x").with_max_rounds(0);
        assert!(validate_request(&req, &config()).unwrap_err().is_validation());
        let req = CollaborationRequest::new("x").with_cost_budget(0);
        assert!(validate_request(&req, &config()).unwrap_err().is_validation());
        let req = CollaborationRequest::new("x").with_responders(Vec::<String>::new());
        assert!(validate_request(&req, &config()).unwrap_err().is_validation());
    }
}
