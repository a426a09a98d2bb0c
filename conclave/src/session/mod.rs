//! Session data model.
//!
//! ```text
//! Session ─┬─ participants: Vec<Participant>
//!          └─ rounds: Vec<Round> ── contributions: Vec<Contribution>
//! ```

pub mod state;
pub mod types;

use std::sync::{Arc, Mutex, MutexGuard};

pub use state::{EndReason, Session, SessionMetrics, SessionStatus, StatusTransition};
pub use types::{
    estimate_tokens, CollaborationRequest, Contribution, ContributionId, ContributionMetadata,
    Participant, ParticipantRole, PhaseKind, Priority, Round, RoundStatus, SessionId,
};

/// A session shared between its orchestration task, the round engine and
/// deadline callbacks. Never hold the guard across an `.await`.
pub type SharedSession = Arc<Mutex<Session>>;

/// Lock a shared session, recovering the data if a holder panicked.
pub fn lock_session(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}
