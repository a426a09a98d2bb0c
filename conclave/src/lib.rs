//! Conclave: timed multi-responder collaboration sessions.
//!
//! A caller submits a [`CollaborationRequest`]; the [`SessionOrchestrator`]
//! selects responders from the [`ResponderRegistry`] and runs up to four
//! rounds against them, each under its own deadline:
//!
//! 1. **propose** – every participant answers independently
//! 2. **critique** – every participant reviews round 1
//! 3. **synthesize** – one participant merges everything so far
//! 4. **validate** – the others check the synthesis
//!
//! The loop stops early on consensus, on a quality threshold, on a critical
//! round failure or when the session deadline expires. Whatever rounds exist
//! are then folded into a single [`Output`] exactly once.
//!
//! # Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use conclave::{CollaborationRequest, EngineConfig, ResponderRouter, SessionOrchestrator};
//! # async fn run(router: ResponderRouter) -> Result<(), conclave::CollabError> {
//! let config = EngineConfig::from_env()?;
//! let orchestrator = SessionOrchestrator::builder(config, Arc::new(router)).build()?;
//! let session = orchestrator.start_session(CollaborationRequest::new("Build a login form"))?;
//! let output = orchestrator.wait_for_completion(&session.id).await?;
//! println!("{}", output.content);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod consensus;
pub mod deadline;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod orchestrator;
pub mod registry;
pub mod responder;
pub mod round;
pub mod session;
pub mod synthesis;

pub use config::{EngineConfig, ResponderConfig, RoundDeadlines};
pub use consensus::{ConsensusLevel, ConsensusOutcome, ConsensusPolicy};
pub use deadline::{DeadlineCallbacks, DeadlineHandle, DeadlineManager, DeadlineWarning};
pub use error::{CollabError, CollabResult, ResponderError, TimeoutScope};
pub use events::{EventStream, SessionEvent, SharedEventStream};
pub use knowledge::{InMemoryKnowledgeStore, JsonlKnowledgeStore, KnowledgeStore};
pub use orchestrator::{validate_request, OrchestratorBuilder, SessionOrchestrator};
pub use registry::{ResponderProfile, ResponderRegistry, SelectionCriteria};
pub use responder::{extract_confidence, HttpEndpoint, HttpResponder, Responder, ResponderRouter};
pub use round::{RoundEngine, RoundOutcome};
pub use session::{
    CollaborationRequest, Contribution, EndReason, Participant, ParticipantRole, PhaseKind,
    Priority, Round, RoundStatus, Session, SessionStatus,
};
pub use synthesis::{synthesize, Output, TokenUsage, NO_OUTPUT_MARKER};
