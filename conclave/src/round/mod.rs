//! Round Engine: one timed phase of collaboration.
//!
//! | Round | Phase      | Targets                         | References             |
//! |-------|------------|---------------------------------|------------------------|
//! | 1     | propose    | every active participant        | none                   |
//! | 2     | critique   | every active participant        | previous round (both)  |
//! | 3     | synthesize | the designated synthesizer      | every prior contribution |
//! | 4+    | validate   | active participants but the synthesizer | the synthesis  |

pub mod engine;
pub mod planner;
pub mod prompts;

pub use engine::{RoundEngine, RoundOutcome};
pub use planner::{
    choose_synthesizer, plan, synthesis_under_validation, PlanInput, RoundPlan,
    NO_ACTIVE_PARTICIPANTS, NO_CONTRIBUTIONS_TO_SYNTHESIZE, NO_PREVIOUS_CONTRIBUTIONS,
    NO_SYNTHESIS_TO_VALIDATE,
};
