//! Session events.
//!
//! Each session owns one [`EventStream`]. Producers (the orchestrator and
//! the round engine) publish typed [`SessionEvent`]s; observers subscribe
//! and may replay the history they missed.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Orchestrator │────▶│ EventStream  │────▶│  Subscribers │
//! │ Round Engine │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │   history    │
//!                      │   (replay)   │
//!                      └──────────────┘
//! ```

pub mod stream;
pub mod types;

pub use stream::{EventStream, SharedEventStream};
pub use types::SessionEvent;
