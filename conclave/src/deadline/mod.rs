//! Deadline manager: countdown timers with warning and expiry callbacks.
//!
//! Every timer is identified by an opaque [`DeadlineHandle`]. A timer fires
//! one warning per configured fraction of its window (75% and 90% by default)
//! followed by a single expiry callback.
//!
//! ```text
//! start ──► [75% warning] ──► [90% warning] ──► expiry
//!   │                                              │
//!   └── extend: reset warnings, new window ────────┘
//!   └── stop:   cancel everything (idempotent)
//! ```
//!
//! None of the operations fail. Unknown handles behave like expired ones.
//! Each orchestrator owns its own manager, so timer state is never shared
//! between orchestrators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Warning points as fractions of the timer window.
pub const DEFAULT_WARNING_FRACTIONS: [f64; 2] = [0.75, 0.90];

/// Opaque timer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeadlineHandle(u64);

impl std::fmt::Display for DeadlineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline-{}", self.0)
    }
}

/// Payload passed to warning callbacks.
#[derive(Debug, Clone)]
pub struct DeadlineWarning {
    pub handle: DeadlineHandle,
    pub label: String,
    /// Fraction of the window that has elapsed (e.g. 0.75).
    pub fraction: f64,
    pub remaining: Duration,
}

pub type WarningCallback = Arc<dyn Fn(DeadlineWarning) + Send + Sync>;
pub type ExpiryCallback = Arc<dyn Fn(DeadlineHandle) + Send + Sync>;

/// Optional callbacks attached to a timer.
#[derive(Clone, Default)]
pub struct DeadlineCallbacks {
    on_warning: Option<WarningCallback>,
    on_expire: Option<ExpiryCallback>,
}

impl DeadlineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_warning(mut self, f: impl Fn(DeadlineWarning) + Send + Sync + 'static) -> Self {
        self.on_warning = Some(Arc::new(f));
        self
    }

    pub fn on_expire(mut self, f: impl Fn(DeadlineHandle) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for DeadlineCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineCallbacks")
            .field("on_warning", &self.on_warning.is_some())
            .field("on_expire", &self.on_expire.is_some())
            .finish()
    }
}

struct TimerEntry {
    label: String,
    deadline: Instant,
    /// Bumped on every reschedule; stale timer tasks compare against it.
    generation: u64,
    /// Warnings already fired in the current schedule.
    fired_warnings: usize,
    expired: bool,
    callbacks: DeadlineCallbacks,
    task: JoinHandle<()>,
}

type TimerTable = Arc<Mutex<HashMap<DeadlineHandle, TimerEntry>>>;

/// Owns a table of countdown timers.
///
/// Timers run on the ambient tokio runtime; `start` and `extend` must be
/// called from within one.
pub struct DeadlineManager {
    timers: TimerTable,
    next_id: AtomicU64,
    warning_fractions: Vec<f64>,
}

impl DeadlineManager {
    /// Manager with the default 75% / 90% warning points.
    pub fn new() -> Self {
        Self::with_warning_fractions(&DEFAULT_WARNING_FRACTIONS)
    }

    /// Manager with custom warning points. Values outside `(0, 1)` are dropped.
    pub fn with_warning_fractions(fractions: &[f64]) -> Self {
        let mut warning_fractions: Vec<f64> = fractions
            .iter()
            .copied()
            .filter(|f| *f > 0.0 && *f < 1.0)
            .collect();
        warning_fractions.sort_by(|a, b| a.total_cmp(b));
        warning_fractions.dedup();

        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            warning_fractions,
        }
    }

    pub fn warning_fractions(&self) -> &[f64] {
        &self.warning_fractions
    }

    /// Start a timer and return its handle.
    pub fn start(
        &self,
        label: impl Into<String>,
        duration: Duration,
        callbacks: DeadlineCallbacks,
    ) -> DeadlineHandle {
        let handle = DeadlineHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        let now = Instant::now();

        // Spawning under the lock keeps the task from observing a missing entry.
        let mut timers = lock(&self.timers);
        let task = self.spawn_schedule(handle, 0, now, duration);
        timers.insert(
            handle,
            TimerEntry {
                label: label.clone(),
                deadline: now + duration,
                generation: 0,
                fired_warnings: 0,
                expired: false,
                callbacks,
                task,
            },
        );
        debug!(%handle, label = %label, duration_ms = duration.as_millis() as u64, "deadline started");
        handle
    }

    /// Cancel a timer. Safe to call any number of times.
    pub fn stop(&self, handle: DeadlineHandle) {
        let entry = lock(&self.timers).remove(&handle);
        match entry {
            Some(entry) => {
                entry.task.abort();
                debug!(%handle, label = %entry.label, "deadline stopped");
            }
            None => debug!(%handle, "stop on unknown or already stopped deadline"),
        }
    }

    /// Time left before expiry; zero for stopped, expired or unknown handles.
    pub fn remaining(&self, handle: DeadlineHandle) -> Duration {
        let timers = lock(&self.timers);
        match timers.get(&handle) {
            Some(entry) if !entry.expired => {
                entry.deadline.saturating_duration_since(Instant::now())
            }
            Some(_) => Duration::ZERO,
            None => {
                debug!(%handle, "remaining on unknown deadline");
                Duration::ZERO
            }
        }
    }

    /// Whether the timer has expired (or was stopped, or never existed).
    pub fn is_expired(&self, handle: DeadlineHandle) -> bool {
        let timers = lock(&self.timers);
        match timers.get(&handle) {
            Some(entry) => entry.expired || Instant::now() >= entry.deadline,
            None => true,
        }
    }

    /// Push the deadline out by `extra`.
    ///
    /// The new window is the current remaining time plus `extra`, measured
    /// from now. Warnings are re-armed against that window. Returns `false`
    /// if the handle is unknown, stopped or already expired.
    pub fn extend(&self, handle: DeadlineHandle, extra: Duration) -> bool {
        let mut timers = lock(&self.timers);
        let Some(entry) = timers.get_mut(&handle) else {
            debug!(%handle, "extend rejected: unknown deadline");
            return false;
        };
        if entry.expired {
            debug!(%handle, "extend rejected: deadline already expired");
            return false;
        }

        let now = Instant::now();
        let window = entry.deadline.saturating_duration_since(now) + extra;
        entry.task.abort();
        entry.generation += 1;
        entry.fired_warnings = 0;
        entry.deadline = now + window;
        entry.task = self.spawn_schedule(handle, entry.generation, now, window);

        debug!(
            %handle,
            label = %entry.label,
            window_ms = window.as_millis() as u64,
            "deadline extended"
        );
        true
    }

    /// Cancel every timer.
    pub fn stop_all(&self) {
        let drained: Vec<(DeadlineHandle, TimerEntry)> = lock(&self.timers).drain().collect();
        for (_, entry) in &drained {
            entry.task.abort();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "all deadlines stopped");
        }
    }

    /// Number of timers that have not expired yet.
    pub fn active_count(&self) -> usize {
        lock(&self.timers).values().filter(|e| !e.expired).count()
    }

    fn spawn_schedule(
        &self,
        handle: DeadlineHandle,
        generation: u64,
        started: Instant,
        window: Duration,
    ) -> JoinHandle<()> {
        let timers = Arc::clone(&self.timers);
        let fractions = self.warning_fractions.clone();

        tokio::spawn(async move {
            for (index, fraction) in fractions.iter().enumerate() {
                sleep_until(started + window.mul_f64(*fraction)).await;
                fire_warning(&timers, handle, generation, index, *fraction);
            }
            sleep_until(started + window).await;
            fire_expiry(&timers, handle, generation);
        })
    }
}

impl Default for DeadlineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeadlineManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn lock(table: &TimerTable) -> MutexGuard<'_, HashMap<DeadlineHandle, TimerEntry>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fire_warning(
    table: &TimerTable,
    handle: DeadlineHandle,
    generation: u64,
    index: usize,
    fraction: f64,
) {
    let (callback, warning) = {
        let mut timers = lock(table);
        let Some(entry) = timers.get_mut(&handle) else {
            return;
        };
        if entry.generation != generation || entry.expired || entry.fired_warnings != index {
            return;
        }
        entry.fired_warnings = index + 1;
        let warning = DeadlineWarning {
            handle,
            label: entry.label.clone(),
            fraction,
            remaining: entry.deadline.saturating_duration_since(Instant::now()),
        };
        (entry.callbacks.on_warning.clone(), warning)
    };

    debug!(%handle, label = %warning.label, fraction, "deadline warning");
    if let Some(callback) = callback {
        callback(warning);
    }
}

fn fire_expiry(table: &TimerTable, handle: DeadlineHandle, generation: u64) {
    let callback = {
        let mut timers = lock(table);
        let Some(entry) = timers.get_mut(&handle) else {
            return;
        };
        if entry.generation != generation || entry.expired {
            return;
        }
        entry.expired = true;
        debug!(%handle, label = %entry.label, "deadline expired");
        entry.callbacks.on_expire.clone()
    };

    if let Some(callback) = callback {
        callback(handle);
    }
}
