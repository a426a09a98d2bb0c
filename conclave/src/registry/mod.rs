//! Responder Registry: who can take part in a session.
//!
//! Tracks the responders available to the orchestrator, their declared
//! strengths, live health metadata (availability, latency, error rates) and
//! a load counter of sessions they are currently bound into.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ResponderConfig;
use crate::session::{CollaborationRequest, Participant, ParticipantRole};

/// Consecutive failures after which a responder is marked unavailable.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Static description of a responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderProfile {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub role: ParticipantRole,
    pub strengths: Vec<String>,
    /// Concurrent sessions allowed; `None` is unlimited.
    pub max_load: Option<u32>,
}

impl ResponderProfile {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            model: model.into(),
            role: ParticipantRole::default(),
            strengths: Vec::new(),
            max_load: None,
        }
    }

    pub fn with_role(mut self, role: ParticipantRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_strengths<I, S>(mut self, strengths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strengths = strengths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_load(mut self, max_load: u32) -> Self {
        self.max_load = Some(max_load);
        self
    }

    /// How many of `wanted` this responder declares (case-insensitive).
    pub fn strength_matches(&self, wanted: &[String]) -> usize {
        wanted
            .iter()
            .filter(|w| self.strengths.iter().any(|s| s.eq_ignore_ascii_case(w)))
            .count()
    }
}

impl From<&ResponderConfig> for ResponderProfile {
    fn from(cfg: &ResponderConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            provider: cfg.provider.clone(),
            model: cfg.model.clone(),
            role: cfg.role,
            strengths: cfg.strengths.clone(),
            max_load: cfg.max_load,
        }
    }
}

/// Live health metadata for a responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderHealth {
    /// Whether the responder is currently reachable
    pub available: bool,
    /// Average response latency in milliseconds
    pub avg_latency_ms: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    /// Last update (Unix seconds)
    pub last_checked_secs: u64,
    pub status_message: Option<String>,
}

impl ResponderHealth {
    pub fn healthy() -> Self {
        Self {
            available: true,
            avg_latency_ms: 0,
            success_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_checked_secs: unix_now(),
            status_message: None,
        }
    }

    /// Success rate in 0.0–1.0; a responder with no history counts as healthy.
    pub fn success_rate(&self) -> f32 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f32 / total as f32
        }
    }

    pub fn record_success(&mut self, latency_ms: u64) {
        self.avg_latency_ms =
            (self.avg_latency_ms * self.success_count + latency_ms) / (self.success_count + 1);
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_checked_secs = unix_now();
    }

    pub fn record_failure(&mut self) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.last_checked_secs = unix_now();
    }
}

/// A registered responder: profile, health and current load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub profile: ResponderProfile,
    pub health: ResponderHealth,
    /// Sessions this responder is bound into right now.
    pub load: u32,
    /// Registration order, used as the final selection tie-breaker.
    seq: u64,
}

impl RegistryEntry {
    pub fn has_capacity(&self) -> bool {
        self.profile.max_load.map_or(true, |max| self.load < max)
    }

    /// Available and below its load cap. Success rate only affects ranking.
    pub fn is_usable(&self) -> bool {
        self.health.available && self.has_capacity()
    }

    fn to_participant(&self) -> Participant {
        Participant {
            id: self.profile.id.clone(),
            provider: self.profile.provider.clone(),
            model: self.profile.model.clone(),
            role: self.profile.role,
            strengths: self.profile.strengths.clone(),
            is_active: true,
            load: self.load,
        }
    }
}

/// Filters applied by [`ResponderRegistry::select`].
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Restrict to these ids.
    pub responder_ids: Option<Vec<String>>,
    /// Responders declaring more of these rank higher.
    pub required_strengths: Vec<String>,
    pub max_participants: Option<usize>,
}

impl SelectionCriteria {
    pub fn from_request(request: &CollaborationRequest, max_participants: Option<usize>) -> Self {
        Self {
            responder_ids: request.responders.clone(),
            required_strengths: request.required_strengths.clone(),
            max_participants,
        }
    }
}

/// Thread-safe registry shared between the orchestrator and its sessions.
#[derive(Debug, Default)]
pub struct ResponderRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl ResponderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ResponderConfig]) -> Self {
        let registry = Self::new();
        for cfg in configs {
            registry.register(ResponderProfile::from(cfg));
        }
        registry
    }

    /// Register or replace a responder. Returns `true` if the id was new.
    ///
    /// Replacing keeps the existing health and load counters.
    pub fn register(&self, profile: ResponderProfile) -> bool {
        let mut entries = self.write();
        let seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);
        match entries.get_mut(&profile.id) {
            Some(entry) => {
                debug!(responder = %profile.id, "Replacing responder profile");
                entry.profile = profile;
                false
            }
            None => {
                info!(responder = %profile.id, provider = %profile.provider, model = %profile.model, "Registered responder");
                entries.insert(
                    profile.id.clone(),
                    RegistryEntry {
                        profile,
                        health: ResponderHealth::healthy(),
                        load: 0,
                        seq,
                    },
                );
                true
            }
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.read().get(id).cloned()
    }

    /// Whether `id` may still be called. Unregistered ids are not tracked
    /// here and count as available.
    pub fn is_available(&self, id: &str) -> bool {
        self.read().get(id).map_or(true, |e| e.health.available)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All entries in registration order.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut all: Vec<RegistryEntry> = self.read().values().cloned().collect();
        all.sort_by_key(|e| e.seq);
        all
    }

    /// Pick participants for a request.
    ///
    /// Only usable responders (and only the requested ones, if a list was
    /// given) are considered. Ranking: strength matches, then success rate,
    /// then current load, then average latency, then registration order.
    pub fn select(&self, criteria: &SelectionCriteria) -> Vec<Participant> {
        let entries = self.read();
        let mut candidates: Vec<&RegistryEntry> = entries
            .values()
            .filter(|e| {
                criteria
                    .responder_ids
                    .as_ref()
                    .map_or(true, |ids| ids.iter().any(|id| *id == e.profile.id))
            })
            .filter(|e| {
                let usable = e.is_usable();
                if !usable {
                    debug!(responder = %e.profile.id, load = e.load, available = e.health.available, "Skipping unusable responder");
                }
                usable
            })
            .collect();

        if let Some(ids) = &criteria.responder_ids {
            for id in ids.iter().filter(|id| !entries.contains_key(id.as_str())) {
                warn!(responder = %id, "Requested responder is not registered");
            }
        }

        candidates.sort_by(|a, b| {
            let wanted = &criteria.required_strengths;
            b.profile
                .strength_matches(wanted)
                .cmp(&a.profile.strength_matches(wanted))
                .then_with(|| {
                    b.health
                        .success_rate()
                        .partial_cmp(&a.health.success_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.load.cmp(&b.load))
                .then_with(|| a.health.avg_latency_ms.cmp(&b.health.avg_latency_ms))
                .then_with(|| a.seq.cmp(&b.seq))
        });

        let limit = criteria.max_participants.unwrap_or(usize::MAX);
        candidates
            .into_iter()
            .take(limit)
            .map(RegistryEntry::to_participant)
            .collect()
    }

    /// Bind responders into a session.
    pub fn acquire(&self, ids: &[String]) {
        let mut entries = self.write();
        for id in ids {
            if let Some(entry) = entries.get_mut(id) {
                entry.load += 1;
            }
        }
    }

    /// Release responders at session end.
    pub fn release(&self, ids: &[String]) {
        let mut entries = self.write();
        for id in ids {
            if let Some(entry) = entries.get_mut(id) {
                entry.load = entry.load.saturating_sub(1);
            }
        }
    }

    pub fn record_success(&self, id: &str, latency_ms: u64) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.health.record_success(latency_ms);
        }
    }

    /// Record a failed call; repeated failures mark the responder unavailable.
    pub fn record_failure(&self, id: &str, reason: &str) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.health.record_failure();
            if entry.health.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && entry.health.available {
                warn!(
                    responder = %id,
                    failures = entry.health.consecutive_failures,
                    "Marking responder unavailable after repeated failures"
                );
                entry.health.available = false;
                entry.health.status_message = Some(reason.to_string());
            }
        }
    }

    pub fn mark_unavailable(&self, id: &str, reason: impl Into<String>) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.health.available = false;
            entry.health.status_message = Some(reason.into());
            entry.health.last_checked_secs = unix_now();
        }
    }

    /// Bring a responder back with a clean health history.
    pub fn mark_available(&self, id: &str) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.health = ResponderHealth::healthy();
        }
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegistryEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ResponderRegistry {
        let r = ResponderRegistry::new();
        r.register(
            ResponderProfile::new("claude", "anthropic", "claude-sonnet-4")
                .with_role(ParticipantRole::Reasoner)
                .with_strengths(["architecture", "review"]),
        );
        r.register(
            ResponderProfile::new("gpt", "openai", "gpt-4o")
                .with_role(ParticipantRole::Implementer)
                .with_strengths(["frontend"]),
        );
        r.register(ResponderProfile::new("gemini", "google", "gemini-2.5-pro"));
        r
    }

    #[test]
    fn test_health_success_rate() {
        let mut h = ResponderHealth::healthy();
        assert_eq!(h.success_rate(), 1.0);
        h.record_success(100);
        h.record_failure();
        assert_eq!(h.success_rate(), 0.5);
        assert_eq!(h.consecutive_failures, 1);
        h.record_success(300);
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.avg_latency_ms, 200);
    }

    #[test]
    fn test_select_all_in_registration_order() {
        let r = registry();
        let ids: Vec<String> = r
            .select(&SelectionCriteria::default())
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["claude", "gpt", "gemini"]);
    }

    #[test]
    fn test_select_only_requested() {
        let r = registry();
        let criteria = SelectionCriteria {
            responder_ids: Some(vec!["gemini".into(), "missing".into()]),
            ..Default::default()
        };
        let picked = r.select(&criteria);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "gemini");
        assert!(picked[0].is_active);
    }

    #[test]
    fn test_strengths_rank_first() {
        let r = registry();
        let criteria = SelectionCriteria {
            required_strengths: vec!["Frontend".into()],
            max_participants: Some(2),
            ..Default::default()
        };
        let picked = r.select(&criteria);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].id, "gpt");
    }

    #[test]
    fn test_unavailable_responders_skipped() {
        let r = registry();
        r.mark_unavailable("claude", "maintenance");
        let picked = r.select(&SelectionCriteria::default());
        assert!(picked.iter().all(|p| p.id != "claude"));

        r.mark_available("claude");
        assert_eq!(r.select(&SelectionCriteria::default()).len(), 3);
    }

    #[test]
    fn test_repeated_failures_mark_unavailable() {
        let r = registry();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            r.record_failure("gpt", "connection refused");
        }
        let entry = r.get("gpt").unwrap();
        assert!(!entry.health.available);
        assert_eq!(entry.health.status_message.as_deref(), Some("connection refused"));
        assert!(!entry.is_usable());
    }

    #[test]
    fn test_single_failure_keeps_responder_selectable() {
        let r = ResponderRegistry::new();
        r.register(ResponderProfile::new("solo", "local", "qwen"));
        r.record_failure("solo", "connection refused");

        let entry = r.get("solo").unwrap();
        assert_eq!(entry.health.success_rate(), 0.0);
        assert!(entry.is_usable());
        assert_eq!(r.select(&SelectionCriteria::default()).len(), 1);
    }

    #[test]
    fn test_failing_responder_ranks_last() {
        let r = registry();
        r.record_failure("claude", "timeout");
        let ids: Vec<String> = r
            .select(&SelectionCriteria::default())
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["gpt", "gemini", "claude"]);
    }

    #[test]
    fn test_mark_available_resets_history() {
        let r = registry();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            r.record_failure("gpt", "connection refused");
        }
        assert!(r.select(&SelectionCriteria::default()).iter().all(|p| p.id != "gpt"));

        r.mark_available("gpt");
        let health = r.get("gpt").unwrap().health;
        assert!(health.available);
        assert_eq!(health.error_count, 0);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.success_rate(), 1.0);
        assert!(health.status_message.is_none());
        assert_eq!(r.select(&SelectionCriteria::default()).len(), 3);
    }

    #[test]
    fn test_load_cap_and_release() {
        let r = ResponderRegistry::new();
        r.register(ResponderProfile::new("solo", "local", "qwen").with_max_load(1));
        let ids = vec!["solo".to_string()];

        assert_eq!(r.select(&SelectionCriteria::default()).len(), 1);
        r.acquire(&ids);
        assert_eq!(r.get("solo").unwrap().load, 1);
        assert!(r.select(&SelectionCriteria::default()).is_empty());

        r.release(&ids);
        r.release(&ids);
        assert_eq!(r.get("solo").unwrap().load, 0);
        assert_eq!(r.select(&SelectionCriteria::default()).len(), 1);
    }

    #[test]
    fn test_register_replaces_profile() {
        let r = registry();
        r.acquire(&["gpt".to_string()]);
        let fresh = r.register(ResponderProfile::new("gpt", "openai", "gpt-4.1"));
        assert!(!fresh);
        let entry = r.get("gpt").unwrap();
        assert_eq!(entry.profile.model, "gpt-4.1");
        assert_eq!(entry.load, 1);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_from_configs() {
        let configs = vec![ResponderConfig {
            id: "local".into(),
            provider: "llama.cpp".into(),
            model: "qwen3".into(),
            base_url: Some("http://localhost:8080/v1".into()),
            api_key_env: None,
            role: ParticipantRole::Innovator,
            strengths: vec!["rust".into()],
            max_load: None,
        }];
        let r = ResponderRegistry::from_configs(&configs);
        let entry = r.get("local").unwrap();
        assert_eq!(entry.profile.role, ParticipantRole::Innovator);
        assert!(r.unregister("local"));
        assert!(r.is_empty());
    }
}
