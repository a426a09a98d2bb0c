//! Engine configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`CONCLAVE_*`, see [`EngineConfig::apply_env_overrides`])
//! 2. Values from a TOML file ([`EngineConfig::load`])
//! 3. Built-in defaults
//!
//! ```toml
//! round_limit = 4
//! min_time_limit_ms = 10000
//! quality_threshold = 90.0
//!
//! [consensus]
//! policy = "confidence_agreement"
//! min_mean_confidence = 85.0
//!
//! [[responders]]
//! id = "claude"
//! provider = "anthropic"
//! model = "claude-sonnet-4"
//! base_url = "http://ai-proxy:8317/v1"
//! api_key_env = "ANTHROPIC_API_KEY"
//! role = "reasoner"
//! strengths = ["architecture", "review"]
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::ConsensusSettings;
use crate::deadline::DEFAULT_WARNING_FRACTIONS;
use crate::error::{CollabError, CollabResult};
use crate::session::{ParticipantRole, PhaseKind};

/// Rounds per session unless an operator raises it.
pub const DEFAULT_ROUND_LIMIT: u32 = 4;
/// Session time limit used when a request does not set one.
const DEFAULT_TIME_LIMIT_MS: u64 = 300_000;
/// Requests asking for less than this are rejected.
const DEFAULT_MIN_TIME_LIMIT_MS: u64 = 10_000;
/// Cost estimate per token (USD).
const DEFAULT_COST_PER_TOKEN: f64 = 0.000_002;
/// Confidence assigned when a response carries no confidence marker.
const DEFAULT_CONFIDENCE: f64 = 70.0;

const ENV_ROUND_LIMIT: &str = "CONCLAVE_ROUND_LIMIT";
const ENV_DEFAULT_TIME_LIMIT_MS: &str = "CONCLAVE_DEFAULT_TIME_LIMIT_MS";
const ENV_MIN_TIME_LIMIT_MS: &str = "CONCLAVE_MIN_TIME_LIMIT_MS";
const ENV_QUALITY_THRESHOLD: &str = "CONCLAVE_QUALITY_THRESHOLD";
const ENV_COST_PER_TOKEN: &str = "CONCLAVE_COST_PER_TOKEN";
const ENV_MAX_RETRIES: &str = "CONCLAVE_MAX_RETRIES";
const ENV_KNOWLEDGE_STORE: &str = "CONCLAVE_KNOWLEDGE_STORE";

/// Per-phase round deadlines in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundDeadlines {
    pub propose_ms: u64,
    pub critique_ms: u64,
    pub synthesize_ms: u64,
    pub validate_ms: u64,
}

impl Default for RoundDeadlines {
    fn default() -> Self {
        Self {
            propose_ms: PhaseKind::Propose.default_deadline().as_millis() as u64,
            critique_ms: PhaseKind::Critique.default_deadline().as_millis() as u64,
            synthesize_ms: PhaseKind::Synthesize.default_deadline().as_millis() as u64,
            validate_ms: PhaseKind::Validate.default_deadline().as_millis() as u64,
        }
    }
}

impl RoundDeadlines {
    /// Same deadline for every phase.
    pub fn uniform(duration: Duration) -> Self {
        let ms = duration.as_millis() as u64;
        Self {
            propose_ms: ms,
            critique_ms: ms,
            synthesize_ms: ms,
            validate_ms: ms,
        }
    }

    pub fn for_phase(&self, phase: PhaseKind) -> Duration {
        Duration::from_millis(match phase {
            PhaseKind::Propose => self.propose_ms,
            PhaseKind::Critique => self.critique_ms,
            PhaseKind::Synthesize => self.synthesize_ms,
            PhaseKind::Validate => self.validate_ms,
        })
    }
}

/// A responder the CLI (or any embedder) should register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    pub id: String,
    pub provider: String,
    pub model: String,
    /// OpenAI-compatible base URL, e.g. `http://localhost:8080/v1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub role: ParticipantRole,
    #[serde(default)]
    pub strengths: Vec<String>,
    /// Concurrent sessions this responder may join (unlimited if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_load: Option<u32>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on rounds per session. Rounds past 4 repeat the validate phase.
    pub round_limit: u32,
    /// Round cap used when the request does not set one.
    pub default_max_rounds: u32,
    pub default_time_limit_ms: u64,
    pub min_time_limit_ms: u64,
    pub round_deadlines: RoundDeadlines,
    pub warning_fractions: Vec<f64>,
    /// Stop early once mean confidence reaches this value (0–100).
    pub quality_threshold: Option<f64>,
    pub consensus: ConsensusSettings,
    pub cost_per_token: f64,
    /// Retries per responder call for retriable errors.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Role preference for picking the synthesizer.
    pub synthesizer_roles: Vec<ParticipantRole>,
    /// Phases whose failure aborts the whole session.
    pub critical_phases: Vec<PhaseKind>,
    pub default_confidence: f64,
    /// Cap on participants per session (all matching responders if unset).
    pub max_participants: Option<usize>,
    pub responders: Vec<ResponderConfig>,
    /// JSON-lines file receiving one summary document per session.
    pub knowledge_store_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_limit: DEFAULT_ROUND_LIMIT,
            default_max_rounds: DEFAULT_ROUND_LIMIT,
            default_time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            min_time_limit_ms: DEFAULT_MIN_TIME_LIMIT_MS,
            round_deadlines: RoundDeadlines::default(),
            warning_fractions: DEFAULT_WARNING_FRACTIONS.to_vec(),
            quality_threshold: None,
            consensus: ConsensusSettings::default(),
            cost_per_token: DEFAULT_COST_PER_TOKEN,
            max_retries: 1,
            retry_backoff_ms: 250,
            synthesizer_roles: vec![
                ParticipantRole::Reasoner,
                ParticipantRole::Implementer,
                ParticipantRole::Generalist,
            ],
            critical_phases: Vec::new(),
            default_confidence: DEFAULT_CONFIDENCE,
            max_participants: None,
            responders: Vec::new(),
            knowledge_store_path: None,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> CollabResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CollabError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file and apply environment overrides.
    pub fn load(path: &Path) -> CollabResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> CollabResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `CONCLAVE_*` overrides, then re-validate.
    pub fn apply_env_overrides(&mut self) -> CollabResult<()> {
        if let Some(v) = env_parse::<u32>(ENV_ROUND_LIMIT)? {
            self.round_limit = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_DEFAULT_TIME_LIMIT_MS)? {
            self.default_time_limit_ms = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_MIN_TIME_LIMIT_MS)? {
            self.min_time_limit_ms = v;
        }
        if let Some(v) = env_parse::<f64>(ENV_QUALITY_THRESHOLD)? {
            self.quality_threshold = Some(v);
        }
        if let Some(v) = env_parse::<f64>(ENV_COST_PER_TOKEN)? {
            self.cost_per_token = v;
        }
        if let Some(v) = env_parse::<u32>(ENV_MAX_RETRIES)? {
            self.max_retries = v;
        }
        if let Ok(path) = env::var(ENV_KNOWLEDGE_STORE) {
            self.knowledge_store_path = Some(PathBuf::from(path));
        }
        self.validate()
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> CollabResult<()> {
        if self.round_limit == 0 {
            return Err(CollabError::Config("round_limit must be at least 1".into()));
        }
        if self.default_max_rounds == 0 {
            return Err(CollabError::Config(
                "default_max_rounds must be at least 1".into(),
            ));
        }
        if self.default_time_limit_ms < self.min_time_limit_ms {
            return Err(CollabError::Config(format!(
                "default_time_limit_ms ({}) is below min_time_limit_ms ({})",
                self.default_time_limit_ms, self.min_time_limit_ms
            )));
        }
        if let Some(t) = self.quality_threshold {
            if !(0.0..=100.0).contains(&t) {
                return Err(CollabError::Config(format!(
                    "quality_threshold must be within 0..=100 (got {t})"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.default_confidence) {
            return Err(CollabError::Config(format!(
                "default_confidence must be within 0..=100 (got {})",
                self.default_confidence
            )));
        }
        if self.cost_per_token < 0.0 {
            return Err(CollabError::Config("cost_per_token must not be negative".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for responder in &self.responders {
            if !seen.insert(responder.id.as_str()) {
                return Err(CollabError::Config(format!(
                    "duplicate responder id {:?}",
                    responder.id
                )));
            }
        }
        Ok(())
    }

    pub fn default_time_limit(&self) -> Duration {
        Duration::from_millis(self.default_time_limit_ms)
    }

    pub fn min_time_limit(&self) -> Duration {
        Duration::from_millis(self.min_time_limit_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn is_critical_phase(&self, phase: PhaseKind) -> bool {
        self.critical_phases.contains(&phase)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> CollabResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CollabError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
