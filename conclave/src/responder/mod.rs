//! Responder interface: the external text-completion providers.
//!
//! The engine only ever calls [`Responder::generate_response`]; transport,
//! authentication and model selection live behind the trait.

pub mod http;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::error::ResponderError;

pub use http::{HttpEndpoint, HttpResponder};

/// A source of completions, addressed by responder id.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn generate_response(
        &self,
        responder_id: &str,
        prompt: &str,
    ) -> Result<String, ResponderError>;
}

/// Dispatches calls to one backend per responder id.
#[derive(Default, Clone)]
pub struct ResponderRouter {
    routes: HashMap<String, Arc<dyn Responder>>,
}

impl ResponderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, responder_id: impl Into<String>, backend: Arc<dyn Responder>) -> Self {
        self.insert(responder_id, backend);
        self
    }

    pub fn insert(&mut self, responder_id: impl Into<String>, backend: Arc<dyn Responder>) {
        self.routes.insert(responder_id.into(), backend);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for ResponderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&str> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("ResponderRouter").field("routes", &ids).finish()
    }
}

#[async_trait]
impl Responder for ResponderRouter {
    async fn generate_response(
        &self,
        responder_id: &str,
        prompt: &str,
    ) -> Result<String, ResponderError> {
        let backend = self
            .routes
            .get(responder_id)
            .ok_or_else(|| ResponderError::Unavailable(responder_id.to_string()))?;
        backend.generate_response(responder_id, prompt).await
    }
}

static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)confidence(?:\s+level)?\s*[:=]\s*\**\s*(\d{1,3}(?:\.\d+)?)\s*(%|/\s*100)?")
        .expect("CONFIDENCE_RE regex should compile")
});

static PERCENT_CONFIDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}(?:\.\d+)?)\s*%\s+confident\b")
        .expect("PERCENT_CONFIDENT_RE regex should compile")
});

/// Pull a self-reported confidence (0–100) out of a response.
///
/// Recognises `Confidence: 85`, `confidence = 85%`, `Confidence level: 85/100`
/// and `85% confident`. The last marker in the text wins. Values above 100
/// are ignored.
pub fn extract_confidence(text: &str) -> Option<f64> {
    let explicit = CONFIDENCE_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .filter(|v| (0.0..=100.0).contains(v))
        .last();
    explicit.or_else(|| {
        PERCENT_CONFIDENT_RE
            .captures_iter(text)
            .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
            .filter(|v| (0.0..=100.0).contains(v))
            .last()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Responder for Fixed {
        async fn generate_response(&self, _id: &str, _prompt: &str) -> Result<String, ResponderError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_extract_confidence_markers() {
        assert_eq!(extract_confidence("Looks good.\nConfidence: 85"), Some(85.0));
        assert_eq!(extract_confidence("confidence = 92.5%"), Some(92.5));
        assert_eq!(extract_confidence("**Confidence:** 70/100"), Some(70.0));
        assert_eq!(extract_confidence("Confidence level: 64/100"), Some(64.0));
        assert_eq!(extract_confidence("I am 90% confident in this"), Some(90.0));
        assert_eq!(extract_confidence("no marker here"), None);
    }

    #[test]
    fn test_extract_confidence_last_marker_wins() {
        let text = "Draft confidence: 40\n...revised...\nConfidence: 88";
        assert_eq!(extract_confidence(text), Some(88.0));
    }

    #[test]
    fn test_extract_confidence_rejects_out_of_range() {
        assert_eq!(extract_confidence("Confidence: 250"), None);
    }

    #[tokio::test]
    async fn test_router_dispatch() {
        let router = ResponderRouter::new()
            .route("a", Arc::new(Fixed("from a")))
            .route("b", Arc::new(Fixed("from b")));
        assert_eq!(router.len(), 2);
        assert_eq!(router.generate_response("b", "hi").await.unwrap(), "from b");

        let err = router.generate_response("c", "hi").await.unwrap_err();
        assert_eq!(err, ResponderError::Unavailable("c".into()));
        assert!(!err.is_retriable());
    }
}
