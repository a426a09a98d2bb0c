//! OpenAI-compatible chat-completions responder.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::Responder;
use crate::config::ResponderConfig;
use crate::error::ResponderError;
use crate::session::ParticipantRole;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Where and how to reach one model.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub role: ParticipantRole,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl HttpEndpoint {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            role: ParticipantRole::default(),
            max_tokens: 2048,
            temperature: 0.3,
        }
    }

    /// Build from a responder definition, reading the API key from the
    /// environment variable it names.
    pub fn from_config(cfg: &ResponderConfig) -> Self {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());
        Self {
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: cfg.model.clone(),
            api_key,
            role: cfg.role,
            ..Self::new(DEFAULT_BASE_URL, "")
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.base_url.trim_end_matches('/'))
    }
}

fn system_prompt(role: ParticipantRole) -> String {
    let focus = match role {
        ParticipantRole::Implementer => "concrete, working implementations",
        ParticipantRole::Reasoner => "careful step-by-step analysis and sound architecture",
        ParticipantRole::Innovator => "alternative and unconventional approaches",
        ParticipantRole::Reviewer => "finding defects, risks and missing cases",
        ParticipantRole::Generalist => "balanced, practical answers",
    };
    format!(
        "You are one of several collaborators working on the same task. \
         Your focus is {focus}. Be specific and concise. \
         End every answer with a line `Confidence: NN` where NN is 0-100."
    )
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the first choice's text from a chat-completions body.
pub(crate) fn parse_completion(body: &str) -> Result<String, ResponderError> {
    let parsed: ChatCompletion =
        serde_json::from_str(body).map_err(|e| ResponderError::ParseError(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(ResponderError::EmptyResponse);
    }
    Ok(content)
}

/// Single-endpoint HTTP responder.
pub struct HttpResponder {
    endpoint: HttpEndpoint,
    client: reqwest::Client,
}

impl HttpResponder {
    pub fn new(endpoint: HttpEndpoint, timeout: Duration) -> Result<Self, ResponderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResponderError::RequestFailed(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &HttpEndpoint {
        &self.endpoint
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }

    /// Cheap reachability check against `GET /models`.
    pub async fn probe(&self) -> Result<(), ResponderError> {
        let response = self
            .authorize(self.client.get(self.endpoint.models_url()))
            .send()
            .await
            .map_err(|e| ResponderError::RequestFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ResponderError::RequestFailed(format!(
                "{} returned {}",
                self.endpoint.models_url(),
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Responder for HttpResponder {
    async fn generate_response(
        &self,
        responder_id: &str,
        prompt: &str,
    ) -> Result<String, ResponderError> {
        let request_body = serde_json::json!({
            "model": self.endpoint.model,
            "messages": [
                {"role": "system", "content": system_prompt(self.endpoint.role)},
                {"role": "user", "content": prompt}
            ],
            "max_tokens": self.endpoint.max_tokens,
            "temperature": self.endpoint.temperature
        });

        debug!(responder = %responder_id, url = %self.endpoint.completions_url(), "Sending completion request");

        let response = self
            .authorize(self.client.post(self.endpoint.completions_url()))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| ResponderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
            return Err(ResponderError::RateLimited(wait));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ResponderError::RequestFailed(format!(
                "{} error ({}): {}",
                responder_id, status, body
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ResponderError::ParseError(e.to_string()))?;
        parse_completion(&body)
    }
}
