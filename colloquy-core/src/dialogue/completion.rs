//! Chat-completion boundary.
//!
//! The boundary pre-classifies failures so the dialogue loop never inspects
//! error text: a rate/quota signal comes back as
//! [`CompletionError::RateLimited`] (rotate the credential, free retry),
//! anything else as [`CompletionError::Transient`] (bounded retry).

use thiserror::Error;

use super::Turn;

/// Classified failure from the completion boundary.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The credential used for this call hit a rate or quota limit.
    #[error("completion rate limited")]
    RateLimited,

    /// Anything else worth a bounded retry (5xx, network, malformed body).
    #[error("completion service error: {0}")]
    Transient(String),
}

/// Model parameters sent with every completion request.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            model: "llama-3.3-70b-versatile".into(),
            max_tokens: 500,
            temperature: 0.8,
        }
    }
}

/// Contract for completion backends.
///
/// `secret` is the credential leased from the key pool for this one call.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(
        &self,
        secret: &str,
        turns: &[Turn],
        params: &CompletionParams,
    ) -> std::result::Result<String, CompletionError>;
}

/// Rate/quota markers some providers put in non-429 error bodies.
pub(crate) fn is_quota_signal(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("rate limit") || lower.contains("quota exceeded")
}

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use reqwest::blocking::Client;
    use reqwest::StatusCode;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    use super::{is_quota_signal, CompletionClient, CompletionError, CompletionParams};
    use crate::dialogue::Turn;
    use crate::error::{ColloquyError, Result};

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

    #[derive(Serialize)]
    struct ChatRequest<'a> {
        model: &'a str,
        messages: &'a [Turn],
        max_tokens: u32,
        temperature: f32,
    }

    #[derive(Deserialize)]
    struct ChatResponse {
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: ChoiceMessage,
    }

    #[derive(Deserialize)]
    struct ChoiceMessage {
        content: String,
    }

    /// Completion over HTTP against an OpenAI-compatible
    /// `/chat/completions` endpoint.
    pub struct HttpCompletionClient {
        client: Client,
        endpoint: String,
    }

    impl HttpCompletionClient {
        /// # Errors
        /// Returns `ColloquyError::Config` if the HTTP client fails to build.
        pub fn new(endpoint: impl Into<String>) -> Result<Self> {
            let client = Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| ColloquyError::Config(e.to_string()))?;

            Ok(Self {
                client,
                endpoint: endpoint.into(),
            })
        }
    }

    impl CompletionClient for HttpCompletionClient {
        fn complete(
            &self,
            secret: &str,
            turns: &[Turn],
            params: &CompletionParams,
        ) -> std::result::Result<String, CompletionError> {
            let body = ChatRequest {
                model: &params.model,
                messages: turns,
                max_tokens: params.max_tokens,
                temperature: params.temperature,
            };

            debug!(turns = turns.len(), model = %params.model, "requesting completion");

            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(secret)
                .json(&body)
                .send()
                .map_err(|e| CompletionError::Transient(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(CompletionError::RateLimited);
            }
            if !status.is_success() {
                let text = response.text().unwrap_or_default();
                if is_quota_signal(&text) {
                    return Err(CompletionError::RateLimited);
                }
                return Err(CompletionError::Transient(format!(
                    "completion API error {status}: {text}"
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .map_err(|e| CompletionError::Transient(e.to_string()))?;

            parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| {
                    CompletionError::Transient("completion response contained no choices".into())
                })
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpCompletionClient;
