use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKOFF_MS: u64 = 200;

/// Bounded exponential backoff for transient completion failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(1 << retry.min(16))
    }
}

#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_endpoint: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl LLMConfig {
    pub fn from_env() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            api_key: env_string("LLM_API_KEY"),
            model: env_string("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_endpoint: normalize_endpoint(
                env_string("LLM_API_ENDPOINT")
                    .or_else(|| env_string("LLM_BASE_URL"))
                    .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
            ),
            timeout: Duration::from_millis(env_u64("LLM_TIMEOUT").unwrap_or(DEFAULT_TIMEOUT_MS)),
            retry: RetryPolicy {
                max_retries: env_u64("LLM_MAX_RETRIES")
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(defaults.max_retries),
                base_backoff: env_u64("LLM_RETRY_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_backoff),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Reply,
}

#[derive(Debug, Deserialize)]
struct Reply {
    content: String,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("LLM not configured: {0}")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: reqwest::StatusCode, body: String },
    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty response")]
    EmptyChoices,
}

impl LLMError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::HttpStatus { status, .. } => {
                *status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error()
            }
            _ => false,
        }
    }
}

/// Chat-completion client behind the grading and question collaborators.
/// Transient HTTP failures are retried here, never in the tutoring core.
#[derive(Clone)]
pub struct LLMProvider {
    config: LLMConfig,
    client: reqwest::Client,
}

impl LLMProvider {
    pub fn from_env() -> Self {
        Self::new(LLMConfig::from_env())
    }

    pub fn new(config: LLMConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    pub fn is_available(&self) -> bool {
        self.api_key().is_some()
            && !self.config.model.trim().is_empty()
            && !self.config.api_endpoint.trim().is_empty()
    }

    /// Sends one system + user exchange and returns the first reply.
    pub async fn complete_with_system(&self, system: &str, user: &str) -> Result<String, LLMError> {
        let api_key = self.api_key().ok_or(LLMError::NotConfigured("LLM_API_KEY"))?;
        let url = format!("{}/chat/completions", self.config.api_endpoint.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.config.model,
            "messages": [
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            "stream": false
        });

        let retry = self.config.retry;
        let mut attempt = 0;
        loop {
            match self.post(&url, api_key, &payload).await {
                Err(err) if attempt < retry.max_retries && err.is_transient() => {
                    tracing::warn!(attempt, error = %err, "completion failed, retrying");
                    tokio::time::sleep(retry.backoff(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn api_key(&self) -> Option<&str> {
        self.config.api_key.as_deref().filter(|v| !v.trim().is_empty())
    }

    async fn post(
        &self,
        url: &str,
        api_key: &str,
        payload: &serde_json::Value,
    ) -> Result<String, LLMError> {
        let resp = self.client.post(url).bearer_auth(api_key).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LLMError::HttpStatus { status, body });
        }
        let bytes = resp.bytes().await?;
        first_reply(&bytes)
    }
}

fn first_reply(body: &[u8]) -> Result<String, LLMError> {
    let completion: Completion = serde_json::from_slice(body).map_err(|e| {
        tracing::error!(error = %e, "failed to decode completion");
        LLMError::Json(e)
    })?;
    completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or(LLMError::EmptyChoices)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key)?.trim().parse().ok()
}

fn normalize_endpoint(endpoint: String) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") || trimmed.contains("/v1/") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}
