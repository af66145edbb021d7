//! OpenAI-compatible chat/completions client.
//! Connection pooling via reqwest, simple token-bucket spacing between
//! requests, retry on 429/5xx/timeout with every wait cancellable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TranslateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sampling parameters plus the conversation. `model` is left empty for
/// single-model servers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub frequency_penalty: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub text: String,
    /// `None` when the server sent no usage block.
    pub completion_tokens: Option<u32>,
}

/// Chat transport used by the local LLM backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Model ids served by the endpoint, first one is the active model.
    async fn list_models(&self) -> Result<Vec<String>, TranslateError>;

    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, TranslateError>;
}

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    min_interval: Duration,
}

impl OpenAiCompatClient {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self, TranslateError> {
        let base_url = endpoint.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(TranslateError::InvalidInput("empty chat endpoint".into()));
        }

        // Local models can take minutes on a long segment.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;

        Ok(Self {
            http,
            api_key: api_key.unwrap_or_else(|| "no-key".into()),
            base_url,
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(50),
        })
    }

    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// 429: Retry-After or 1s/2s/4s (max 3).
    /// 5xx: exponential backoff (max 2).
    /// Timeout: immediate retry once.
    async fn send_with_retry(
        &self,
        body: &ChatRequest,
        cancel_token: &CancellationToken,
    ) -> Result<reqwest::Response, TranslateError> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            let request = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send();

            let result = tokio::select! {
                result = request => result,
                _ = cancel_token.cancelled() => return Err(TranslateError::Cancelled),
            };

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= max_429_retries {
                        return Err(TranslateError::RateLimited { retry_after_ms: 0 });
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel_token.cancelled() => return Err(TranslateError::Cancelled),
                    }
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(TranslateError::ApiError(format!(
                            "server error: {}",
                            resp.status()
                        )));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel_token.cancelled() => return Err(TranslateError::Cancelled),
                    }
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(TranslateError::ApiError(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(TranslateError::Timeout);
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(TranslateError::ApiError(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatClient {
    async fn list_models(&self) -> Result<Vec<String>, TranslateError> {
        let resp = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            // Tunnelled self-hosted servers put an interstitial page in front otherwise.
            .header("ngrok-skip-browser-warning", "69420")
            .send()
            .await
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(TranslateError::ApiError(format!(
                "model listing failed: {}",
                resp.status()
            )));
        }
        let page: ModelsPage = resp
            .json()
            .await
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;
        Ok(page.data.into_iter().map(|m| m.id).collect())
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, TranslateError> {
        self.rate_limit_wait().await;
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }

        let start = Instant::now();
        let resp = self.send_with_retry(request, cancel).await?;
        let parsed: CompletionResponse = tokio::select! {
            body = resp.json() => body.map_err(|e| TranslateError::ApiError(e.to_string()))?,
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
        };

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TranslateError::ApiError("completion has no content".into()))?;
        let completion_tokens = parsed.usage.map(|u| u.completion_tokens);
        if completion_tokens.is_none() {
            warn!("chat completion response has no usage block");
        }
        debug!(
            completion_tokens = ?completion_tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "chat completion done"
        );
        Ok(ChatCompletion {
            text,
            completion_tokens,
        })
    }
}

#[derive(Deserialize)]
struct ModelsPage {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    completion_tokens: u32,
}
