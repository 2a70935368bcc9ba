//! OpenAI-compatible model API client.
//! Connection pooling via reqwest, simple token-bucket rate limiting,
//! retry on 429 / 5xx / timeout. Serves both embeddings and chat completions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{EmbeddingProvider, GenerationProvider};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::Embedding;

/// HTTP client for `/v1/embeddings` and `/v1/chat/completions`.
pub struct HttpModelClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    min_interval: Duration,
}

impl HttpModelClient {
    /// Create a client, reading the API key from the variable named in `config`.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_var).map_err(|_| {
            ProviderError::MissingCredentials(format!(
                "{} environment variable not set",
                config.api_key_var
            ))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingCredentials(format!(
                "{} is empty",
                config.api_key_var
            )));
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::Api(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: config.min_interval,
        })
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// POST with retry logic.
    /// 429: Retry-After or 1s/2s/4s (max 3).
    /// 5xx: exponential backoff (max 2).
    /// Timeout: immediate retry once.
    async fn send_with_retry(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            self.rate_limit_wait().await;

            let result = self
                .http
                .post(format!("{}{}", self.base_url, path))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp);
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    if attempt >= max_429_retries {
                        return Err(ProviderError::RateLimited {
                            retry_after_ms: wait.as_millis() as u64,
                        });
                    }
                    warn!(path, attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(ProviderError::Api(format!(
                            "server error: {}",
                            resp.status()
                        )));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        path,
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(ProviderError::Api(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(ProviderError::Timeout);
                    }
                    warn!(path, "request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => {
                    return Err(ProviderError::Api(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpModelClient {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": text,
        });
        let start = Instant::now();
        let resp = self.send_with_retry("/v1/embeddings", &body).await?;
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let embedding = embedding_from_response(parsed)?;
        debug!(
            dims = embedding.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "embedding received"
        );
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        &self.embedding_model
    }
}

#[async_trait]
impl GenerationProvider for HttpModelClient {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.chat_model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "stream": false,
            "temperature": 0.3
        });
        let start = Instant::now();
        let resp = self.send_with_retry("/v1/chat/completions", &body).await?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let content = content_from_response(parsed)?;
        debug!(
            chars = content.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "completion received"
        );
        Ok(content)
    }
}

const SYSTEM_PROMPT: &str =
    "You are a regional translator. Reply with a single JSON object and nothing else.";

fn embedding_from_response(resp: EmbeddingResponse) -> Result<Embedding, ProviderError> {
    let data = resp
        .data
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("empty embedding data".into()))?;
    if data.embedding.is_empty() {
        return Err(ProviderError::MalformedResponse("zero-length embedding".into()));
    }
    Ok(Embedding::new(data.embedding))
}

fn content_from_response(resp: ChatResponse) -> Result<String, ProviderError> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderError::MalformedResponse("no completion choices".into()))
}

// --- Response types ---

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_missing_credentials() {
        let cfg = ProviderConfig::default();
        let err = HttpModelClient::with_api_key(&cfg, "  ".into()).err();
        assert!(matches!(err, Some(ProviderError::MissingCredentials(_))));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let cfg = ProviderConfig {
            base_url: "http://localhost:9000/".into(),
            ..ProviderConfig::default()
        };
        let client = HttpModelClient::with_api_key(&cfg, "k".into()).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
        assert_eq!(client.model_name(), "text-embedding-3-small");
    }

    #[test]
    fn embedding_response_takes_first_vector() {
        let resp: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"embedding":[0.1,0.2]},{"embedding":[9.0]}],"model":"m"}"#,
        )
        .unwrap();
        assert_eq!(
            embedding_from_response(resp).unwrap(),
            Embedding::new(vec![0.1, 0.2])
        );

        let empty: EmbeddingResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(matches!(
            embedding_from_response(empty),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn chat_response_extracts_message_content() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"{\"translation\":\"Hola\"}"}}]}"#,
        )
        .unwrap();
        assert_eq!(content_from_response(resp).unwrap(), r#"{"translation":"Hola"}"#);

        let none: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(content_from_response(none).is_err());
    }
}
