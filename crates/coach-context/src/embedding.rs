//! Embedding provider implementations and the paced batch embedder.
//!
//! - **[`DisabledProvider`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `POST {url}/embeddings`
//!   endpoint, one text per request, with bounded retry and backoff.
//! - **[`BatchEmbedder`]**: embeds a list of texts sequentially with a fixed
//!   delay between calls, recording per-item failures instead of aborting.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Retries are bounded by `embedding.max_retries`; every request has the
//! configured timeout, so no call blocks indefinitely.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use coach_context_core::embedding::{check_dims, EmbeddingProvider};
use coach_context_core::error::EmbedError;
use coach_context_core::observe::{EmbedEvent, NoopObserver, RetrievalObserver};

use crate::config::EmbeddingConfig;

/// Instantiate the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns [`EmbedError::Disabled`].
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Disabled)
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for OpenAI-compatible APIs.
///
/// Request: `{ "model", "input", "encoding_format" }`.
/// Response: `{ "data": [{ "embedding": [f32, ...] }] }`.
pub struct OpenAIProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
    encoding_format: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAIProvider {
    /// Create a provider, reading the API key from `config.api_key_env`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: impl Into<String>) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.url.trim_end_matches('/')),
            api_key: api_key.into(),
            model,
            dims,
            encoding_format: config.encoding_format.clone(),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }

    async fn request_once(&self, body: &serde_json::Value) -> Result<Vec<f32>, Attempt> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| Attempt::Retry(self.transport_error(e)))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Attempt::Fatal(EmbedError::Malformed(e.to_string())))?;
            return parse_embedding_response(&json).map_err(Attempt::Fatal);
        }

        let message = response.text().await.unwrap_or_default();
        let err = EmbedError::Http {
            status: status.as_u16(),
            message,
        };
        if status.as_u16() == 429 || status.is_server_error() {
            Err(Attempt::Retry(err))
        } else {
            Err(Attempt::Fatal(err))
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> EmbedError {
        if e.is_timeout() {
            EmbedError::Timeout(self.timeout_secs)
        } else {
            EmbedError::Network(e.to_string())
        }
    }
}

enum Attempt {
    Retry(EmbedError),
    Fatal(EmbedError),
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "encoding_format": self.encoding_format,
        });

        let mut last_err = EmbedError::Network("no attempt made".to_string());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying embedding call");
                tokio::time::sleep(delay).await;
            }

            match self.request_once(&body).await {
                Ok(vec) => return check_dims(self.dims, vec),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) => last_err = e,
            }
        }

        Err(last_err)
    }
}

/// Extract `data[0].embedding` from an embeddings API response.
pub fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbedError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbedError::Malformed("missing data[0].embedding".to_string()))?;

    embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbedError::Malformed(format!("non-numeric value: {}", v)))
        })
        .collect()
}

// ============ Batch Embedder ============

/// Sequential, rate-limited embedding of many texts.
///
/// Each text gets its own result: one failed item never stops the rest.
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    observer: Arc<dyn RetrievalObserver>,
    call_delay: Duration,
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, call_delay: Duration) -> Self {
        Self {
            provider,
            observer: Arc::new(NoopObserver),
            call_delay,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetrievalObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed `texts` in order, one result per input.
    ///
    /// `label` prefixes the per-item targets reported to the observer
    /// (`"{label}#{index}"`).
    pub async fn embed_batch(
        &self,
        label: &str,
        texts: &[String],
    ) -> Vec<Result<Vec<f32>, EmbedError>> {
        let mut out = Vec::with_capacity(texts.len());

        for (i, text) in texts.iter().enumerate() {
            if i > 0 && !self.call_delay.is_zero() {
                tokio::time::sleep(self.call_delay).await;
            }

            let started = Instant::now();
            let result = self.provider.embed(text).await;
            self.observer.on_embed(&EmbedEvent {
                target: format!("{}#{}", label, i),
                ok: result.is_ok(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                error: result.as_ref().err().map(|e| e.to_string()),
            });
            out.push(result);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_context_core::observe::MemoryObserver;

    #[test]
    fn test_parse_response() {
        let json = serde_json::json!({"data": [{"embedding": [0.5, -1.0, 2]}]});
        assert_eq!(parse_embedding_response(&json).unwrap(), vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn test_parse_malformed() {
        for bad in [
            serde_json::json!({}),
            serde_json::json!({"data": []}),
            serde_json::json!({"data": [{"embedding": ["x"]}]}),
        ] {
            assert!(matches!(
                parse_embedding_response(&bad),
                Err(EmbedError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_create_disabled() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
    }

    #[test]
    fn test_openai_requires_model() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(OpenAIProvider::with_api_key(&config, "k").is_err());
    }

    /// Fails on texts containing "bad".
    struct PickyProvider;

    #[async_trait]
    impl EmbeddingProvider for PickyProvider {
        fn model_name(&self) -> &str {
            "picky"
        }

        fn dims(&self) -> usize {
            1
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            if text.contains("bad") {
                Err(EmbedError::Http {
                    status: 400,
                    message: "rejected".to_string(),
                })
            } else {
                Ok(vec![text.len() as f32])
            }
        }
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let observer = Arc::new(MemoryObserver::new());
        let embedder = BatchEmbedder::new(Arc::new(PickyProvider), Duration::ZERO)
            .with_observer(observer.clone());
        let texts = vec!["ok".to_string(), "bad".to_string(), "fine".to_string()];

        let results = embedder.embed_batch("doc", &texts).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], Ok(vec![2.0]));
        assert!(results[1].is_err());
        assert_eq!(results[2], Ok(vec![4.0]));

        let events = observer.embeds();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].target, "doc#1");
        assert!(!events[1].ok);
    }

    #[tokio::test]
    async fn test_disabled_provider_fails() {
        assert_eq!(DisabledProvider.embed("x").await, Err(EmbedError::Disabled));
    }
}
