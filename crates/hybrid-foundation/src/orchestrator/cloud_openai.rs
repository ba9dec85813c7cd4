//! Cloud OpenAI Provider: `InferenceBackend` over HTTP + SSE
//!
//! This module implements [`InferenceBackend`] against any OpenAI-compatible
//! `POST {base_url}/chat/completions` endpoint (OpenAI, vLLM, Ollama,
//! LocalAI, a corporate proxy, ...). It is the remote half of the hybrid
//! client:
//!
//! ```text
//!   Request → [Router] → local disqualified / loading? ── Yes ──┐
//!                                                              ▼
//!                                           CloudOpenAIProvider  ← this module
//!                                              │          │
//!                                       complete()    stream()
//!                                       JSON body     text/event-stream → SseParser
//! ```
//!
//! ## Retry Strategy
//!
//! Only request setup is retried; bytes already streamed are never replayed.
//!
//! ```text
//! Attempt 0: immediate
//! Attempt 1: base_delay × 2^0   (1s by default)
//! Attempt 2: base_delay × 2^1   (2s)
//! ...
//! ```
//!
//! - HTTP 5xx and network failures retry up to `retries` times.
//! - Any other non-2xx status fails at once with `transport-failed`.
//!
//! ## Timeout vs Cancellation
//!
//! Each attempt races three things: the HTTP call, a `timeout_ms` deadline
//! and the caller's [`CancellationToken`]. Both losers abort the same HTTP
//! call, but they surface as different codes: `timeout` for the deadline,
//! `aborted` for the token. Backoff sleeps are cancellable the same way. For
//! a non-streaming call the deadline also covers reading the body; an open
//! stream is bounded only by the caller's token.
//!
//! ## Thread Safety
//!
//! The `reqwest::Client` is created once and reused, so requests share its
//! connection pool. Readiness is an `AtomicBool`, so `is_ready()` never
//! blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::InferenceBackend;
use super::error::{InferenceError, InferenceResult};
use super::sse::parse_sse_stream;
use super::telemetry::DeviceStats;
use super::types::{
    ChatCompletion, ChatCompletionRequest, ChatRole, ChunkStream, ResponseFormat,
};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MODEL: &str = "default";

const COMPLETIONS_PATH: &str = "/chat/completions";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for an OpenAI-compatible endpoint.
///
/// # Example
///
/// ```rust
/// use hybrid_foundation::orchestrator::cloud_openai::CloudOptions;
///
/// let options = CloudOptions::new("https://api.openai.com/v1")
///     .with_api_key("sk-...")
///     .with_model("gpt-4o-mini")
///     .with_retries(2);
/// assert_eq!(options.timeout_ms, 30_000);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudOptions {
    /// Base URL, with or without a trailing `/chat/completions`.
    #[serde(rename = "baseURL", alias = "baseUrl")]
    pub base_url: String,

    /// Sent as `Authorization: Bearer <key>` when set.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model used when the request does not name one.
    #[serde(default)]
    pub model: Option<String>,

    /// Extra headers. They may override `Content-Type` but not
    /// `Authorization` when an API key is configured.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Per-attempt deadline in milliseconds.
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,

    /// Retries after the first attempt for 5xx and network failures.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Backoff base. The delay before retry `n` (0-based) is `base × 2^n`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

impl std::fmt::Debug for CloudOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudOptions")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout_ms", &self.timeout_ms)
            .field("retries", &self.retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .finish()
    }
}

impl CloudOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: None,
            headers: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }

    /// Read `OPENAI_BASE_URL` (required), `OPENAI_API_KEY` and `OPENAI_MODEL`.
    pub fn try_from_env() -> InferenceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> InferenceResult<Self> {
        let base_url = lookup("OPENAI_BASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                InferenceError::no_provider("OPENAI_BASE_URL environment variable not set")
            })?;
        let mut options = Self::new(base_url);
        options.api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
        options.model = lookup("OPENAI_MODEL").filter(|m| !m.is_empty());
        Ok(options)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.retry_base_delay_ms = ms;
        self
    }

    /// Full endpoint URL.
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with(COMPLETIONS_PATH) {
            base.to_string()
        } else {
            format!("{}{}", base, COMPLETIONS_PATH)
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage {
    role: ChatRole,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

// ============================================================================
// CloudOpenAIProvider
// ============================================================================

/// Cloud backend speaking the OpenAI chat completions protocol.
pub struct CloudOpenAIProvider {
    client: reqwest::Client,
    options: CloudOptions,
    url: String,
    ready: AtomicBool,
}

impl std::fmt::Debug for CloudOpenAIProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudOpenAIProvider")
            .field("options", &self.options)
            .field("ready", &self.ready.load(Ordering::Acquire))
            .finish()
    }
}

impl CloudOpenAIProvider {
    /// Create the provider. No request is made until the first call.
    pub fn new(options: CloudOptions) -> InferenceResult<Self> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            InferenceError::backend_unavailable(format!("Failed to build HTTP client: {}", e))
                .with_cause(e)
        })?;
        Ok(Self {
            url: options.endpoint(),
            client,
            options,
            ready: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &CloudOptions {
        &self.options
    }

    /// Model for a request: request, then config, then `"default"`.
    fn resolve_model<'a>(&'a self, request: &'a ChatCompletionRequest) -> &'a str {
        request
            .model
            .as_deref()
            .or(self.options.model.as_deref())
            .unwrap_or(DEFAULT_MODEL)
    }

    fn build_headers(&self) -> InferenceResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                InferenceError::transport_failed(format!("Invalid header name '{}'", name))
                    .with_cause(e)
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                InferenceError::transport_failed(format!("Invalid value for header '{}'", name))
                    .with_cause(e)
            })?;
            headers.insert(name, value);
        }

        if let Some(key) = self.options.api_key.as_deref().filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|e| {
                InferenceError::transport_failed("API key is not a valid header value")
                    .with_cause(e)
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    fn build_body(&self, request: &ChatCompletionRequest, stream: bool) -> InferenceResult<Vec<u8>> {
        let wire = WireRequest {
            model: self.resolve_model(request),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: m.text(),
                })
                .collect(),
            stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.response_format,
        };
        serde_json::to_vec(&wire).map_err(|e| {
            InferenceError::transport_failed("Failed to encode request body").with_cause(e)
        })
    }

    fn ensure_ready(&self) -> InferenceResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(InferenceError::backend_unavailable(
                "CloudOpenAI provider not initialized",
            ))
        }
    }

    fn timed_out(&self) -> InferenceError {
        InferenceError::timeout(format!(
            "Request timed out after {}ms",
            self.options.timeout_ms
        ))
    }

    /// Send with retry. Returns the successful response and the deadline of
    /// the attempt that produced it.
    async fn send_with_retry(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
        cancel: &CancellationToken,
    ) -> InferenceResult<(reqwest::Response, Instant)> {
        let headers = self.build_headers()?;
        let body = self.build_body(request, stream)?;
        let retries = self.options.retries;
        let timeout = Duration::from_millis(self.options.timeout_ms);

        tracing::debug!(
            "CloudOpenAI: POST {} model='{}' stream={} messages={}",
            self.url,
            self.resolve_model(request),
            stream,
            request.messages.len()
        );

        for attempt in 0..=retries {
            let deadline = Instant::now() + timeout;
            let send = self
                .client
                .post(&self.url)
                .headers(headers.clone())
                .body(body.clone())
                .send();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InferenceError::aborted("Request aborted")),
                _ = tokio::time::sleep_until(deadline) => return Err(self.timed_out()),
                outcome = send => outcome,
            };

            let failure = match outcome {
                Ok(response) if response.status().is_success() => {
                    return Ok((response, deadline));
                }
                Ok(response) if response.status().is_server_error() && attempt < retries => {
                    format!("HTTP {}", response.status().as_u16())
                }
                Ok(response) => {
                    let status = response.status();
                    tracing::error!("CloudOpenAI: request failed with HTTP {}", status.as_u16());
                    return Err(InferenceError::transport_failed(format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown Status")
                    )));
                }
                Err(e) if e.is_builder() => {
                    return Err(InferenceError::transport_failed(format!(
                        "Invalid request: {}",
                        e
                    ))
                    .with_cause(e));
                }
                Err(e) if attempt < retries => e.to_string(),
                Err(e) => {
                    tracing::error!("CloudOpenAI: network failure: {}", e);
                    return Err(
                        InferenceError::transport_failed(format!("Network error: {}", e))
                            .with_cause(e),
                    );
                }
            };

            let delay = self.options.backoff_delay(attempt);
            tracing::warn!(
                "CloudOpenAI: retry attempt {}/{} after {:?} ({})",
                attempt + 1,
                retries,
                delay,
                failure
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(InferenceError::aborted("Request aborted")),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(InferenceError::transport_failed("All retries exhausted"))
    }
}

// ============================================================================
// InferenceBackend Implementation
// ============================================================================

#[async_trait]
impl InferenceBackend for CloudOpenAIProvider {
    fn name(&self) -> &str {
        "CloudOpenAI"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// No network I/O; connections are opened lazily by the pool.
    async fn initialize(&self, _stats: &DeviceStats) -> InferenceResult<()> {
        tracing::info!(
            "CloudOpenAI: initialized with url='{}', model={:?}",
            self.url,
            self.options.model,
        );
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChatCompletion> {
        self.ensure_ready()?;
        let (response, deadline) = self.send_with_retry(request, false, &cancel).await?;

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::aborted("Request aborted")),
            _ = tokio::time::sleep_until(deadline) => return Err(self.timed_out()),
            body = response.bytes() => body,
        };
        let body = body.map_err(|e| {
            InferenceError::transport_failed(format!("Failed to read response body: {}", e))
                .with_cause(e)
        })?;

        serde_json::from_slice::<ChatCompletion>(&body).map_err(|e| {
            InferenceError::transport_failed(format!("Malformed completion body: {}", e))
                .with_cause(e)
        })
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChunkStream> {
        self.ensure_ready()?;
        let (response, _) = self.send_with_retry(request, true, &cancel).await?;
        tracing::debug!("CloudOpenAI: stream opened");
        Ok(parse_sse_stream(response.bytes_stream(), cancel))
    }

    async fn dispose(&self) {
        if self.ready.swap(false, Ordering::AcqRel) {
            tracing::info!("CloudOpenAI: disposed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
