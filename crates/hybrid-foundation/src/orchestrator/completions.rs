//! Completions Orchestrator
//!
//! Entry point for chat completions. Every call profiles the device, asks
//! the router for a backend, runs the request there and, on failure, makes
//! exactly one attempt on the other side:
//!
//! ```text
//!                 ┌──────────────┐
//!   request ─────▶│ decide_route │──▶ attempt 1 ──ok──▶ result
//!                 └──────────────┘        │
//!                                       error
//!                                         │ aborted / timeout / queue-full
//!                                         ├──────────────────────────▶ error
//!                                         ▼
//!                     local failed ─▶ cloud      (reason local-error)
//!                     cloud failed ─▶ local, only if ready
//!                                         │
//!                                         ▼
//!                                     attempt 2 ──▶ result or error
//! ```
//!
//! A streaming call falls back only while no chunk carrying a finish reason
//! has been yielded. The caller sees one continuous sequence.

use std::sync::{Arc, PoisonError, RwLock};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::backend::InferenceBackend;
use super::error::{ErrorCode, InferenceError, InferenceResult};
use super::router::{RouteContext, RouteDecision, RouteEvent, RouteObserver, RouteReason, decide_route};
use super::telemetry::CapabilityProfiler;
use super::types::{ChatCompletion, ChatCompletionRequest, ChunkStream, Provider};

type SharedBackend = Arc<dyn InferenceBackend>;

// ============================================================================
// BackendSlots
// ============================================================================

/// The client's current local and cloud backends.
///
/// Slots change while the client lives (background local initialization,
/// explicit unload), so the orchestrator reads them per call.
#[derive(Default)]
pub struct BackendSlots {
    local: RwLock<Option<SharedBackend>>,
    cloud: RwLock<Option<SharedBackend>>,
}

impl std::fmt::Debug for BackendSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = |slot: Option<SharedBackend>| slot.map(|b| b.name().to_string());
        f.debug_struct("BackendSlots")
            .field("local", &name(self.local()))
            .field("cloud", &name(self.cloud()))
            .finish()
    }
}

impl BackendSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> Option<SharedBackend> {
        self.local.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn cloud(&self) -> Option<SharedBackend> {
        self.cloud.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_local(&self, backend: Option<SharedBackend>) -> Option<SharedBackend> {
        std::mem::replace(
            &mut *self.local.write().unwrap_or_else(PoisonError::into_inner),
            backend,
        )
    }

    pub fn set_cloud(&self, backend: Option<SharedBackend>) -> Option<SharedBackend> {
        std::mem::replace(
            &mut *self.cloud.write().unwrap_or_else(PoisonError::into_inner),
            backend,
        )
    }

    fn get(&self, provider: Provider) -> Option<SharedBackend> {
        match provider {
            Provider::Local => self.local(),
            Provider::Cloud => self.cloud(),
        }
    }
}

// ============================================================================
// Completions
// ============================================================================

/// Result of [`Completions::create`].
pub enum CompletionResponse {
    Completion(ChatCompletion),
    Stream(ChunkStream),
}

impl std::fmt::Debug for CompletionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completion(c) => f.debug_tuple("Completion").field(c).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

struct Attempt {
    provider: Provider,
    backend: SharedBackend,
    context: RouteContext,
}

struct CompletionsInner {
    slots: Arc<BackendSlots>,
    profiler: Arc<CapabilityProfiler>,
    on_route: Option<RouteObserver>,
}

/// Routes chat completions and performs the single fallback.
#[derive(Clone)]
pub struct Completions {
    inner: Arc<CompletionsInner>,
}

impl std::fmt::Debug for Completions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completions")
            .field("slots", &self.inner.slots)
            .field("on_route", &self.inner.on_route.is_some())
            .finish()
    }
}

/// Errors that end the call instead of triggering a fallback.
fn ends_call(error: &InferenceError) -> bool {
    matches!(
        error.code(),
        ErrorCode::Aborted | ErrorCode::Timeout | ErrorCode::QueueFull
    )
}

impl Completions {
    pub fn new(
        slots: Arc<BackendSlots>,
        profiler: Arc<CapabilityProfiler>,
        on_route: Option<RouteObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(CompletionsInner {
                slots,
                profiler,
                on_route,
            }),
        }
    }

    /// Dispatch on `request.stream`.
    pub async fn create(&self, request: ChatCompletionRequest) -> InferenceResult<CompletionResponse> {
        if request.stream {
            Ok(CompletionResponse::Stream(self.stream(request).await?))
        } else {
            Ok(CompletionResponse::Completion(self.complete(request).await?))
        }
    }

    async fn route(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> InferenceResult<(RouteDecision, Attempt)> {
        let profiler = &self.inner.profiler;
        let signals = async { (profiler.profile().await, profiler.is_online().await) };
        let (stats, online) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Completions: cancelled while profiling device");
                return Err(InferenceError::aborted("Request aborted"));
            }
            signals = signals => signals,
        };
        let local = self.inner.slots.local();
        let cloud = self.inner.slots.cloud();

        let decision = decide_route(
            local.as_deref(),
            cloud.as_deref(),
            &stats,
            request.provider,
            online,
        )?;
        let backend = match decision.chosen {
            Provider::Local => local,
            Provider::Cloud => cloud,
        }
        .ok_or_else(|| InferenceError::no_provider("Routed backend is not configured"))?;

        let attempt = Attempt {
            provider: decision.chosen,
            backend,
            context: decision.context(1),
        };
        Ok((decision, attempt))
    }

    /// The alternate backend for a failed first attempt, if one applies.
    fn fallback(
        &self,
        decision: &RouteDecision,
        error: &InferenceError,
        cancel: &CancellationToken,
    ) -> Option<Attempt> {
        if cancel.is_cancelled() || ends_call(error) {
            return None;
        }
        match decision.chosen {
            Provider::Local => self.inner.slots.get(Provider::Cloud).map(|backend| Attempt {
                provider: Provider::Cloud,
                backend,
                context: RouteContext {
                    reason: RouteReason::LocalError,
                    stats: decision.stats.clone(),
                    attempt: 2,
                },
            }),
            Provider::Cloud => self
                .inner
                .slots
                .get(Provider::Local)
                .filter(|backend| backend.is_ready())
                .map(|backend| Attempt {
                    provider: Provider::Local,
                    backend,
                    context: decision.context(2),
                }),
        }
    }

    fn announce(&self, attempt: &Attempt, request: &mut ChatCompletionRequest) {
        let event = RouteEvent {
            chosen: attempt.provider,
            reason: attempt.context.reason,
            attempt: attempt.context.attempt,
        };
        tracing::debug!(
            "Completions: attempt {} on {} ({}, reason {})",
            event.attempt,
            event.chosen,
            attempt.backend.name(),
            event.reason
        );
        if let Some(observer) = &self.inner.on_route {
            observer(&event);
        }
        request.route = Some(attempt.context.clone());
    }

    /// One-shot completion with a single fallback.
    pub async fn complete(&self, request: ChatCompletionRequest) -> InferenceResult<ChatCompletion> {
        let mut request = request.normalized();
        let cancel = request.cancel_token();
        let (decision, primary) = self.route(&request, &cancel).await?;

        self.announce(&primary, &mut request);
        let error = match primary.backend.complete(&request, cancel.clone()).await {
            Ok(completion) => return Ok(completion),
            Err(e) => e,
        };

        let Some(fallback) = self.fallback(&decision, &error, &cancel) else {
            return Err(error);
        };
        tracing::warn!(
            "Completions: {} attempt failed ({}), falling back to {}",
            primary.provider,
            error,
            fallback.provider
        );
        self.announce(&fallback, &mut request);
        fallback.backend.complete(&request, cancel).await
    }

    /// Streaming completion with a single fallback.
    ///
    /// Routing errors are returned here. Backend errors arrive as stream
    /// items.
    pub async fn stream(&self, request: ChatCompletionRequest) -> InferenceResult<ChunkStream> {
        let mut request = request.normalized();
        let cancel = request.cancel_token();
        let (decision, primary) = self.route(&request, &cancel).await?;
        self.announce(&primary, &mut request);
        let this = self.clone();

        Ok(Box::pin(async_stream::stream! {
            let error = match primary.backend.stream(&request, cancel.clone()).await {
                Ok(mut chunks) => {
                    let mut finished = false;
                    let mut failure = None;
                    while let Some(item) = chunks.next().await {
                        match item {
                            Ok(chunk) => {
                                finished |= chunk.choices.iter().any(|c| c.finish_reason.is_some());
                                yield Ok(chunk);
                            }
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    match failure {
                        None => return,
                        Some(e) if finished => {
                            yield Err(e);
                            return;
                        }
                        Some(e) => e,
                    }
                }
                Err(e) => e,
            };

            let Some(fallback) = this.fallback(&decision, &error, &cancel) else {
                yield Err(error);
                return;
            };
            tracing::warn!(
                "Completions: {} stream failed ({}), falling back to {}",
                primary.provider,
                error,
                fallback.provider
            );
            this.announce(&fallback, &mut request);

            match fallback.backend.stream(&request, cancel.clone()).await {
                Ok(mut chunks) => {
                    while let Some(item) = chunks.next().await {
                        yield item;
                    }
                }
                Err(e) => yield Err(e),
            }
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================
