//! Unified Inference Backend Trait
//!
//! This module defines **`InferenceBackend`**, the one contract that both the
//! device-resident local engine and the remote cloud endpoint satisfy. The
//! router and the completions orchestrator only ever hold
//! `Arc<dyn InferenceBackend>` and never know which kind they have.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                   Completions Orchestrator                       │
//! │         (ChatCompletionRequest → ChatCompletion / chunks)        │
//! └────────────────────────────┬─────────────────────────────────────┘
//!                              │  Arc<dyn InferenceBackend>
//! ┌────────────────────────────┴─────────────────────────────────────┐
//! │                    InferenceBackend Trait                        │
//! │  ┌──────────────┐  ┌────────────────────┐  ┌─────────────────┐   │
//! │  │ LocalBackend │  │ CloudOpenAIProvider│  │CustomCloudBack. │   │
//! │  │ (LocalEngine)│  │  (HTTP + SSE)      │  │ (CloudFunction) │   │
//! │  └──────────────┘  └────────────────────┘  └─────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shared pre/post-conditions
//!
//! - `is_ready()` never blocks and reads a flag the backend flips atomically.
//! - `complete()` and `stream()` take a [`CancellationToken`]. A cancelled
//!   token surfaces as [`ErrorCode::Aborted`](super::error::ErrorCode),
//!   never as another code.
//! - `stream()` returns a `'static` stream. It owns whatever it needs and
//!   may outlive the borrow of `self`.
//! - `dispose()` is idempotent. Afterwards `is_ready()` is `false` and new
//!   calls fail with `backend-unavailable`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::InferenceResult;
use super::telemetry::DeviceStats;
use super::types::{ChatCompletion, ChatCompletionRequest, ChunkStream};

/// The core backend contract.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Human-readable name for logs, e.g. `"CloudOpenAI"` or `"Local"`.
    fn name(&self) -> &str;

    /// Non-blocking readiness check.
    fn is_ready(&self) -> bool;

    /// Prepare the backend.
    ///
    /// The local side resolves and loads a model for the device grade in
    /// `stats`. Cloud backends treat this as a no-op that only flips ready.
    async fn initialize(&self, stats: &DeviceStats) -> InferenceResult<()>;

    /// Run a request to completion.
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChatCompletion>;

    /// Start a streaming request.
    ///
    /// Errors before the first chunk may come back either from this call or
    /// as the first stream item. Cancelling `cancel` ends the stream with an
    /// `aborted` item.
    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChunkStream>;

    /// Release resources. Safe to call more than once.
    async fn dispose(&self);
}

// ============================================================================
// Tests
// ============================================================================
