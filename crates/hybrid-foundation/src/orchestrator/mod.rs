//! Hybrid Inference Orchestrator
//!
//! One chat-completion API over two very different backends: a
//! device-resident local engine and an OpenAI-compatible cloud endpoint.
//! Every request is routed from live device signals and falls back to the
//! other side once on failure.
//!
//! ## Core
//!
//! - **[`InferenceBackend`]**: Object-safe async trait both sides implement
//! - **[`CapabilityProfiler`]**: Populate-once device snapshot and grade
//! - **[`decide_route`]**: Pure routing decision (force, disqualifiers, readiness)
//! - **[`RequestQueue`]**: Bounded FIFO serializing the local engine
//! - **[`Completions`]**: Routed execution with a single fallback
//!
//! ## Backends
//!
//! - **[`CloudOpenAIProvider`]**: HTTP + SSE transport with retry/backoff
//! - **[`CustomCloudBackend`]**: Caller-supplied [`CloudFunction`]
//! - **[`LocalBackend`]**: Queue-serialized [`LocalEngine`] with tiered model selection
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     HybridClient                              │
//! │   LocalConfig ──▶ resolve_local    CloudConfig ──▶ resolve_cloud
//! └────────────────────────┬──────────────────────────────────────┘
//!                          │ ChatCompletionRequest
//!                          ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Completions                               │
//! │  ┌────────────────────┐      ┌──────────────────────────┐     │
//! │  │ CapabilityProfiler │─────▶│ decide_route(stats, ..)  │     │
//! │  └────────────────────┘      └──────────┬───────────────┘     │
//! │                                  local ┌┴┐ cloud              │
//! │                                        ▼ ▼                    │
//! │                 ┌──────────────────┐ ┌───────────────────┐    │
//! │                 │ LocalBackend     │ │ CloudOpenAI /     │    │
//! │                 │  └ RequestQueue  │ │ CustomCloud       │    │
//! │                 └────────┬─────────┘ └─────────┬─────────┘    │
//! │                          └──── fallback once ──┘              │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ---------------------------------------------------------------------------
// Shared types and errors
// ---------------------------------------------------------------------------

/// Error taxonomy: `InferenceError` with a stable `ErrorCode`.
pub mod error;

/// Chat messages, requests, completions and chunks.
pub mod types;

/// The `InferenceBackend` trait: object-safe async interface for all backends.
pub mod backend;

// ---------------------------------------------------------------------------
// Device signals and routing
// ---------------------------------------------------------------------------

/// Device probing, grading and the process-wide capability snapshot.
pub mod telemetry;

/// Pure routing strategy over device stats and backend readiness.
pub mod router;

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Bounded FIFO that runs one task at a time.
pub mod queue;

/// Incremental Server-Sent Events parser.
pub mod sse;

/// OpenAI-compatible cloud backend over HTTP + SSE.
pub mod cloud_openai;

/// Cloud backend over a caller-supplied function.
pub mod custom;

/// Per-model load state tracking.
pub mod loader;

/// Local backend over an external model engine.
pub mod local;

// ---------------------------------------------------------------------------
// Configuration and entry points
// ---------------------------------------------------------------------------

/// Configuration classification into backend factories.
pub mod resolver;

/// Routed completions with single fallback.
pub mod completions;

/// Client facade owning both backends.
pub mod client;

// ── Re-exports: shared ──

pub use backend::InferenceBackend;
pub use error::{BoxError, ErrorCode, InferenceError, InferenceResult};
pub use types::{
    AssistantMessage, ChatCompletion, ChatCompletionChoice, ChatCompletionChunk,
    ChatCompletionChunkChoice, ChatCompletionRequest, ChatMessage, ChatRole, ChunkDelta,
    ChunkStream, ContentPart, FinishReason, ImageUrl, MessageContent, Provider, ResponseFormat,
    ResponseFormatType, TokenUsage, flatten_content, with_json_output,
};

// ── Re-exports: device signals and routing ──

pub use router::{
    LOW_BATTERY_THRESHOLD, RouteContext, RouteDecision, RouteEvent, RouteObserver, RouteReason,
    decide_route, local_disqualifier,
};
pub use telemetry::{
    BatteryInfo, CapabilityProfiler, CapabilityReport, ConnectionState, DeviceProbe, DeviceStats,
    GpuInfo, Grade, SystemProbe, grade,
};

// ── Re-exports: backends ──

pub use cloud_openai::{CloudOpenAIProvider, CloudOptions};
pub use custom::{CloudFunction, CloudFunctionOutput, CustomCloudBackend, cloud_fn};
pub use loader::{LoadManager, LoadStatus, ModelLoadState};
pub use local::{
    HIGH_TIER_MODEL, LoadOptions, LoadProgress, LoadStage, LocalBackend, LocalEngine,
    LocalOptions, LocalSelector, MEDIUM_TIER_MODEL, ModelSelection, ProgressCallback, TierChoice,
    TierTable,
};
pub use queue::{DEFAULT_QUEUE_SIZE, QueueTicket, RequestQueue};
pub use sse::{SseFrame, SseParser, parse_sse_stream};

// ── Re-exports: configuration and entry points ──

pub use client::{ErrorCallback, HybridClient, HybridClientBuilder, LocalStatus};
pub use completions::{BackendSlots, CompletionResponse, Completions};
pub use resolver::{
    CloudConfig, LocalConfig, LocalFactoryContext, LocalInstance, ResolvedCloud, ResolvedLocal,
    resolve_cloud, resolve_local,
};
