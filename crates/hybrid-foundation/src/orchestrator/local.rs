//! Local Backend: Device-Resident Engine behind the Request Queue
//!
//! The model engine itself (weights download, compilation, accelerator
//! lifecycle, on-disk cache) lives outside this crate and is reached through
//! the [`LocalEngine`] trait. [`LocalBackend`] wraps an engine and adds what
//! the rest of the client relies on:
//!
//! - **Model selection**: an explicit model, a tier table keyed by device
//!   grade, or a caller-supplied selector.
//! - **Load supersession**: a new `load()` cancels the in-flight load, waits
//!   for it to unwind, releases the engine and only then starts.
//! - **Progress**: engine progress is forwarded to the caller's callback and
//!   recorded in the [`LoadManager`].
//! - **Serialization**: every `complete()` and `stream()` runs through one
//!   [`RequestQueue`], so the engine never serves two generations at once.
//!   A stream holds the slot until it ends or the consumer drops it.
//! - **Interruption**: cancelling a request calls [`LocalEngine::interrupt`],
//!   which stops generation without unloading the model.
//!
//! ```text
//!  grade ─▶ select model ─▶ load(model) ─▶ ready
//!                              │  ▲
//!              new load() ─────┘  └── progress: download → compile → warmup
//!
//!  complete()/stream() ─▶ RequestQueue ─▶ engine (one at a time)
//!                                            ▲
//!                      cancel ─▶ interrupt() ┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::InferenceBackend;
use super::error::{InferenceError, InferenceResult};
use super::loader::{LoadManager, LoadStatus};
use super::queue::{QueueTicket, RequestQueue};
use super::telemetry::{DeviceStats, Grade};
use super::types::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChunkStream};

/// Built-in model for grades S and A.
pub const HIGH_TIER_MODEL: &str = "Llama-3.1-8B-Instruct-q4f16_1-MLC";
/// Built-in model for grade B, and for grade C when its tier is `auto`.
pub const MEDIUM_TIER_MODEL: &str = "Phi-3.5-mini-instruct-q4f16_1-MLC";

const STREAM_BUFFER: usize = 32;

// ============================================================================
// Engine contract
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStage {
    Download,
    Compile,
    Warmup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    pub stage: LoadStage,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_loaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
}

impl LoadProgress {
    pub fn new(stage: LoadStage, progress: f64, model: impl Into<String>) -> Self {
        Self {
            stage,
            progress,
            model: model.into(),
            bytes_loaded: None,
            bytes_total: None,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(&LoadProgress) + Send + Sync>;

/// Engine hints carried from [`LocalOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub use_cache: bool,
    pub use_worker: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            use_worker: true,
        }
    }
}

/// The device-resident model engine.
///
/// Implementations must honor `cancel` in `load`, make `interrupt` stop the
/// current generation without dropping the model, and make `unload`
/// idempotent.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    async fn load(
        &self,
        model_id: &str,
        options: &LoadOptions,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> InferenceResult<()>;

    async fn complete(&self, request: &ChatCompletionRequest) -> InferenceResult<ChatCompletion>;

    async fn stream(&self, request: &ChatCompletionRequest) -> InferenceResult<ChunkStream>;

    /// Stop the in-flight generation, if any.
    fn interrupt(&self);

    /// Release the model and its worker/device resources.
    async fn unload(&self) -> InferenceResult<()>;

    async fn has_model_in_cache(&self, model_id: &str) -> InferenceResult<bool>;

    async fn delete_model_from_cache(&self, model_id: &str) -> InferenceResult<()>;
}

// ============================================================================
// Model selection
// ============================================================================

/// One entry of the tier table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum TierChoice {
    /// Use the built-in default for this tier.
    Auto,
    Model(String),
    /// No suitable model at this tier.
    Unavailable,
}

impl TierChoice {
    pub fn auto() -> Self {
        Self::Auto
    }

    pub fn unavailable() -> Self {
        Self::Unavailable
    }
}

impl From<Option<String>> for TierChoice {
    fn from(value: Option<String>) -> Self {
        match value {
            None => Self::Unavailable,
            Some(model) if model == "auto" => Self::Auto,
            Some(model) => Self::Model(model),
        }
    }
}

impl From<TierChoice> for Option<String> {
    fn from(choice: TierChoice) -> Self {
        match choice {
            TierChoice::Auto => Some("auto".to_string()),
            TierChoice::Model(model) => Some(model),
            TierChoice::Unavailable => None,
        }
    }
}

impl From<&str> for TierChoice {
    fn from(value: &str) -> Self {
        Some(value.to_string()).into()
    }
}

/// Models per grade tier. Missing `high`/`medium` entries mean `auto`; a
/// missing `low` entry means no model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "TierChoice::auto")]
    pub high: TierChoice,
    #[serde(default = "TierChoice::auto")]
    pub medium: TierChoice,
    #[serde(default = "TierChoice::unavailable")]
    pub low: TierChoice,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            high: TierChoice::Auto,
            medium: TierChoice::Auto,
            low: TierChoice::Unavailable,
        }
    }
}

impl TierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high(mut self, choice: impl Into<TierChoice>) -> Self {
        self.high = choice.into();
        self
    }

    pub fn with_medium(mut self, choice: impl Into<TierChoice>) -> Self {
        self.medium = choice.into();
        self
    }

    pub fn with_low(mut self, choice: impl Into<TierChoice>) -> Self {
        self.low = choice.into();
        self
    }

    /// Model for a device grade, or `None` when that tier has no model.
    pub fn model_for_grade(&self, grade: Grade) -> Option<String> {
        match grade {
            Grade::S | Grade::A => match &self.high {
                TierChoice::Auto => Some(HIGH_TIER_MODEL.to_string()),
                TierChoice::Model(model) => Some(model.clone()),
                TierChoice::Unavailable => None,
            },
            Grade::B => match &self.medium {
                TierChoice::Auto => Some(MEDIUM_TIER_MODEL.to_string()),
                TierChoice::Model(model) => Some(model.clone()),
                TierChoice::Unavailable => None,
            },
            // The built-in low tier has no model, so `auto` borrows medium.
            Grade::C => match &self.low {
                TierChoice::Auto => Some(MEDIUM_TIER_MODEL.to_string()),
                TierChoice::Model(model) => Some(model.clone()),
                TierChoice::Unavailable => None,
            },
        }
    }
}

/// Structured local configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalOptions {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tiers: Option<TierTable>,
    #[serde(default)]
    pub use_cache: Option<bool>,
    #[serde(default, alias = "useWebWorker")]
    pub use_worker: Option<bool>,
}

impl LocalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tiers(mut self, tiers: TierTable) -> Self {
        self.tiers = Some(tiers);
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }

    pub fn with_use_worker(mut self, use_worker: bool) -> Self {
        self.use_worker = Some(use_worker);
        self
    }

    pub fn load_options(&self) -> LoadOptions {
        let defaults = LoadOptions::default();
        LoadOptions {
            use_cache: self.use_cache.unwrap_or(defaults.use_cache),
            use_worker: self.use_worker.unwrap_or(defaults.use_worker),
        }
    }

    /// Explicit model wins; otherwise the tier table (or the default one).
    pub fn selection(&self) -> ModelSelection {
        match &self.model {
            Some(model) => ModelSelection::Explicit(model.clone()),
            None => ModelSelection::Tiered(self.tiers.clone().unwrap_or_default()),
        }
    }
}

/// Caller-supplied model selector.
pub type LocalSelector = Arc<dyn Fn(&DeviceStats) -> Option<String> + Send + Sync>;

/// How the local backend picks a model at initialization.
#[derive(Clone)]
pub enum ModelSelection {
    Explicit(String),
    Tiered(TierTable),
    Selector(LocalSelector),
}

impl std::fmt::Debug for ModelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit(model) => f.debug_tuple("Explicit").field(model).finish(),
            Self::Tiered(tiers) => f.debug_tuple("Tiered").field(tiers).finish(),
            Self::Selector(_) => f.write_str("Selector(..)"),
        }
    }
}

impl ModelSelection {
    pub fn select(&self, stats: &DeviceStats) -> Option<String> {
        match self {
            Self::Explicit(model) => Some(model.clone()),
            Self::Tiered(tiers) => tiers.model_for_grade(stats.grade),
            Self::Selector(selector) => selector(stats),
        }
    }
}

// ============================================================================
// LocalBackend
// ============================================================================

/// [`InferenceBackend`] over a [`LocalEngine`].
pub struct LocalBackend {
    engine: Arc<dyn LocalEngine>,
    selection: ModelSelection,
    load_options: LoadOptions,
    queue: RequestQueue,
    loads: Arc<LoadManager>,
    on_progress: Option<ProgressCallback>,
    ready: Arc<AtomicBool>,
    disposed: AtomicBool,
    current_model: RwLock<Option<String>>,
    /// Held for the whole duration of a load or unload.
    load_slot: tokio::sync::Mutex<()>,
    /// Token of the newest load, tagged with its generation.
    pending_load: Mutex<Option<(u64, CancellationToken)>>,
    load_generation: AtomicU64,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("selection", &self.selection)
            .field("current_model", &self.current_model())
            .field("ready", &self.ready.load(Ordering::Acquire))
            .field("queue", &self.queue)
            .finish()
    }
}

impl LocalBackend {
    pub fn new(engine: Arc<dyn LocalEngine>, selection: ModelSelection) -> Self {
        Self {
            engine,
            selection,
            load_options: LoadOptions::default(),
            queue: RequestQueue::default(),
            loads: Arc::new(LoadManager::new()),
            on_progress: None,
            ready: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
            current_model: RwLock::new(None),
            load_slot: tokio::sync::Mutex::new(()),
            pending_load: Mutex::new(None),
            load_generation: AtomicU64::new(0),
        }
    }

    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.load_options = options;
        self
    }

    pub fn with_queue_size(mut self, max_size: usize) -> Self {
        self.queue = RequestQueue::new(max_size);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_load_manager(mut self, loads: Arc<LoadManager>) -> Self {
        self.loads = loads;
        self
    }

    pub fn current_model(&self) -> Option<String> {
        self.current_model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn load_manager(&self) -> &Arc<LoadManager> {
        &self.loads
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    fn set_current_model(&self, model: Option<String>) {
        *self
            .current_model
            .write()
            .unwrap_or_else(PoisonError::into_inner) = model;
    }

    fn ensure_open(&self) -> InferenceResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(InferenceError::backend_unavailable("Local backend has been disposed"))
        } else {
            Ok(())
        }
    }

    /// Cancel the in-flight load, if any, and register `next` in its place.
    fn supersede(&self, next: Option<(u64, CancellationToken)>) {
        let previous = std::mem::replace(
            &mut *self
                .pending_load
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            next,
        );
        if let Some((generation, token)) = previous {
            tracing::info!("LocalBackend: cancelling in-flight load #{}", generation);
            token.cancel();
        }
    }

    /// Load `model_id`, superseding any load still in progress.
    pub async fn load(&self, model_id: &str) -> InferenceResult<()> {
        self.ensure_open()?;

        let generation = self.load_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CancellationToken::new();
        self.supersede(Some((generation, token.clone())));

        let _slot = self.load_slot.lock().await;
        let result = if token.is_cancelled() {
            Err(InferenceError::aborted("Model load superseded"))
        } else {
            self.load_exclusive(model_id, &token).await
        };

        let mut pending = self
            .pending_load
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(&*pending, Some((g, _)) if *g == generation) {
            *pending = None;
        }
        result
    }

    async fn load_exclusive(&self, model_id: &str, token: &CancellationToken) -> InferenceResult<()> {
        self.ready.store(false, Ordering::Release);
        if let Some(previous) = self.current_model() {
            self.loads.update(&previous, LoadStatus::Idle, Some(0.0));
        }
        self.set_current_model(None);
        // Releases the previous model and whatever a superseded load left behind.
        if let Err(e) = self.engine.unload().await {
            tracing::warn!("LocalBackend: unload before load failed: {}", e);
        }

        tracing::info!("LocalBackend: loading model '{}'", model_id);
        self.loads.update(model_id, LoadStatus::Downloading, Some(0.0));

        let loads = self.loads.clone();
        let on_progress = self.on_progress.clone();
        let progress: ProgressCallback = Arc::new(move |p: &LoadProgress| {
            let status = match p.stage {
                LoadStage::Download => LoadStatus::Downloading,
                LoadStage::Compile | LoadStage::Warmup => LoadStatus::Compiling,
            };
            loads.update(&p.model, status, Some(p.progress));
            if let Some(callback) = &on_progress {
                callback(p);
            }
        });

        let outcome = self
            .engine
            .load(model_id, &self.load_options, progress, token.clone())
            .await;

        match outcome {
            Ok(()) if token.is_cancelled() => {
                if let Err(e) = self.engine.unload().await {
                    tracing::warn!(
                        "LocalBackend: unload after superseded load of '{}' failed: {}",
                        model_id,
                        e
                    );
                }
                self.loads.update(model_id, LoadStatus::Idle, Some(0.0));
                Err(InferenceError::aborted("Model load superseded"))
            }
            Ok(()) => {
                self.set_current_model(Some(model_id.to_string()));
                self.loads.update(model_id, LoadStatus::Ready, Some(1.0));
                self.ready.store(true, Ordering::Release);
                tracing::info!("LocalBackend: model '{}' ready", model_id);
                Ok(())
            }
            Err(e) if token.is_cancelled() || e.is_cancellation() => {
                self.loads.update(model_id, LoadStatus::Idle, Some(0.0));
                Err(InferenceError::aborted("Model load cancelled").with_cause(e))
            }
            Err(e) => {
                tracing::error!("LocalBackend: failed to load '{}': {}", model_id, e);
                self.loads.fail(model_id, e.to_string());
                Err(
                    InferenceError::model_load_failed(format!("Failed to load model: {}", model_id))
                        .with_cause(e),
                )
            }
        }
    }

    /// Release the loaded model. A load in progress is cancelled first.
    pub async fn unload(&self) -> InferenceResult<()> {
        self.supersede(None);
        let _slot = self.load_slot.lock().await;
        self.ready.store(false, Ordering::Release);
        if let Some(model) = self.current_model() {
            self.loads.update(&model, LoadStatus::Idle, Some(0.0));
            tracing::info!("LocalBackend: unloading model '{}'", model);
        }
        self.set_current_model(None);
        self.engine.unload().await
    }

    pub async fn has_model_in_cache(&self, model_id: &str) -> InferenceResult<bool> {
        self.engine.has_model_in_cache(model_id).await
    }

    pub async fn delete_model_from_cache(&self, model_id: &str) -> InferenceResult<()> {
        self.engine.delete_model_from_cache(model_id).await
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn name(&self) -> &str {
        "Local"
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn initialize(&self, stats: &DeviceStats) -> InferenceResult<()> {
        self.ensure_open()?;
        let model = self.selection.select(stats).ok_or_else(|| {
            InferenceError::no_provider(format!(
                "No suitable local model for device grade {}",
                stats.grade
            ))
        })?;
        tracing::info!(
            "LocalBackend: selected '{}' for device grade {}",
            model,
            stats.grade
        );
        self.load(&model).await
    }

    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChatCompletion> {
        self.ensure_open()?;
        let engine = self.engine.clone();
        let ready = self.ready.clone();
        let request = request.clone();
        let task_cancel = cancel.clone();

        self.queue
            .enqueue(
                move || run_complete(engine, ready, request, task_cancel),
                Some(cancel),
            )
            .await
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChunkStream> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let engine = self.engine.clone();
        let ready = self.ready.clone();
        let request = request.clone();
        let task_cancel = cancel.clone();

        let ticket = self.queue.submit(
            move || pump_stream(engine, ready, request, task_cancel, tx),
            Some(cancel),
        )?;
        Ok(forward_stream(ticket, rx))
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("LocalBackend: disposing");
        self.queue.clear();
        self.engine.interrupt();
        if let Err(e) = self.unload().await {
            tracing::warn!("LocalBackend: unload during dispose failed: {}", e);
        }
    }
}

// ============================================================================
// Queued tasks
// ============================================================================

fn engine_failure(e: InferenceError, cancel: &CancellationToken, context: &str) -> InferenceError {
    if cancel.is_cancelled() || e.is_cancellation() {
        InferenceError::aborted("Request aborted during inference").with_cause(e)
    } else {
        InferenceError::inference_failed(context.to_string()).with_cause(e)
    }
}

fn not_loaded() -> InferenceError {
    InferenceError::inference_failed("Local engine has no model loaded")
}

async fn run_complete(
    engine: Arc<dyn LocalEngine>,
    ready: Arc<AtomicBool>,
    request: ChatCompletionRequest,
    cancel: CancellationToken,
) -> InferenceResult<ChatCompletion> {
    if !ready.load(Ordering::Acquire) {
        return Err(not_loaded());
    }
    if cancel.is_cancelled() {
        return Err(InferenceError::aborted("Request aborted"));
    }

    let generation = engine.complete(&request);
    tokio::pin!(generation);
    let outcome = tokio::select! {
        biased;
        outcome = &mut generation => Some(outcome),
        _ = cancel.cancelled() => None,
    };

    match outcome {
        Some(outcome) => outcome.map_err(|e| engine_failure(e, &cancel, "Local inference failed")),
        None => {
            engine.interrupt();
            // Hold the slot until the engine has actually stopped.
            let _ = generation.await;
            Err(InferenceError::aborted("Request aborted during inference"))
        }
    }
}

enum Pump {
    Cancelled,
    ConsumerGone,
    Item(Option<InferenceResult<ChatCompletionChunk>>),
}

async fn pump_stream(
    engine: Arc<dyn LocalEngine>,
    ready: Arc<AtomicBool>,
    request: ChatCompletionRequest,
    cancel: CancellationToken,
    tx: mpsc::Sender<ChatCompletionChunk>,
) -> InferenceResult<()> {
    if !ready.load(Ordering::Acquire) {
        return Err(not_loaded());
    }
    if cancel.is_cancelled() {
        return Err(InferenceError::aborted("Request aborted"));
    }

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = engine.stream(&request) => Some(opened),
    };
    let mut chunks = match opened {
        Some(Ok(chunks)) => chunks,
        Some(Err(e)) => return Err(engine_failure(e, &cancel, "Local streaming failed")),
        None => {
            engine.interrupt();
            return Err(InferenceError::aborted("Request aborted"));
        }
    };

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Pump::Cancelled,
            _ = tx.closed() => Pump::ConsumerGone,
            item = chunks.next() => Pump::Item(item),
        };
        match step {
            Pump::Cancelled => {
                engine.interrupt();
                return Err(InferenceError::aborted("Request aborted during streaming"));
            }
            Pump::ConsumerGone => {
                tracing::debug!("LocalBackend: stream consumer dropped, interrupting");
                engine.interrupt();
                return Ok(());
            }
            Pump::Item(None) => return Ok(()),
            Pump::Item(Some(Ok(chunk))) => {
                if tx.send(chunk).await.is_err() {
                    engine.interrupt();
                    return Ok(());
                }
            }
            Pump::Item(Some(Err(e))) => {
                return Err(engine_failure(e, &cancel, "Local streaming failed"));
            }
        }
    }
}

enum Forward {
    Chunk(Option<ChatCompletionChunk>),
    Settled(InferenceResult<()>),
}

/// Relay chunks from the queued pump, then surface the pump's error, if any.
fn forward_stream(
    ticket: QueueTicket<()>,
    mut rx: mpsc::Receiver<ChatCompletionChunk>,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut done = Box::pin(ticket.wait());
        let mut outcome: Option<InferenceResult<()>> = None;

        loop {
            let event = tokio::select! {
                biased;
                chunk = rx.recv() => Forward::Chunk(chunk),
                result = &mut done, if outcome.is_none() => Forward::Settled(result),
            };
            match event {
                Forward::Chunk(Some(chunk)) => yield Ok(chunk),
                Forward::Chunk(None) => break,
                Forward::Settled(result) => outcome = Some(result),
            }
        }

        let result = match outcome {
            Some(result) => result,
            None => done.await,
        };
        if let Err(e) = result {
            yield Err(e);
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::error::ErrorCode;
    use crate::orchestrator::types::{
        AssistantMessage, ChatCompletionChoice, ChatCompletionChunkChoice, ChatMessage, ChatRole,
        ChunkDelta, FinishReason,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockEngine {
        loads: Mutex<Vec<String>>,
        unloads: AtomicUsize,
        interrupts: AtomicUsize,
        interrupted: Notify,
        hang_generation: AtomicBool,
        fail_load: AtomicBool,
        fail_unload: AtomicBool,
    }

    fn completion(text: &str) -> ChatCompletion {
        ChatCompletion {
            id: "local-1".into(),
            object: "chat.completion".into(),
            created: 0,
            model: "mock".into(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: ChatRole::Assistant,
                    content: text.into(),
                },
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: None,
        }
    }

    fn chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "local-1".into(),
            object: "chat.completion.chunk".into(),
            created: 0,
            model: "mock".into(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(text.into()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    #[async_trait]
    impl LocalEngine for MockEngine {
        async fn load(
            &self,
            model_id: &str,
            _options: &LoadOptions,
            progress: ProgressCallback,
            cancel: CancellationToken,
        ) -> InferenceResult<()> {
            self.loads.lock().unwrap().push(model_id.to_string());
            progress(&LoadProgress::new(LoadStage::Download, 0.5, model_id));
            if model_id == "slow" {
                cancel.cancelled().await;
                return Err(InferenceError::aborted("load cancelled"));
            }
            if model_id == "stubborn" {
                // Finishes even though it was asked to stop.
                cancel.cancelled().await;
                return Ok(());
            }
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(InferenceError::inference_failed("weights corrupt"));
            }
            progress(&LoadProgress::new(LoadStage::Warmup, 1.0, model_id));
            Ok(())
        }

        async fn complete(&self, request: &ChatCompletionRequest) -> InferenceResult<ChatCompletion> {
            if self.hang_generation.load(Ordering::SeqCst) {
                self.interrupted.notified().await;
                return Err(InferenceError::inference_failed("interrupted"));
            }
            let last = request.messages.last().map(|m| m.text()).unwrap_or_default();
            Ok(completion(&format!("local:{}", last)))
        }

        async fn stream(&self, _request: &ChatCompletionRequest) -> InferenceResult<ChunkStream> {
            if self.hang_generation.load(Ordering::SeqCst) {
                return Ok(Box::pin(futures::stream::pending()));
            }
            let chunks = vec![Ok(chunk("a")), Ok(chunk("b")), Ok(chunk("c"))];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn interrupt(&self) {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            self.interrupted.notify_one();
        }

        async fn unload(&self) -> InferenceResult<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_unload.load(Ordering::SeqCst) {
                return Err(InferenceError::inference_failed("engine busy"));
            }
            Ok(())
        }

        async fn has_model_in_cache(&self, model_id: &str) -> InferenceResult<bool> {
            Ok(model_id == "cached")
        }

        async fn delete_model_from_cache(&self, _model_id: &str) -> InferenceResult<()> {
            Ok(())
        }
    }

    fn stats(grade: Grade) -> DeviceStats {
        DeviceStats {
            gpu_present: grade != Grade::C,
            vram_estimate_mb: 0,
            grade,
            battery_level: None,
            battery_charging: None,
            system_memory_gb: 16.0,
        }
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[test]
    fn test_default_tiers_by_grade() {
        let tiers = TierTable::default();
        assert_eq!(tiers.model_for_grade(Grade::S).as_deref(), Some(HIGH_TIER_MODEL));
        assert_eq!(tiers.model_for_grade(Grade::A).as_deref(), Some(HIGH_TIER_MODEL));
        assert_eq!(tiers.model_for_grade(Grade::B).as_deref(), Some(MEDIUM_TIER_MODEL));
        assert_eq!(tiers.model_for_grade(Grade::C), None);
    }

    #[test]
    fn test_custom_tiers() {
        let tiers = TierTable::new()
            .with_high("big-model")
            .with_medium(TierChoice::Unavailable)
            .with_low("auto");
        assert_eq!(tiers.model_for_grade(Grade::S).as_deref(), Some("big-model"));
        assert_eq!(tiers.model_for_grade(Grade::B), None);
        assert_eq!(tiers.model_for_grade(Grade::C).as_deref(), Some(MEDIUM_TIER_MODEL));
    }

    #[test]
    fn test_tier_table_deserialize() {
        let tiers: TierTable =
            serde_json::from_value(serde_json::json!({"high": null, "low": "tiny"})).unwrap();
        assert_eq!(tiers.high, TierChoice::Unavailable);
        assert_eq!(tiers.medium, TierChoice::Auto);
        assert_eq!(tiers.low, TierChoice::Model("tiny".into()));
    }

    #[test]
    fn test_explicit_model_overrides_tiers() {
        let options = LocalOptions::new()
            .with_model("pinned")
            .with_tiers(TierTable::default());
        assert_eq!(
            options.selection().select(&stats(Grade::C)).as_deref(),
            Some("pinned")
        );
        assert!(options.load_options().use_cache);
    }

    #[tokio::test]
    async fn test_initialize_without_tier_model_is_no_provider() {
        let engine = Arc::new(MockEngine::default());
        let backend = LocalBackend::new(engine.clone(), ModelSelection::Tiered(TierTable::default()));
        let err = backend.initialize(&stats(Grade::C)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
        assert!(engine.loads.lock().unwrap().is_empty());
        assert!(!backend.is_ready());
    }

    #[tokio::test]
    async fn test_initialize_loads_and_reports_progress() {
        let engine = Arc::new(MockEngine::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let backend = LocalBackend::new(engine.clone(), ModelSelection::Tiered(TierTable::default()))
            .with_progress(Arc::new(move |p: &LoadProgress| {
                sink.lock().unwrap().push(p.stage);
            }));

        backend.initialize(&stats(Grade::B)).await.unwrap();

        assert!(backend.is_ready());
        assert_eq!(backend.current_model().as_deref(), Some(MEDIUM_TIER_MODEL));
        assert_eq!(*seen.lock().unwrap(), vec![LoadStage::Download, LoadStage::Warmup]);
        assert!(backend.load_manager().is_loaded(MEDIUM_TIER_MODEL));
    }

    #[tokio::test]
    async fn test_selector_returning_none() {
        let backend = LocalBackend::new(
            Arc::new(MockEngine::default()),
            ModelSelection::Selector(Arc::new(|_| None)),
        );
        let err = backend.initialize(&stats(Grade::S)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
    }

    #[tokio::test]
    async fn test_load_failure_is_model_load_failed() {
        let engine = Arc::new(MockEngine::default());
        engine.fail_load.store(true, Ordering::SeqCst);
        let backend = LocalBackend::new(engine, ModelSelection::Explicit("m".into()));
        let err = backend.load("m").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ModelLoadFailed);
        assert_eq!(
            backend.load_manager().state("m").status,
            LoadStatus::Error
        );
    }

    #[tokio::test]
    async fn test_new_load_supersedes_in_flight_load() {
        let engine = Arc::new(MockEngine::default());
        let backend = Arc::new(LocalBackend::new(
            engine.clone(),
            ModelSelection::Explicit("slow".into()),
        ));

        let first = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.load("slow").await })
        };
        // Let the first load reach the engine.
        while engine.loads.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        let unloads_before = engine.unloads.load(Ordering::SeqCst);

        backend.load("fast").await.unwrap();

        let err = first.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(backend.current_model().as_deref(), Some("fast"));
        assert!(backend.is_ready());
        assert!(engine.unloads.load(Ordering::SeqCst) > unloads_before);
        assert_eq!(*engine.loads.lock().unwrap(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_superseded_load_survives_failing_unload() {
        let engine = Arc::new(MockEngine::default());
        engine.fail_unload.store(true, Ordering::SeqCst);
        let backend = Arc::new(LocalBackend::new(
            engine.clone(),
            ModelSelection::Explicit("stubborn".into()),
        ));

        let first = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.load("stubborn").await })
        };
        while engine.loads.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        backend.load("fast").await.unwrap();

        let err = first.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(
            backend.load_manager().state("stubborn").status,
            LoadStatus::Idle
        );
        assert_eq!(backend.current_model().as_deref(), Some("fast"));
        // Before the first load, after it was superseded, before the second.
        assert_eq!(engine.unloads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_complete_before_load_fails() {
        let backend = LocalBackend::new(
            Arc::new(MockEngine::default()),
            ModelSelection::Explicit("m".into()),
        );
        let err = backend
            .complete(&request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InferenceFailed);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_without_unloading() {
        let engine = Arc::new(MockEngine::default());
        let backend = LocalBackend::new(engine.clone(), ModelSelection::Explicit("m".into()));
        backend.load("m").await.unwrap();
        engine.hang_generation.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = backend.complete(&request(), cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert_eq!(engine.interrupts.load(Ordering::SeqCst), 1);
        assert!(backend.is_ready());

        engine.hang_generation.store(false, Ordering::SeqCst);
        let completion = backend
            .complete(&request(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.content(), "local:hi");
    }

    #[tokio::test]
    async fn test_stream_yields_engine_chunks() {
        let engine = Arc::new(MockEngine::default());
        let backend = LocalBackend::new(engine, ModelSelection::Explicit("m".into()));
        backend.load("m").await.unwrap();

        let stream = backend
            .stream(&request(), CancellationToken::new())
            .await
            .unwrap();
        let text: String = stream
            .map(|c| c.unwrap().delta_content().to_string())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_slot() {
        let engine = Arc::new(MockEngine::default());
        let backend = LocalBackend::new(engine.clone(), ModelSelection::Explicit("m".into()));
        backend.load("m").await.unwrap();
        engine.hang_generation.store(true, Ordering::SeqCst);

        let stream = backend
            .stream(&request(), CancellationToken::new())
            .await
            .unwrap();
        // Give the pump time to start and take the slot.
        while !backend.queue().is_running() {
            tokio::task::yield_now().await;
        }
        drop(stream);

        engine.hang_generation.store(false, Ordering::SeqCst);
        let completion = tokio::time::timeout(
            Duration::from_secs(5),
            backend.complete(&request(), CancellationToken::new()),
        )
        .await
        .expect("slot released")
        .unwrap();
        assert_eq!(completion.content(), "local:hi");
        assert!(engine.interrupts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let engine = Arc::new(MockEngine::default());
        let backend = LocalBackend::new(engine.clone(), ModelSelection::Explicit("m".into()));
        backend.load("m").await.unwrap();

        backend.dispose().await;
        backend.dispose().await;

        assert!(!backend.is_ready());
        assert!(backend.current_model().is_none());
        let err = backend
            .complete(&request(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_cache_queries_pass_through() {
        let backend = LocalBackend::new(
            Arc::new(MockEngine::default()),
            ModelSelection::Explicit("m".into()),
        );
        assert!(backend.has_model_in_cache("cached").await.unwrap());
        assert!(!backend.has_model_in_cache("other").await.unwrap());
        backend.delete_model_from_cache("cached").await.unwrap();
    }
}
