//! Hybrid client facade.
//!
//! [`HybridClient`] resolves both sides of the configuration, builds the
//! backends and owns their lifecycle. The cloud backend is initialized during
//! [`HybridClientBuilder::build`]. The local backend loads in a background
//! task so the first requests can already be served by the cloud while the
//! model downloads; if that load fails the local slot is cleared and the
//! client continues cloud-only.
//!
//! ```no_run
//! use hybrid_foundation::orchestrator::{ChatCompletionRequest, ChatMessage, CloudOptions, HybridClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HybridClient::builder()
//!     .cloud(CloudOptions::new("https://api.example.com/v1").with_api_key("sk-..."))
//!     .build()
//!     .await?;
//!
//! let reply = client
//!     .chat()
//!     .complete(ChatCompletionRequest::new(vec![ChatMessage::user("Hello")]))
//!     .await?;
//! println!("{}", reply.content());
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::backend::InferenceBackend;
use super::completions::{BackendSlots, Completions};
use super::error::{InferenceError, InferenceResult};
use super::local::{LoadProgress, LocalEngine, ProgressCallback};
use super::queue::DEFAULT_QUEUE_SIZE;
use super::resolver::{
    CloudConfig, LocalConfig, LocalFactoryContext, LocalInstance, resolve_cloud, resolve_local,
};
use super::router::{RouteEvent, RouteObserver};
use super::telemetry::{CapabilityProfiler, CapabilityReport, DeviceProbe};

pub type ErrorCallback = Arc<dyn Fn(&InferenceError) + Send + Sync>;

/// Progress of the background local initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    /// No local side configured.
    Disabled,
    Initializing,
    Ready,
    /// Initialization failed; the client runs cloud-only.
    Failed,
    /// Initialization gave way to an explicit `load`, `unload` or `dispose`.
    Superseded,
}

// ============================================================================
// Builder
// ============================================================================

pub struct HybridClientBuilder {
    local: LocalConfig,
    cloud: CloudConfig,
    engine: Option<Arc<dyn LocalEngine>>,
    probe: Option<Arc<dyn DeviceProbe>>,
    on_progress: Option<ProgressCallback>,
    on_route: Option<RouteObserver>,
    on_error: Option<ErrorCallback>,
    queue_size: usize,
}

impl Default for HybridClientBuilder {
    fn default() -> Self {
        Self {
            local: LocalConfig::Disabled,
            cloud: CloudConfig::Disabled,
            engine: None,
            probe: None,
            on_progress: None,
            on_route: None,
            on_error: None,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl std::fmt::Debug for HybridClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClientBuilder")
            .field("local", &self.local)
            .field("cloud", &self.cloud)
            .field("engine", &self.engine.is_some())
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl HybridClientBuilder {
    pub fn local(mut self, config: impl Into<LocalConfig>) -> Self {
        self.local = config.into();
        self
    }

    pub fn cloud(mut self, config: impl Into<CloudConfig>) -> Self {
        self.cloud = config.into();
        self
    }

    /// Device-resident engine used by engine-backed local configurations.
    pub fn engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Device probe for a client-owned profiler. Without one the client
    /// shares [`CapabilityProfiler::global`].
    pub fn probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LoadProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_route<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RouteEvent) + Send + Sync + 'static,
    {
        self.on_route = Some(Arc::new(callback));
        self
    }

    /// Called when background local initialization fails.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&InferenceError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn queue_size(mut self, max_size: usize) -> Self {
        self.queue_size = max_size;
        self
    }

    /// Resolve configuration, create the backends and start local
    /// initialization in the background.
    pub async fn build(self) -> InferenceResult<HybridClient> {
        let resolved_local = resolve_local(self.local);
        let resolved_cloud = resolve_cloud(self.cloud);
        if resolved_local.is_none() && resolved_cloud.is_none() {
            return Err(InferenceError::no_provider(
                "At least one of local or cloud must be configured",
            ));
        }

        let profiler = match self.probe {
            Some(probe) => Arc::new(CapabilityProfiler::new(probe)),
            None => CapabilityProfiler::global(),
        };
        let slots = Arc::new(BackendSlots::new());

        let cloud = match &resolved_cloud {
            Some(resolved) => {
                let backend = resolved.create()?;
                let stats = profiler.profile().await;
                if let Err(e) = backend.initialize(&stats).await {
                    tracing::warn!("HybridClient: cloud backend initialization failed: {}", e);
                }
                slots.set_cloud(Some(backend.clone()));
                Some(backend)
            }
            None => None,
        };

        let local = match &resolved_local {
            Some(resolved) => {
                let ctx = LocalFactoryContext {
                    engine: self.engine,
                    on_progress: self.on_progress,
                    queue_size: self.queue_size,
                };
                let instance = resolved.create(&ctx)?;
                slots.set_local(Some(instance.backend.clone()));
                Some(instance)
            }
            None => None,
        };

        let initial = if local.is_some() {
            LocalStatus::Initializing
        } else {
            LocalStatus::Disabled
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let status_tx = Arc::new(status_tx);

        let local_init = local.as_ref().map(|instance| {
            tokio::spawn(initialize_local(
                instance.backend.clone(),
                profiler.clone(),
                slots.clone(),
                status_tx.clone(),
                self.on_error.clone(),
            ))
        });

        tracing::info!(
            "HybridClient: built (local={}, cloud={})",
            resolved_local
                .as_ref()
                .map(|r| r.provider_name())
                .unwrap_or("none"),
            resolved_cloud
                .as_ref()
                .map(|r| r.provider_name())
                .unwrap_or("none"),
        );

        Ok(HybridClient {
            completions: Completions::new(slots.clone(), profiler.clone(), self.on_route),
            slots,
            local,
            cloud,
            profiler,
            local_init: Mutex::new(local_init),
            status_tx,
            status_rx,
            disposed: AtomicBool::new(false),
        })
    }
}

async fn initialize_local(
    backend: Arc<dyn InferenceBackend>,
    profiler: Arc<CapabilityProfiler>,
    slots: Arc<BackendSlots>,
    status: Arc<watch::Sender<LocalStatus>>,
    on_error: Option<ErrorCallback>,
) {
    let stats = profiler.profile().await;
    match backend.initialize(&stats).await {
        Ok(()) => {
            tracing::info!("HybridClient: local backend '{}' ready", backend.name());
            status.send_replace(LocalStatus::Ready);
        }
        Err(e) if e.is_cancellation() => {
            tracing::debug!("HybridClient: local initialization superseded");
            // An explicit load may already have reported its own outcome.
            status.send_if_modified(|current| {
                let initializing = *current == LocalStatus::Initializing;
                if initializing {
                    *current = LocalStatus::Superseded;
                }
                initializing
            });
        }
        Err(e) => {
            tracing::warn!("HybridClient: local initialization failed, continuing cloud-only: {}", e);
            if slots
                .local()
                .is_some_and(|current| Arc::ptr_eq(&current, &backend))
            {
                slots.set_local(None);
            }
            if let Some(callback) = &on_error {
                callback(&e);
            }
            status.send_replace(LocalStatus::Failed);
        }
    }
}

// ============================================================================
// HybridClient
// ============================================================================

pub struct HybridClient {
    completions: Completions,
    slots: Arc<BackendSlots>,
    local: Option<LocalInstance>,
    cloud: Option<Arc<dyn InferenceBackend>>,
    profiler: Arc<CapabilityProfiler>,
    local_init: Mutex<Option<JoinHandle<()>>>,
    status_tx: Arc<watch::Sender<LocalStatus>>,
    status_rx: watch::Receiver<LocalStatus>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for HybridClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClient")
            .field("slots", &self.slots)
            .field("local_status", &self.local_status())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl HybridClient {
    pub fn builder() -> HybridClientBuilder {
        HybridClientBuilder::default()
    }

    /// The completions orchestrator.
    pub fn chat(&self) -> &Completions {
        &self.completions
    }

    pub fn local_status(&self) -> LocalStatus {
        *self.status_rx.borrow()
    }

    /// Wait for background local initialization to settle.
    pub async fn wait_for_local(&self) -> LocalStatus {
        let mut rx = self.status_rx.clone();
        let result = rx
            .wait_for(|status| *status != LocalStatus::Initializing)
            .await
            .map(|status| *status);
        match result {
            Ok(status) => status,
            Err(_) => *rx.borrow(),
        }
    }

    fn ensure_open(&self) -> InferenceResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(InferenceError::backend_unavailable("Client has been disposed"))
        } else {
            Ok(())
        }
    }

    fn local_control(&self) -> InferenceResult<&LocalInstance> {
        self.local
            .as_ref()
            .ok_or_else(|| InferenceError::no_provider("No local provider configured"))
    }

    /// Load `model_id` on the local engine, replacing whatever is loaded or
    /// loading.
    pub async fn load(&self, model_id: &str) -> InferenceResult<()> {
        self.ensure_open()?;
        let instance = self.local_control()?;
        let control = instance.control.as_ref().ok_or_else(|| {
            InferenceError::no_provider("Local provider does not support explicit model loads")
        })?;

        control.load(model_id).await?;
        self.slots.set_local(Some(instance.backend.clone()));
        self.status_tx.send_replace(LocalStatus::Ready);
        Ok(())
    }

    /// Release the local model. Requests route to cloud until the next
    /// `load`.
    pub async fn unload(&self) -> InferenceResult<()> {
        let Some(instance) = &self.local else {
            return Ok(());
        };
        self.slots.set_local(None);
        match &instance.control {
            Some(control) => control.unload().await?,
            None => instance.backend.dispose().await,
        }
        if self.local_status() == LocalStatus::Initializing {
            self.status_tx.send_replace(LocalStatus::Superseded);
        }
        Ok(())
    }

    /// Whether a local model is loaded and serving.
    pub fn is_loaded(&self) -> bool {
        self.slots.local().is_some_and(|local| local.is_ready())
    }

    /// Fresh device capability report.
    pub async fn capability(&self) -> CapabilityReport {
        self.profiler.capability().await
    }

    pub async fn has_model_in_cache(&self, model_id: &str) -> InferenceResult<bool> {
        match &self.local_control()?.control {
            Some(control) => control.has_model_in_cache(model_id).await,
            None => Ok(false),
        }
    }

    pub async fn delete_model_from_cache(&self, model_id: &str) -> InferenceResult<()> {
        match &self.local_control()?.control {
            Some(control) => control.delete_model_from_cache(model_id).await,
            None => Ok(()),
        }
    }

    /// Stop background work and dispose both backends. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("HybridClient: disposing");

        let init = self
            .local_init
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = init {
            handle.abort();
        }
        if self.local_status() == LocalStatus::Initializing {
            self.status_tx.send_replace(LocalStatus::Superseded);
        }

        self.slots.set_local(None);
        self.slots.set_cloud(None);
        let local = async {
            if let Some(instance) = &self.local {
                instance.backend.dispose().await;
            }
        };
        let cloud = async {
            if let Some(cloud) = &self.cloud {
                cloud.dispose().await;
            }
        };
        tokio::join!(local, cloud);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::custom::{CloudFunctionOutput, cloud_fn};
    use crate::orchestrator::error::ErrorCode;
    use crate::orchestrator::telemetry::{BatteryInfo, GpuInfo};
    use crate::orchestrator::types::{
        AssistantMessage, ChatCompletion, ChatCompletionChoice, ChatCompletionRequest,
        ChatMessage, ChatRole,
    };
    use async_trait::async_trait;

    struct NoGpuProbe;

    #[async_trait]
    impl DeviceProbe for NoGpuProbe {
        async fn gpu(&self) -> Option<GpuInfo> {
            None
        }

        async fn battery(&self) -> Option<BatteryInfo> {
            None
        }

        async fn system_memory_gb(&self) -> Option<f64> {
            None
        }

        async fn is_online(&self) -> bool {
            true
        }
    }

    fn echo_cloud() -> CloudConfig {
        cloud_fn(|messages, _context, _cancel| async move {
            let last = messages.last().map(|m| m.text()).unwrap_or_default();
            Ok(CloudFunctionOutput::Completion(ChatCompletion {
                id: "echo".into(),
                object: "chat.completion".into(),
                created: 0,
                model: "echo".into(),
                choices: vec![ChatCompletionChoice {
                    index: 0,
                    message: AssistantMessage {
                        role: ChatRole::Assistant,
                        content: format!("echo:{}", last),
                    },
                    finish_reason: None,
                }],
                usage: None,
            }))
        })
        .into()
    }

    #[tokio::test]
    async fn test_build_without_providers_fails() {
        let err = HybridClient::builder()
            .probe(Arc::new(NoGpuProbe))
            .build()
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::NoProvider);
    }

    #[tokio::test]
    async fn test_cloud_only_client() {
        let client = HybridClient::builder()
            .cloud(echo_cloud())
            .probe(Arc::new(NoGpuProbe))
            .build()
            .await
            .unwrap();

        assert_eq!(client.local_status(), LocalStatus::Disabled);
        assert!(!client.is_loaded());
        let reply = client
            .chat()
            .complete(ChatCompletionRequest::new(vec![ChatMessage::user("ping")]))
            .await
            .unwrap();
        assert_eq!(reply.content(), "echo:ping");

        let err = client.load("any").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
    }

    #[tokio::test]
    async fn test_local_without_engine_fails_at_build() {
        let err = HybridClient::builder()
            .local("auto")
            .probe(Arc::new(NoGpuProbe))
            .build()
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::NoProvider);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let client = HybridClient::builder()
            .cloud(echo_cloud())
            .probe(Arc::new(NoGpuProbe))
            .build()
            .await
            .unwrap();

        client.dispose().await;
        client.dispose().await;

        let err = client
            .chat()
            .complete(ChatCompletionRequest::new(vec![ChatMessage::user("ping")]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoProvider);
    }

    #[tokio::test]
    async fn test_capability_report() {
        let client = HybridClient::builder()
            .cloud(echo_cloud())
            .probe(Arc::new(NoGpuProbe))
            .build()
            .await
            .unwrap();
        let report = client.capability().await;
        assert!(!report.webgpu);
        assert!(report.gpu.is_none());
    }
}
