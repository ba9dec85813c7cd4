//! Provider Resolver: Configuration to Backend Factories
//!
//! Both sides of the client accept loosely shaped configuration. Resolution
//! classifies it into one canonical factory per side and does nothing else:
//! no network, no engine calls, no blocking. Backends are only built when the
//! client calls `create`.
//!
//! ```text
//!  LocalConfig                          CloudConfig
//!  ├─ Disabled ──────────▶ None         ├─ Disabled ──────────▶ None
//!  ├─ Auto ──────┐                      ├─ BaseUrl ────┐
//!  ├─ Model ─────┤                      ├─ Options ────┴─▶ "fetch-sse"
//!  ├─ Options ───┼─▶ "local-engine"     ├─ Function ─────▶ "custom-cloud"
//!  ├─ Selector ──┘                      └─ Resolved ─────▶ (unchanged)
//!  └─ Resolved ──────────▶ (unchanged)
//! ```
//!
//! Resolving an already resolved value returns it as is, so resolution is
//! idempotent.

use std::sync::Arc;

use super::backend::InferenceBackend;
use super::cloud_openai::{CloudOpenAIProvider, CloudOptions};
use super::custom::{CloudFunction, CustomCloudBackend};
use super::error::{InferenceError, InferenceResult};
use super::local::{
    LocalBackend, LocalEngine, LocalOptions, LocalSelector, LoadOptions, ModelSelection,
    ProgressCallback, TierTable,
};
use super::queue::DEFAULT_QUEUE_SIZE;

pub const LOCAL_ENGINE_PROVIDER: &str = "local-engine";
pub const CUSTOM_LOCAL_PROVIDER: &str = "custom-local";
pub const FETCH_SSE_PROVIDER: &str = "fetch-sse";
pub const CUSTOM_CLOUD_PROVIDER: &str = "custom-cloud";

// ============================================================================
// Local side
// ============================================================================

/// Local configuration as a host application supplies it.
#[derive(Clone, Default)]
pub enum LocalConfig {
    #[default]
    Disabled,
    /// Pick a model from the default tier table.
    Auto,
    Model(String),
    Options(LocalOptions),
    Selector(LocalSelector),
    Resolved(ResolvedLocal),
}

impl std::fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Auto => f.write_str("Auto"),
            Self::Model(model) => f.debug_tuple("Model").field(model).finish(),
            Self::Options(options) => f.debug_tuple("Options").field(options).finish(),
            Self::Selector(_) => f.write_str("Selector(..)"),
            Self::Resolved(resolved) => f.debug_tuple("Resolved").field(resolved).finish(),
        }
    }
}

impl From<bool> for LocalConfig {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Auto } else { Self::Disabled }
    }
}

impl From<&str> for LocalConfig {
    fn from(value: &str) -> Self {
        if value == "auto" {
            Self::Auto
        } else {
            Self::Model(value.to_string())
        }
    }
}

impl From<String> for LocalConfig {
    fn from(value: String) -> Self {
        if value == "auto" {
            Self::Auto
        } else {
            Self::Model(value)
        }
    }
}

impl From<LocalOptions> for LocalConfig {
    fn from(options: LocalOptions) -> Self {
        Self::Options(options)
    }
}

impl From<ResolvedLocal> for LocalConfig {
    fn from(resolved: ResolvedLocal) -> Self {
        Self::Resolved(resolved)
    }
}

impl LocalConfig {
    pub fn selector<F>(selector: F) -> Self
    where
        F: Fn(&super::telemetry::DeviceStats) -> Option<String> + Send + Sync + 'static,
    {
        Self::Selector(Arc::new(selector))
    }
}

/// What the client hands a local factory.
#[derive(Clone)]
pub struct LocalFactoryContext {
    pub engine: Option<Arc<dyn LocalEngine>>,
    pub on_progress: Option<ProgressCallback>,
    pub queue_size: usize,
}

impl Default for LocalFactoryContext {
    fn default() -> Self {
        Self {
            engine: None,
            on_progress: None,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// A created local backend.
///
/// `control` is set when the backend is a [`LocalBackend`], which the client
/// needs for explicit `load`/`unload` and cache queries.
#[derive(Clone)]
pub struct LocalInstance {
    pub backend: Arc<dyn InferenceBackend>,
    pub control: Option<Arc<LocalBackend>>,
}

#[derive(Clone)]
enum LocalKind {
    Engine {
        selection: ModelSelection,
        load_options: LoadOptions,
    },
    Backend(Arc<dyn InferenceBackend>),
}

/// Canonical local factory.
#[derive(Clone)]
pub struct ResolvedLocal {
    provider_name: &'static str,
    kind: LocalKind,
}

impl std::fmt::Debug for ResolvedLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ResolvedLocal");
        s.field("provider_name", &self.provider_name);
        if let LocalKind::Engine { selection, .. } = &self.kind {
            s.field("selection", selection);
        }
        s.finish()
    }
}

impl ResolvedLocal {
    fn engine(selection: ModelSelection, load_options: LoadOptions) -> Self {
        Self {
            provider_name: LOCAL_ENGINE_PROVIDER,
            kind: LocalKind::Engine {
                selection,
                load_options,
            },
        }
    }

    /// Wrap a ready-made backend.
    pub fn from_backend(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            provider_name: CUSTOM_LOCAL_PROVIDER,
            kind: LocalKind::Backend(backend),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider_name
    }

    /// Model selection of an engine-backed factory.
    pub fn selection(&self) -> Option<&ModelSelection> {
        match &self.kind {
            LocalKind::Engine { selection, .. } => Some(selection),
            LocalKind::Backend(_) => None,
        }
    }

    pub fn create(&self, ctx: &LocalFactoryContext) -> InferenceResult<LocalInstance> {
        match &self.kind {
            LocalKind::Backend(backend) => Ok(LocalInstance {
                backend: backend.clone(),
                control: None,
            }),
            LocalKind::Engine {
                selection,
                load_options,
            } => {
                let engine = ctx.engine.clone().ok_or_else(|| {
                    InferenceError::no_provider("Local inference is configured but no engine was supplied")
                })?;
                let mut local = LocalBackend::new(engine, selection.clone())
                    .with_load_options(*load_options)
                    .with_queue_size(ctx.queue_size);
                if let Some(callback) = &ctx.on_progress {
                    local = local.with_progress(callback.clone());
                }
                let local = Arc::new(local);
                Ok(LocalInstance {
                    backend: local.clone(),
                    control: Some(local),
                })
            }
        }
    }
}

/// Classify local configuration. `None` means local is disabled.
pub fn resolve_local(config: LocalConfig) -> Option<ResolvedLocal> {
    let resolved = match config {
        LocalConfig::Disabled => return None,
        LocalConfig::Resolved(resolved) => return Some(resolved),
        LocalConfig::Auto => {
            ResolvedLocal::engine(ModelSelection::Tiered(TierTable::default()), LoadOptions::default())
        }
        LocalConfig::Model(model) => {
            ResolvedLocal::engine(ModelSelection::Explicit(model), LoadOptions::default())
        }
        LocalConfig::Options(options) => {
            ResolvedLocal::engine(options.selection(), options.load_options())
        }
        LocalConfig::Selector(selector) => {
            ResolvedLocal::engine(ModelSelection::Selector(selector), LoadOptions::default())
        }
    };
    tracing::debug!("ProviderResolver: local resolved to {:?}", resolved);
    Some(resolved)
}

// ============================================================================
// Cloud side
// ============================================================================

/// Cloud configuration as a host application supplies it.
#[derive(Clone, Default)]
pub enum CloudConfig {
    #[default]
    Disabled,
    BaseUrl(String),
    Options(CloudOptions),
    Function(Arc<dyn CloudFunction>),
    Resolved(ResolvedCloud),
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::BaseUrl(url) => f.debug_tuple("BaseUrl").field(url).finish(),
            Self::Options(options) => f.debug_tuple("Options").field(options).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Resolved(resolved) => f.debug_tuple("Resolved").field(resolved).finish(),
        }
    }
}

impl From<&str> for CloudConfig {
    fn from(base_url: &str) -> Self {
        Self::BaseUrl(base_url.to_string())
    }
}

impl From<String> for CloudConfig {
    fn from(base_url: String) -> Self {
        Self::BaseUrl(base_url)
    }
}

impl From<CloudOptions> for CloudConfig {
    fn from(options: CloudOptions) -> Self {
        Self::Options(options)
    }
}

impl From<Arc<dyn CloudFunction>> for CloudConfig {
    fn from(function: Arc<dyn CloudFunction>) -> Self {
        Self::Function(function)
    }
}

impl From<ResolvedCloud> for CloudConfig {
    fn from(resolved: ResolvedCloud) -> Self {
        Self::Resolved(resolved)
    }
}

#[derive(Clone)]
enum CloudKind {
    Http(CloudOptions),
    Function(Arc<dyn CloudFunction>),
    Backend(Arc<dyn InferenceBackend>),
}

/// Canonical cloud factory.
#[derive(Clone)]
pub struct ResolvedCloud {
    provider_name: &'static str,
    kind: CloudKind,
}

impl std::fmt::Debug for ResolvedCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ResolvedCloud");
        s.field("provider_name", &self.provider_name);
        if let CloudKind::Http(options) = &self.kind {
            s.field("options", options);
        }
        s.finish()
    }
}

impl ResolvedCloud {
    /// Wrap a ready-made backend.
    pub fn from_backend(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            provider_name: CUSTOM_CLOUD_PROVIDER,
            kind: CloudKind::Backend(backend),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider_name
    }

    pub fn create(&self) -> InferenceResult<Arc<dyn InferenceBackend>> {
        match &self.kind {
            CloudKind::Http(options) => Ok(Arc::new(CloudOpenAIProvider::new(options.clone())?)),
            CloudKind::Function(function) => Ok(Arc::new(CustomCloudBackend::new(function.clone()))),
            CloudKind::Backend(backend) => Ok(backend.clone()),
        }
    }
}

/// Classify cloud configuration. `None` means cloud is disabled.
pub fn resolve_cloud(config: CloudConfig) -> Option<ResolvedCloud> {
    let resolved = match config {
        CloudConfig::Disabled => return None,
        CloudConfig::Resolved(resolved) => return Some(resolved),
        CloudConfig::BaseUrl(base_url) => ResolvedCloud {
            provider_name: FETCH_SSE_PROVIDER,
            kind: CloudKind::Http(CloudOptions::new(base_url)),
        },
        CloudConfig::Options(options) => ResolvedCloud {
            provider_name: FETCH_SSE_PROVIDER,
            kind: CloudKind::Http(options),
        },
        CloudConfig::Function(function) => ResolvedCloud {
            provider_name: CUSTOM_CLOUD_PROVIDER,
            kind: CloudKind::Function(function),
        },
    };
    tracing::debug!("ProviderResolver: cloud resolved to {:?}", resolved);
    Some(resolved)
}
