//! Caller-supplied cloud function as an inference backend.
//!
//! A [`CloudFunction`] receives the flattened messages and the routing
//! context of the current attempt and returns either a full completion or a
//! chunk stream. [`CustomCloudBackend`] adapts whichever it gets to the call
//! shape the orchestrator asked for: a stream is collected into one
//! completion, a completion becomes a single terminal chunk.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::backend::InferenceBackend;
use super::error::{InferenceError, InferenceResult};
use super::router::{RouteContext, RouteReason};
use super::telemetry::DeviceStats;
use super::types::{
    AssistantMessage, ChatCompletion, ChatCompletionChoice, ChatCompletionChunk,
    ChatCompletionRequest, ChatMessage, ChatRole, ChunkStream, FinishReason, TokenUsage,
};

/// What a cloud function may return.
pub enum CloudFunctionOutput {
    Completion(ChatCompletion),
    Stream(ChunkStream),
}

impl std::fmt::Debug for CloudFunctionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completion(c) => f.debug_tuple("Completion").field(&c.id).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait CloudFunction: Send + Sync {
    async fn call(
        &self,
        messages: Vec<ChatMessage>,
        context: RouteContext,
        cancel: CancellationToken,
    ) -> InferenceResult<CloudFunctionOutput>;
}

/// [`CloudFunction`] over an async closure. Built by [`cloud_fn`].
pub struct FnCloudFunction<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> CloudFunction for FnCloudFunction<F>
where
    F: Fn(Vec<ChatMessage>, RouteContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = InferenceResult<CloudFunctionOutput>> + Send,
{
    async fn call(
        &self,
        messages: Vec<ChatMessage>,
        context: RouteContext,
        cancel: CancellationToken,
    ) -> InferenceResult<CloudFunctionOutput> {
        (self.func)(messages, context, cancel).await
    }
}

/// Wrap an async closure as a shareable cloud function.
pub fn cloud_fn<F, Fut>(func: F) -> Arc<dyn CloudFunction>
where
    F: Fn(Vec<ChatMessage>, RouteContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InferenceResult<CloudFunctionOutput>> + Send + 'static,
{
    Arc::new(FnCloudFunction { func })
}

pub struct CustomCloudBackend {
    function: Arc<dyn CloudFunction>,
}

impl std::fmt::Debug for CustomCloudBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomCloudBackend").finish_non_exhaustive()
    }
}

impl CustomCloudBackend {
    pub fn new(function: Arc<dyn CloudFunction>) -> Self {
        Self { function }
    }

    async fn invoke(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<CloudFunctionOutput> {
        if cancel.is_cancelled() {
            return Err(InferenceError::aborted("Request aborted"));
        }
        let context = request.route.clone().unwrap_or_else(unrouted_context);
        let messages = request.normalized().messages;
        self.function.call(messages, context, cancel).await
    }
}

/// Context for a call that did not come through the orchestrator.
fn unrouted_context() -> RouteContext {
    RouteContext {
        reason: RouteReason::LocalUnavailable,
        stats: DeviceStats::from_signals(None, None, None),
        attempt: 1,
    }
}

/// Fold a chunk stream into one completion.
async fn collect_stream(
    mut chunks: ChunkStream,
    cancel: &CancellationToken,
) -> InferenceResult<ChatCompletion> {
    let mut content = String::new();
    let mut model = None;
    let mut finish_reason = None;
    let mut usage: Option<TokenUsage> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::aborted("Request aborted")),
            next = chunks.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;

        content.push_str(chunk.delta_content());
        if model.is_none() && !chunk.model.is_empty() {
            model = Some(chunk.model.clone());
        }
        if let Some(reason) = chunk.choices.first().and_then(|c| c.finish_reason) {
            finish_reason = Some(reason);
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    let now = chrono::Utc::now();
    Ok(ChatCompletion {
        id: format!("custom-{}", now.timestamp_millis()),
        object: "chat.completion".to_string(),
        created: now.timestamp(),
        model: model.unwrap_or_else(|| "custom".to_string()),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: ChatRole::Assistant,
                content,
            },
            finish_reason: Some(finish_reason.unwrap_or(FinishReason::Stop)),
        }],
        usage,
    })
}

#[async_trait]
impl InferenceBackend for CustomCloudBackend {
    fn name(&self) -> &str {
        "CustomCloud"
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn initialize(&self, _stats: &DeviceStats) -> InferenceResult<()> {
        Ok(())
    }

    async fn complete(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChatCompletion> {
        match self.invoke(request, cancel.clone()).await? {
            CloudFunctionOutput::Completion(completion) => Ok(completion),
            CloudFunctionOutput::Stream(chunks) => collect_stream(chunks, &cancel).await,
        }
    }

    async fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> InferenceResult<ChunkStream> {
        match self.invoke(request, cancel).await? {
            CloudFunctionOutput::Stream(chunks) => Ok(chunks),
            CloudFunctionOutput::Completion(completion) => {
                let chunk = ChatCompletionChunk::from_completion(&completion);
                Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
            }
        }
    }

    async fn dispose(&self) {}
}
