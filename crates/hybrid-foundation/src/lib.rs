//! Hybrid local/cloud chat-completion client.
//!
//! See [`orchestrator`] for the routing, fallback and backend layers.

pub mod orchestrator;

pub use orchestrator::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, CloudOptions,
    ErrorCode, HybridClient, InferenceError, InferenceResult, LocalOptions, Provider,
};
