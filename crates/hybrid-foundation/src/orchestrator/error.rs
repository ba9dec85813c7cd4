//! Error taxonomy for the hybrid inference client.
//!
//! Every failure surfaced by this crate is an [`InferenceError`] carrying a
//! stable [`ErrorCode`], a human-readable message and, where one exists, the
//! underlying cause. Callers branch on the code, never on message text:
//!
//! ```text
//! backend-unavailable  backend missing, disposed, or not initialized
//! model-load-failed    local engine could not load the selected model
//! inference-failed     backend accepted the request but generation failed
//! transport-failed     HTTP error status, network failure, malformed frame
//! no-provider          routing or resolution found nothing to run on
//! aborted              the caller cancelled the request
//! timeout              the request-level deadline elapsed
//! queue-full           the local request queue rejected admission
//! ```
//!
//! `aborted` and `timeout` both end a request early but stay distinct so a
//! caller can tell "you asked me to stop" from "the network was too slow".

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed underlying cause of an [`InferenceError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used throughout the orchestrator.
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Stable machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    BackendUnavailable,
    ModelLoadFailed,
    InferenceFailed,
    TransportFailed,
    NoProvider,
    Aborted,
    Timeout,
    QueueFull,
}

impl ErrorCode {
    /// The kebab-case wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackendUnavailable => "backend-unavailable",
            Self::ModelLoadFailed => "model-load-failed",
            Self::InferenceFailed => "inference-failed",
            Self::TransportFailed => "transport-failed",
            Self::NoProvider => "no-provider",
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
            Self::QueueFull => "queue-full",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error type returned by every fallible operation in the crate.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct InferenceError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<BoxError>,
}

impl InferenceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendUnavailable, message)
    }

    pub fn model_load_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelLoadFailed, message)
    }

    pub fn inference_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InferenceFailed, message)
    }

    pub fn transport_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportFailed, message)
    }

    pub fn no_provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoProvider, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::QueueFull, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// True when the caller asked for the request to stop.
    ///
    /// Cancellations are never retried or converted into a fallback attempt.
    pub fn is_cancellation(&self) -> bool {
        self.code == ErrorCode::Aborted
    }
}
