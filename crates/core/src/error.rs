//! Error Types
//!
//! The pipeline distinguishes four classes of failure:
//!
//! - [`UpstreamError`]: what a content-service backend reports for a single
//!   call. Retryable ones are absorbed by the generation client.
//! - [`GenerationError`]: a terminal upstream failure, raised once retries are
//!   exhausted or the service rejected the call outright.
//! - [`CourseError::Validation`]: a caller-supplied request that fails shape
//!   checks before any external call is made.
//! - [`crate::resources::ResourceError`]: video/speech/object-store failures,
//!   which only ever degrade a module's resource list.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::course::CourseId;
use crate::resources::ResourceError;

/// Cause tag attached to every upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    InvalidResponse,
    UpstreamError,
    RateLimited,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Timeout => "timeout",
            FailureCause::InvalidResponse => "invalid_response",
            FailureCause::UpstreamError => "upstream_error",
            FailureCause::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed call to the content service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    pub kind: FailureCause,
    /// Whether another attempt may succeed.
    pub retryable: bool,
    pub message: String,
}

impl UpstreamError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureCause::Timeout,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: FailureCause::RateLimited,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self {
            kind: FailureCause::InvalidResponse,
            retryable: true,
            message: message.into(),
        }
    }

    /// A server-side failure worth retrying (5xx, dropped connection).
    pub fn server(message: impl Into<String>) -> Self {
        Self {
            kind: FailureCause::UpstreamError,
            retryable: true,
            message: message.into(),
        }
    }

    /// A failure that will not go away on retry (bad credentials, rejected request).
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureCause::UpstreamError,
            retryable: false,
            message: message.into(),
        }
    }
}

/// Terminal failure of a generation call.
///
/// `Clone` so that one failed single-flight generation can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generation failed ({cause}) after {attempts} attempt(s): {message}")]
pub struct GenerationError {
    pub cause: FailureCause,
    pub attempts: u32,
    pub message: String,
}

impl GenerationError {
    pub fn new(cause: FailureCause, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            cause,
            attempts,
            message: message.into(),
        }
    }
}

impl From<UpstreamError> for GenerationError {
    fn from(err: UpstreamError) -> Self {
        Self::new(err.kind, 1, err.message)
    }
}

/// Errors surfaced by the course orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CourseError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("course '{0}' not found")]
    CourseNotFound(CourseId),
    #[error("module index {index} is out of range for a course with {count} modules")]
    ModuleOutOfRange { index: usize, count: usize },
    #[error("module {index} failed to generate: {reason}")]
    ModuleFailed { index: usize, reason: String },
    #[error("module {index} is not ready yet")]
    ModuleNotReady { index: usize },
    #[error("module {index} is already being generated")]
    SlotBusy { index: usize },
    #[error("chunk {order} does not exist in module {index}")]
    ChunkNotFound { index: usize, order: usize },
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}
