//! Structured error records
//!
//! Every failure that ends a task, step or debate is persisted as a
//! [`TaskError`]: a machine-readable kind, a human-readable message, whether
//! a retry could help, and free-form context for debugging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; never retried.
    Validation,
    /// Illegal state transition.
    Conflict,
    /// Timeout or rate limit at the model provider.
    ProviderTransient,
    /// Invalid request or model refusal.
    ProviderPermanent,
    /// No real provider could be reached; the answer is not genuine.
    ProviderUnavailable,
    /// Backing store unreachable.
    StorageUnavailable,
    /// A stored record could not be encoded or decoded.
    StorageCorrupted,
    /// A step exceeded its time budget.
    Timeout,
    /// Cancelled by an external signal.
    Cancelled,
    /// The claiming worker stopped heartbeating.
    StaleClaim,
    /// Retry budget exhausted.
    RetriesExhausted,
    /// A debate session could not complete.
    Debate,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ProviderTransient | Self::Timeout | Self::StaleClaim | Self::StorageUnavailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::ProviderTransient => write!(f, "provider_transient"),
            Self::ProviderPermanent => write!(f, "provider_permanent"),
            Self::ProviderUnavailable => write!(f, "provider_unavailable"),
            Self::StorageUnavailable => write!(f, "storage_unavailable"),
            Self::StorageCorrupted => write!(f, "storage_corrupted"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::StaleClaim => write!(f, "stale_claim"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::Debate => write!(f, "debate"),
        }
    }
}

/// Structured error stored on tasks and workflow steps.
///
/// # Example
/// ```json
/// {
///   "kind": "provider_transient",
///   "message": "rate limited by provider",
///   "retryable": true,
///   "context": { "model": "gpt-4o", "step": 1 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure category.
    pub kind: ErrorKind,

    /// Human-readable error message
    pub message: String,

    /// Whether this error is retryable (transient failure)
    #[serde(default)]
    pub retryable: bool,

    /// Relevant context for debugging
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskError {
    /// Create an error whose retryability follows its kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            context: HashMap::new(),
        }
    }

    /// Add context key-value pair
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Override the retryable flag.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}
