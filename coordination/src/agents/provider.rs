//! Model provider seam
//!
//! Concrete adapters (HTTP clients for hosted models) live outside this
//! crate; everything here talks to them through [`ModelProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorKind, TaskError};

/// Result of a generation call.
///
/// `Unavailable` means no real model produced the text, for example because
/// no provider is configured. Callers must treat it as a failure and never as
/// a genuine answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Generation {
    Real(String),
    Unavailable(String),
}

impl Generation {
    /// Text of a real generation
    pub fn into_real(self) -> Option<String> {
        match self {
            Self::Real(text) => Some(text),
            Self::Unavailable(_) => None,
        }
    }

    pub fn is_real(&self) -> bool {
        matches!(self, Self::Real(_))
    }
}

/// Error type for provider calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Timeout, rate limit, temporary outage. Worth retrying.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Invalid request or refusal. Retrying will not help.
    #[error("Permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ProviderError> for TaskError {
    fn from(err: ProviderError) -> Self {
        let kind = if err.is_transient() {
            ErrorKind::ProviderTransient
        } else {
            ErrorKind::ProviderPermanent
        };
        TaskError::new(kind, err.to_string())
    }
}

/// Per-call generation parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl GenerateOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Text generation backend
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a completion for `prompt` with `model`
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Generation, ProviderError>;
}

/// Shared reference to a provider
pub type SharedProvider = Arc<dyn ModelProvider>;

/// Provider used when nothing real is configured. Always answers
/// [`Generation::Unavailable`].
#[derive(Debug, Clone)]
pub struct UnavailableProvider {
    reason: String,
}

impl UnavailableProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableProvider {
    fn default() -> Self {
        Self::new("no model provider configured")
    }
}

#[async_trait]
impl ModelProvider for UnavailableProvider {
    async fn generate(
        &self,
        model: &str,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<Generation, ProviderError> {
        Ok(Generation::Unavailable(format!("{} ({})", self.reason, model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_provider_never_returns_real_text() {
        let provider = UnavailableProvider::default();
        let generation = provider
            .generate("gpt-4o", "hello", &GenerateOptions::default())
            .await
            .unwrap();
        assert!(!generation.is_real());
        assert_eq!(generation.into_real(), None);
    }

    #[test]
    fn test_error_kinds() {
        let transient: TaskError = ProviderError::Transient("429".into()).into();
        assert_eq!(transient.kind, ErrorKind::ProviderTransient);
        assert!(transient.retryable);

        let permanent: TaskError = ProviderError::Permanent("bad request".into()).into();
        assert_eq!(permanent.kind, ErrorKind::ProviderPermanent);
        assert!(!permanent.retryable);
    }

    #[test]
    fn test_generation_serde() {
        let json = serde_json::to_value(Generation::Unavailable("offline".into())).unwrap();
        assert_eq!(json["kind"], "unavailable");
        assert_eq!(json["text"], "offline");
    }
}
