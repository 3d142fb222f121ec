//! Uniform agent invocation
//!
//! Every role runs through one [`AgentInvoker`]; roles differ only in the
//! descriptor data the router resolves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::descriptor::PromptContext;
use super::provider::{GenerateOptions, Generation, ProviderError, SharedProvider};
use crate::error::{ErrorKind, TaskError};
use crate::router::{Complexity, ModelRouter};

/// Error type for agent invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Model {model} unavailable: {reason}")]
    Unavailable { model: String, reason: String },
}

impl AgentError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Transient(_)))
    }
}

impl From<AgentError> for TaskError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Provider(provider) => provider.into(),
            AgentError::UnknownRole(role) => {
                TaskError::new(ErrorKind::Validation, format!("unknown agent role: {}", role))
            }
            AgentError::Unavailable { model, reason } => {
                TaskError::new(ErrorKind::ProviderUnavailable, reason).with_context("model", model)
            }
        }
    }
}

/// One step's worth of work for an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub role: String,
    pub action: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub previous_output: Option<String>,
    /// Pins the model instead of routing on complexity. The tier is still
    /// classified and reported.
    #[serde(default)]
    pub model_override: Option<String>,
}

/// What an agent produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub role: String,
    pub model: String,
    pub complexity: Complexity,
    pub content: String,
    pub latency_ms: u64,
}

/// Runs an agent role against a request
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError>;
}

/// Shared reference to an invoker
pub type SharedInvoker = Arc<dyn AgentInvoker>;

/// Invoker that resolves the model through a [`ModelRouter`] and calls a
/// [`ModelProvider`](super::provider::ModelProvider)
pub struct ModelAgentInvoker {
    router: ModelRouter,
    provider: SharedProvider,
    options: GenerateOptions,
}

impl ModelAgentInvoker {
    pub fn new(router: ModelRouter, provider: SharedProvider) -> Self {
        Self {
            router,
            provider,
            options: GenerateOptions::default(),
        }
    }

    /// Generation parameters applied to every call
    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }
}

#[async_trait]
impl AgentInvoker for ModelAgentInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput, AgentError> {
        let (descriptor, mut selection) = self
            .router
            .select(&request.role, &request.title, &request.description)
            .ok_or_else(|| AgentError::UnknownRole(request.role.clone()))?;
        if let Some(model) = &request.model_override {
            selection.reason = format!("pinned to {} (routed: {})", model, selection.model_id);
            selection.model_id = model.clone();
        }

        let prompt = descriptor.render_prompt(&PromptContext {
            title: &request.title,
            description: &request.description,
            task_type: &request.task_type,
            action: &request.action,
            previous_output: request.previous_output.as_deref(),
        });

        debug!(
            role = %request.role,
            model = %selection.model_id,
            complexity = %selection.complexity,
            reason = %selection.reason,
            "Invoking agent"
        );

        let start = Instant::now();
        let generation = self
            .provider
            .generate(&selection.model_id, &prompt, &self.options)
            .await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        match generation {
            Generation::Real(content) => {
                info!(role = %request.role, model = %selection.model_id, latency_ms, "Agent responded");
                Ok(AgentOutput {
                    role: request.role.clone(),
                    model: selection.model_id,
                    complexity: selection.complexity,
                    content,
                    latency_ms,
                })
            }
            Generation::Unavailable(reason) => Err(AgentError::Unavailable {
                model: selection.model_id,
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::provider::ModelProvider;
    use mockall::mock;

    mock! {
        pub Provider {}

        #[async_trait]
        impl ModelProvider for Provider {
            async fn generate(
                &self,
                model: &str,
                prompt: &str,
                options: &GenerateOptions,
            ) -> Result<Generation, ProviderError>;
        }
    }

    fn request(role: &str, title: &str) -> AgentRequest {
        AgentRequest {
            role: role.to_string(),
            action: "code_implementation".to_string(),
            title: title.to_string(),
            description: String::new(),
            task_type: "feature".to_string(),
            previous_output: Some("design notes".to_string()),
            model_override: None,
        }
    }

    #[tokio::test]
    async fn test_invoke_routes_to_tier_model() {
        let mut provider = MockProvider::new();
        provider
            .expect_generate()
            .times(1)
            .returning(|model, prompt, _| {
                assert_eq!(model, "gpt-4o");
                assert!(prompt.contains("design notes"));
                Ok(Generation::Real(format!("{} wrote code", model)))
            });

        let invoker = ModelAgentInvoker::new(ModelRouter::default(), Arc::new(provider));
        let output = invoker
            .invoke(&request("developer", "Add caching layer"))
            .await
            .unwrap();

        assert_eq!(output.model, "gpt-4o");
        assert_eq!(output.complexity, Complexity::Medium);
        assert_eq!(output.content, "gpt-4o wrote code");
    }

    #[tokio::test]
    async fn test_model_override_skips_routing() {
        let mut provider = MockProvider::new();
        provider
            .expect_generate()
            .times(1)
            .returning(|model, _, _| {
                assert_eq!(model, "gemini-3-pro");
                Ok(Generation::Real("reviewed".into()))
            });

        let invoker = ModelAgentInvoker::new(ModelRouter::default(), Arc::new(provider));
        let mut pinned = request("developer", "Add caching layer");
        pinned.model_override = Some("gemini-3-pro".to_string());
        let output = invoker.invoke(&pinned).await.unwrap();

        assert_eq!(output.model, "gemini-3-pro");
        assert_eq!(output.complexity, Complexity::Medium);
    }

    #[tokio::test]
    async fn test_unavailable_is_an_error() {
        let mut provider = MockProvider::new();
        provider
            .expect_generate()
            .returning(|_, _, _| Ok(Generation::Unavailable("offline".into())));

        let invoker = ModelAgentInvoker::new(ModelRouter::default(), Arc::new(provider));
        let err = invoker
            .invoke(&request("developer", "Add caching layer"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { .. }));
        assert!(!err.is_transient());

        let task_error: TaskError = err.into();
        assert_eq!(task_error.kind, ErrorKind::ProviderUnavailable);
        assert!(!task_error.retryable);
    }

    #[tokio::test]
    async fn test_transient_error_propagates() {
        let mut provider = MockProvider::new();
        provider
            .expect_generate()
            .returning(|_, _, _| Err(ProviderError::Transient("rate limited".into())));

        let invoker = ModelAgentInvoker::new(ModelRouter::default(), Arc::new(provider));
        let err = invoker
            .invoke(&request("reviewer", "Review PR"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let provider = MockProvider::new();
        let invoker = ModelAgentInvoker::new(ModelRouter::default(), Arc::new(provider));
        let err = invoker.invoke(&request("wizard", "x")).await.unwrap_err();
        assert_eq!(err, AgentError::UnknownRole("wizard".to_string()));
    }
}
