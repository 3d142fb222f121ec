//! OpenAI-compatible chat-completions provider
//!
//! Talks to any endpoint that speaks `POST {base_url}/chat/completions`
//! (vLLM, llama.cpp server, LiteLLM, hosted APIs). Failures are classified
//! so the orchestrator knows whether a retry can help:
//!
//! | Failure                                  | Class      |
//! |------------------------------------------|------------|
//! | connect error, timeout, 408, 429, 5xx    | transient  |
//! | other 4xx, malformed or empty response   | permanent  |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use foundry_coordination::agents::{
    GenerateOptions, Generation, ModelProvider, ProviderError, SharedProvider, UnavailableProvider,
};
use foundry_coordination::config::ProviderSection;

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}

/// Chat-completions client
pub struct OpenAiProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Provider described by the `[provider]` config section. Without a base
/// URL every call reports unavailable.
pub fn build_provider(section: &ProviderSection) -> Result<SharedProvider, reqwest::Error> {
    match &section.base_url {
        Some(base_url) => {
            let provider = OpenAiProvider::new(
                base_url,
                section.api_key(),
                Duration::from_secs(section.timeout_secs),
            )?;
            debug!(endpoint = %provider.endpoint(), "Using chat-completions provider");
            Ok(Arc::new(provider))
        }
        None => {
            warn!("No provider base_url configured; model calls will report unavailable");
            Ok(Arc::new(UnavailableProvider::default()))
        }
    }
}

/// Classify a non-success HTTP status
pub fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("LLM API error ({}): {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(format!("HTTP request failed: {}", err))
    } else {
        ProviderError::Permanent(format!("HTTP request failed: {}", err))
    }
}

/// Text of the first choice. Reasoning output, when present, is kept ahead
/// of the answer.
fn extract_content(response: ChatResponse) -> Result<String, ProviderError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Permanent("No response from LLM".to_string()))?;

    let content = match (choice.message.reasoning_content, choice.message.content) {
        (Some(reasoning), Some(answer)) => {
            format!("<reasoning>\n{}\n</reasoning>\n\n{}", reasoning, answer)
        }
        (Some(reasoning), None) => reasoning,
        (None, Some(answer)) => answer,
        (None, None) => String::new(),
    };
    if content.trim().is_empty() {
        return Err(ProviderError::Permanent("LLM returned empty content".to_string()));
    }
    Ok(content)
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Generation, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        let request = ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("Failed to parse response: {}", e)))?;
        extract_content(parsed).map(Generation::Real)
    }
}
