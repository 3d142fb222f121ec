//! Agent roles, model providers and the uniform invoker

pub mod descriptor;
pub mod invoker;
pub mod provider;

pub use descriptor::{
    default_descriptors, AgentDescriptor, AgentRegistry, PromptContext, RegistryError,
    TierRoster, DEFAULT_PROMPT_TEMPLATE,
};
pub use invoker::{AgentError, AgentInvoker, AgentOutput, AgentRequest, ModelAgentInvoker, SharedInvoker};
pub use provider::{
    GenerateOptions, Generation, ModelProvider, ProviderError, SharedProvider, UnavailableProvider,
};
