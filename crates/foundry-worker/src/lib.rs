//! Foundry worker service
//!
//! Wires the coordination library into a runnable service: an
//! OpenAI-compatible model provider, the configured task store, worker
//! pool, cleanup loop and debate runner.

pub mod provider;
pub mod service;

pub use provider::{build_provider, OpenAiProvider};
pub use service::{read_seed_file, RunSummary, SeedTask, Service};
