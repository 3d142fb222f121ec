//! Foundry Coordination Library
//!
//! This library provides:
//! - A durable priority task queue with claims, heartbeats and stale-claim reclaim
//! - An in-process event bus with topic patterns and bounded history
//! - A workflow orchestrator that routes each step to a model by task complexity
//! - A multi-round debate protocol that runs until consensus or budget exhaustion
//!
//! # Architecture
//!
//! ```text
//!   submit ──► TaskQueue ──dequeue──► Orchestrator worker ──► AgentInvoker ──► ModelProvider
//!                 │  ▲                    │      │                  ▲
//!                 │  └─complete/requeue───┘      └─ debate step ─► DebateRunner
//!                 ▼                              │
//!              TaskStore                         ▼
//!          (memory | rocksdb)                 EventBus ──► subscribers, history
//! ```
//!
//! # Modules
//!
//! - [`queue`]: task records, ordering, the store abstraction and the cleanup loop
//! - [`events`]: publish/subscribe with wildcard topics
//! - [`router`]: keyword complexity classifier and tier selection
//! - [`agents`]: role registry, provider trait, uniform invoker
//! - [`workflow`]: step sequences and the worker loop
//! - [`debate`]: session state machine, consensus check, synthesis, transcripts
//! - [`config`]: TOML + environment configuration

#![allow(clippy::uninlined_format_args)]

pub mod agents;
pub mod config;
pub mod debate;
pub mod error;
pub mod events;
pub mod queue;
pub mod router;
pub mod workflow;

pub use agents::{AgentError, AgentInvoker, AgentRegistry, ModelAgentInvoker, ModelProvider};
pub use config::{ConfigError, FoundryConfig, StoreBackend};
pub use debate::{DebateError, DebateOutcome, DebateRequest, DebateRunner, Participant, Synthesis};
pub use error::{ErrorKind, TaskError};
pub use events::{Event, EventBus, SharedEventBus};
pub use queue::{NewTask, Priority, QueueConfig, QueueError, Task, TaskQueue, TaskStatus};
pub use router::{Complexity, ModelRouter};
pub use workflow::{Orchestrator, OrchestratorConfig, OrchestratorError, StepSpec, WorkflowTemplate};
