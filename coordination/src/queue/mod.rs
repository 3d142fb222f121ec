//! Durable priority task queue
//!
//! Pending tasks are ordered by priority score (critical 0 … low 3), then
//! creation time, then an insertion sequence number, so the dequeue order is
//! total and deterministic. The store is the only authority for task status:
//! every claim, outcome and requeue is one atomic store mutation, and two
//! concurrent `dequeue` calls never return the same task.
//!
//! # Lifecycle
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!  ┌────────► pending ──────────── cancel ─────────┐
//!  │            │                                  │
//!  │ requeue /  │ dequeue (claim + heartbeat)      ▼
//!  │ reclaim /  ▼                               cancelled
//!  │ release  in_progress ─── cancel ──────────────▲
//!  └────────────┤
//!               ├── complete ──► completed
//!               └── fail / retries exhausted ──► failed
//! ```
//!
//! # Backends
//!
//! * [`MemoryStore`] is always available and shared between workers in one
//!   process through an `Arc`.
//! * `RocksStore` (feature `durable`) persists tasks in RocksDB so queue state
//!   survives restarts.

pub mod cleanup;
pub mod error;
#[cfg(feature = "durable")]
pub mod rocks;
pub mod schema;
pub mod store;
pub mod task_queue;
pub mod types;

pub use cleanup::{CleanupLoop, CleanupReport};
pub use error::{QueueError, QueueResult, StoreError, StoreResult};
#[cfg(feature = "durable")]
pub use rocks::RocksStore;
pub use store::{MemoryStore, SharedTaskStore, TaskMutation, TaskStore};
pub use task_queue::{BackoffPolicy, QueueConfig, ReclaimedTask, SharedTaskQueue, TaskQueue};
pub use types::{
    NewTask, OrderKey, Priority, QueueStats, RequeueOutcome, Task, TaskId, TaskStatus,
    TaskSubmission, WorkerId,
};
