//! Event fabric connecting the queue, the orchestrator and debates
//!
//! Components announce state transitions on the bus; nobody polls another
//! component directly. Delivery is fire-and-forget and in-process only: the
//! queue's store remains the authority for task state.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│ Handlers         │
//! │  (publish)   │     │              │     │ (unbounded queue │
//! └──────────────┘     └──┬────────┬──┘     │  + task each)    │
//!                         │        │        └──────────────────┘
//!                         │        ▼
//!                         │  ┌──────────────┐
//!                         │  │ Raw receivers│
//!                         │  │ (broadcast,  │
//!                         │  │  may lag)    │
//!                         ▼  └──────────────┘
//!                  ┌──────────────┐
//!                  │ History ring │
//!                  │ (last 1000)  │
//!                  └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use foundry_coordination::events::{topics, Event, EventBus};
//! use serde_json::json;
//!
//! let bus = EventBus::new().shared();
//!
//! let sub = bus.subscribe("task.*", |event| async move {
//!     tracing::info!(topic = %event.topic, "saw task event");
//!     Ok(())
//! });
//!
//! bus.publish(
//!     Event::new(topics::TASK_COMPLETED, json!({"result": "ok"}))
//!         .from_origin("orchestrator")
//!         .correlated("task-1"),
//! );
//! ```

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{
    EventBus, EventBusExt, EventFilter, FilteredReceiver, HandlerResult, SharedEventBus,
    Subscription,
};
pub use history::{EventHistory, EventStats, HistoryQuery, DEFAULT_HISTORY_LIMIT};
pub use types::{topics, Event, EventId, TopicPattern};
