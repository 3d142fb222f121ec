//! Periodic queue maintenance
//!
//! Reclaims claims whose heartbeat went stale and purges terminal tasks past
//! their retention window. This is the backstop that guarantees no task is
//! stuck `in_progress` after its worker disappears.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::QueueResult;
use super::task_queue::{ReclaimedTask, SharedTaskQueue};
use super::types::{RequeueOutcome, TaskId};
use crate::events::{topics, Event, SharedEventBus};

const ORIGIN: &str = "cleanup";

/// What one cleanup pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub reclaimed: Vec<ReclaimedTask>,
    pub purged: Vec<TaskId>,
}

impl CleanupReport {
    /// Whether the pass changed anything
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.purged.is_empty()
    }
}

/// Fixed-interval maintenance loop
pub struct CleanupLoop {
    queue: SharedTaskQueue,
    events: SharedEventBus,
    interval: Duration,
}

impl CleanupLoop {
    /// Create a loop using the queue's configured interval
    pub fn new(queue: SharedTaskQueue, events: SharedEventBus) -> Self {
        let interval = queue.config().cleanup_interval;
        Self {
            queue,
            events,
            interval,
        }
    }

    /// Override the period
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one maintenance pass at `now` and publish what changed
    pub fn run_once(&self, now: DateTime<Utc>) -> QueueResult<CleanupReport> {
        let reclaimed = self.queue.reclaim_stale(now)?;
        let mut any_requeued = false;
        for item in &reclaimed {
            self.events.publish(
                Event::new(
                    topics::TASK_RECLAIMED,
                    json!({
                        "previous_worker": item.previous_worker,
                        "outcome": item.outcome,
                    }),
                )
                .from_origin(ORIGIN)
                .correlated(&item.task_id),
            );
            match &item.outcome {
                RequeueOutcome::Requeued { .. } => any_requeued = true,
                RequeueOutcome::Exhausted { retry_count } => self.events.publish(
                    Event::new(
                        topics::TASK_FAILED,
                        json!({"kind": "retries_exhausted", "retry_count": retry_count}),
                    )
                    .from_origin(ORIGIN)
                    .correlated(&item.task_id),
                ),
            }
        }

        let purged = self.queue.purge_terminal(now)?;
        for task_id in &purged {
            self.events.publish(
                Event::new(topics::TASK_PURGED, json!({}))
                    .from_origin(ORIGIN)
                    .correlated(task_id),
            );
        }

        if any_requeued {
            self.events
                .publish(Event::new(topics::TASK_AVAILABLE, json!({})).from_origin(ORIGIN));
        }

        Ok(CleanupReport { reclaimed, purged })
    }

    /// Run until `cancel` fires. Store errors are logged and retried on the
    /// next tick.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Cleanup loop started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.run_once(Utc::now()) {
                    Ok(report) if report.is_empty() => debug!("Cleanup pass: nothing to do"),
                    Ok(report) => info!(
                        reclaimed = report.reclaimed.len(),
                        purged = report.purged.len(),
                        "Cleanup pass"
                    ),
                    Err(e) => warn!(error = %e, "Cleanup pass failed"),
                }
            }
            info!("Cleanup loop stopped");
        })
    }
}
