//! Queue operations over a [`TaskStore`]
//!
//! Every operation is a single atomic store call, so the queue itself holds
//! no locks and no state besides its configuration. Methods with an `_at`
//! suffix take the clock reading explicitly; the plain forms use `Utc::now()`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::{QueueError, QueueResult};
use super::store::{SharedTaskStore, TaskStore};
use super::types::{NewTask, QueueStats, RequeueOutcome, Task, TaskId, TaskStatus};
use crate::error::{ErrorKind, TaskError};

/// Shared reference to TaskQueue
pub type SharedTaskQueue = Arc<TaskQueue>;

/// Exponential retry backoff: `base * 2^retry`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay before the attempt following `retry` earlier retries
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Queue tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Requeues allowed before a task fails for good
    pub max_retries: u32,
    /// Heartbeat age after which a claim is considered abandoned
    pub stale_after: Duration,
    /// Cleanup loop period
    pub cleanup_interval: Duration,
    /// How long terminal tasks are kept
    pub retention: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stale_after: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            retention: Duration::from_secs(24 * 60 * 60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A claim taken back from a worker that stopped heartbeating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimedTask {
    pub task_id: TaskId,
    pub previous_worker: Option<String>,
    pub outcome: RequeueOutcome,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

fn shift_back(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn shift_forward(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn ensure_owner(task: &Task, worker_id: &str) -> QueueResult<()> {
    if task.is_claimed_by(worker_id) {
        return Ok(());
    }
    let reason = match (&task.status, &task.claimed_by) {
        (TaskStatus::InProgress, Some(owner)) => format!("claimed by {}, not {}", owner, worker_id),
        (status, _) => format!("task is {}, not in_progress", status),
    };
    Err(QueueError::conflict(&task.id, reason))
}

/// Durable priority queue
pub struct TaskQueue {
    store: SharedTaskStore,
    config: QueueConfig,
}

impl TaskQueue {
    /// Create a queue over `store`
    pub fn new(store: SharedTaskStore, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Create a shared reference to this queue
    pub fn shared(self) -> SharedTaskQueue {
        Arc::new(self)
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Backing store
    pub fn store(&self) -> &SharedTaskStore {
        &self.store
    }

    /// Check that the backing store answers
    pub fn health_check(&self) -> QueueResult<()> {
        self.store.health_check().map_err(QueueError::from)
    }

    // =========================================================================
    // Submission and claiming
    // =========================================================================

    /// Validate and persist a new pending task
    pub fn enqueue(&self, new: NewTask) -> QueueResult<TaskId> {
        self.enqueue_at(new, Utc::now())
    }

    /// [`enqueue`](Self::enqueue) with an explicit creation time
    pub fn enqueue_at(&self, new: NewTask, now: DateTime<Utc>) -> QueueResult<TaskId> {
        let priority = new.validate()?;
        let seq = self.store.next_sequence()?;

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title.trim().to_string(),
            description: new.description,
            task_type: new.task_type.unwrap_or_else(|| "general".to_string()),
            priority,
            status: TaskStatus::Pending,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            assigned_agent: new.assigned_agent,
            retry_count: 0,
            max_retries: new.max_retries,
            last_error: None,
            claimed_by: None,
            heartbeat_at: None,
            available_at: None,
            result: None,
            timeout_secs: new.timeout_secs,
            correlation_id: new.correlation_id,
            parent_task_id: new.parent_task_id,
            finished_at: None,
            seq,
        };

        self.store.insert(&task)?;
        info!(task_id = %task.id, priority = %task.priority, title = %task.title, "Task enqueued");
        Ok(task.id)
    }

    /// Claim the next task for `worker_id`, if any is available
    pub fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Task>> {
        self.dequeue_at(worker_id, Utc::now())
    }

    /// [`dequeue`](Self::dequeue) with an explicit clock reading
    pub fn dequeue_at(&self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<Option<Task>> {
        let claimed = self.store.claim_next(worker_id, now)?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.id, worker_id, "Task claimed");
        }
        Ok(claimed)
    }

    /// Refresh the claim held by `worker_id`
    pub fn heartbeat(&self, task_id: &str, worker_id: &str) -> QueueResult<Task> {
        self.heartbeat_at(task_id, worker_id, Utc::now())
    }

    /// [`heartbeat`](Self::heartbeat) with an explicit clock reading
    pub fn heartbeat_at(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Task> {
        self.store.update(task_id, &mut |task: &mut Task| {
            ensure_owner(task, worker_id)?;
            task.heartbeat_at = Some(now);
            Ok(())
        })
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    /// Mark a claimed task completed
    pub fn complete(&self, task_id: &str, worker_id: &str, result: Value) -> QueueResult<Task> {
        let now = Utc::now();
        let task = self.store.update(task_id, &mut |task: &mut Task| {
            ensure_owner(task, worker_id)?;
            task.transition(TaskStatus::Completed, now)?;
            task.result = Some(result.clone());
            Ok(())
        })?;
        info!(task_id, worker_id, "Task completed");
        Ok(task)
    }

    /// Mark a claimed task failed
    pub fn fail(&self, task_id: &str, worker_id: &str, error: TaskError) -> QueueResult<Task> {
        let now = Utc::now();
        let task = self.store.update(task_id, &mut |task: &mut Task| {
            ensure_owner(task, worker_id)?;
            task.transition(TaskStatus::Failed, now)?;
            task.last_error = Some(error.clone());
            Ok(())
        })?;
        warn!(task_id, worker_id, error = %error, "Task failed");
        Ok(task)
    }

    /// Return a claimed task to pending with a retry penalty and backoff.
    ///
    /// When `worker_id` is given it must hold the claim. Once the retry
    /// budget is spent the task fails with `retries_exhausted` instead.
    pub fn requeue(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        error: Option<TaskError>,
    ) -> QueueResult<RequeueOutcome> {
        self.requeue_at(task_id, worker_id, error, None, Utc::now())
    }

    /// [`requeue`](Self::requeue) with an explicit delay override and clock
    pub fn requeue_at(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        error: Option<TaskError>,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> QueueResult<RequeueOutcome> {
        let mut outcome = None;
        self.store.update(task_id, &mut |task: &mut Task| {
            match worker_id {
                Some(worker) => ensure_owner(task, worker)?,
                None if task.status != TaskStatus::InProgress => {
                    return Err(QueueError::conflict(
                        &task.id,
                        format!("task is {}, not in_progress", task.status),
                    ))
                }
                None => {}
            }
            outcome = Some(self.apply_requeue(task, error.clone(), delay, now)?);
            Ok(())
        })?;

        let outcome = outcome.ok_or_else(|| QueueError::conflict(task_id, "requeue not applied"))?;
        match &outcome {
            RequeueOutcome::Requeued { retry_count, .. } => {
                info!(task_id, retry_count, "Task requeued")
            }
            RequeueOutcome::Exhausted { retry_count } => {
                warn!(task_id, retry_count, "Task retries exhausted")
            }
        }
        Ok(outcome)
    }

    fn apply_requeue(
        &self,
        task: &mut Task,
        error: Option<TaskError>,
        delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> QueueResult<RequeueOutcome> {
        let max_retries = task.max_retries.unwrap_or(self.config.max_retries);
        let retry_count = task.retry_count + 1;

        if retry_count > max_retries {
            let mut exhausted = TaskError::new(
                ErrorKind::RetriesExhausted,
                format!("gave up after {} retries", task.retry_count),
            )
            .with_context("max_retries", max_retries);
            if let Some(cause) = error.as_ref().or(task.last_error.as_ref()) {
                exhausted = exhausted.with_context("last_error", cause.to_string());
            }
            task.transition(TaskStatus::Failed, now)?;
            task.last_error = Some(exhausted);
            return Ok(RequeueOutcome::Exhausted {
                retry_count: task.retry_count,
            });
        }

        let delay = delay.unwrap_or_else(|| self.config.backoff.delay_for(task.retry_count));
        let available_at = shift_forward(now, delay);
        task.transition(TaskStatus::Pending, now)?;
        task.retry_count = retry_count;
        task.claimed_by = None;
        task.heartbeat_at = None;
        task.available_at = Some(available_at);
        if let Some(error) = error {
            task.last_error = Some(error);
        }
        Ok(RequeueOutcome::Requeued {
            retry_count,
            available_at,
        })
    }

    /// Hand a claim back without a retry penalty
    pub fn release(&self, task_id: &str, worker_id: &str) -> QueueResult<Task> {
        let now = Utc::now();
        let task = self.store.update(task_id, &mut |task: &mut Task| {
            ensure_owner(task, worker_id)?;
            task.transition(TaskStatus::Pending, now)?;
            task.claimed_by = None;
            task.heartbeat_at = None;
            task.available_at = None;
            Ok(())
        })?;
        info!(task_id, worker_id, "Task released");
        Ok(task)
    }

    /// Cancel a pending or in-progress task
    pub fn cancel(&self, task_id: &str, reason: &str) -> QueueResult<Task> {
        let now = Utc::now();
        let task = self.store.update(task_id, &mut |task: &mut Task| {
            task.transition(TaskStatus::Cancelled, now)?;
            task.last_error = Some(TaskError::new(ErrorKind::Cancelled, reason));
            Ok(())
        })?;
        info!(task_id, reason, "Task cancelled");
        Ok(task)
    }

    /// Set one metadata entry on a task claimed by `worker_id`
    pub fn update_metadata(
        &self,
        task_id: &str,
        worker_id: &str,
        key: &str,
        value: Value,
    ) -> QueueResult<Task> {
        let now = Utc::now();
        self.store.update(task_id, &mut |task: &mut Task| {
            ensure_owner(task, worker_id)?;
            task.metadata.insert(key.to_string(), value.clone());
            task.updated_at = now;
            Ok(())
        })
    }

    /// Set one metadata entry on a task that nobody has claimed yet
    pub fn update_pending_metadata(&self, task_id: &str, key: &str, value: Value) -> QueueResult<Task> {
        let now = Utc::now();
        self.store.update(task_id, &mut |task: &mut Task| {
            if task.status != TaskStatus::Pending {
                return Err(QueueError::conflict(
                    &task.id,
                    format!("task is {}, not pending", task.status),
                ));
            }
            task.metadata.insert(key.to_string(), value.clone());
            task.updated_at = now;
            Ok(())
        })
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Fetch a task
    pub fn get(&self, task_id: &str) -> QueueResult<Task> {
        self.store
            .get(task_id)?
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    /// List tasks. Pending tasks come back in dequeue order, everything
    /// else newest-update first.
    pub fn list(&self, status: Option<TaskStatus>, limit: Option<usize>) -> QueueResult<Vec<Task>> {
        let mut tasks = self.store.scan(status)?;
        if status == Some(TaskStatus::Pending) {
            tasks.sort_by_key(|t| t.order_key());
        } else {
            tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.seq.cmp(&b.seq)));
        }
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    /// Counts per status
    pub fn stats(&self) -> QueueResult<QueueStats> {
        let mut stats = QueueStats::default();
        for task in self.store.scan(None)? {
            stats.record(task.status);
        }
        Ok(stats)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Requeue in-progress tasks whose heartbeat is older than `stale_after`
    pub fn reclaim_stale(&self, now: DateTime<Utc>) -> QueueResult<Vec<ReclaimedTask>> {
        let cutoff = shift_back(now, self.config.stale_after);
        let is_stale = |t: &Task| {
            t.status == TaskStatus::InProgress && t.heartbeat_at.unwrap_or(t.updated_at) < cutoff
        };

        let candidates: Vec<Task> = self
            .store
            .scan(Some(TaskStatus::InProgress))?
            .into_iter()
            .filter(|t| is_stale(t))
            .collect();

        let mut reclaimed = Vec::new();
        for candidate in candidates {
            let previous_worker = candidate.claimed_by.clone();
            let mut outcome = None;
            let result = self.store.update(&candidate.id, &mut |task: &mut Task| {
                // The worker may have heartbeated since the scan.
                if !is_stale(task) {
                    return Err(QueueError::conflict(&task.id, "claim refreshed"));
                }
                let error = TaskError::new(
                    ErrorKind::StaleClaim,
                    format!(
                        "no heartbeat from {} for {:?}",
                        task.claimed_by.as_deref().unwrap_or("unknown worker"),
                        self.config.stale_after
                    ),
                );
                outcome = Some(self.apply_requeue(task, Some(error), Some(Duration::ZERO), now)?);
                Ok(())
            });

            match (result, outcome) {
                (Ok(_), Some(outcome)) => {
                    warn!(task_id = %candidate.id, previous_worker = ?previous_worker, "Reclaimed stale task");
                    reclaimed.push(ReclaimedTask {
                        task_id: candidate.id,
                        previous_worker,
                        outcome,
                    });
                }
                (Err(QueueError::Conflict { .. }), _) | (Err(QueueError::NotFound(_)), _) => {
                    debug!(task_id = %candidate.id, "Stale candidate changed before reclaim");
                }
                (Err(e), _) => return Err(e),
                (Ok(_), None) => {}
            }
        }
        Ok(reclaimed)
    }

    /// Delete terminal tasks that finished before `now - retention`
    pub fn purge_terminal(&self, now: DateTime<Utc>) -> QueueResult<Vec<TaskId>> {
        let cutoff = shift_back(now, self.config.retention);
        let mut purged = Vec::new();
        for task in self.store.scan(None)? {
            let finished = task.finished_at.unwrap_or(task.updated_at);
            if task.status.is_terminal() && finished < cutoff && self.store.remove(&task.id)? {
                purged.push(task.id);
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged terminal tasks");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::MemoryStore;
    use crate::queue::types::Priority;
    use serde_json::json;

    fn queue() -> TaskQueue {
        TaskQueue::new(MemoryStore::new().shared(), QueueConfig::default())
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for(64), Duration::from_secs(60));
    }

    #[test]
    fn test_enqueue_validation() {
        let q = queue();
        assert!(matches!(
            q.enqueue(NewTask::new("", Priority::High)),
            Err(QueueError::Validation(_))
        ));
        assert!(matches!(
            q.enqueue(NewTask {
                title: "no priority".into(),
                ..Default::default()
            }),
            Err(QueueError::Validation(_))
        ));
        assert_eq!(q.stats().unwrap().total(), 0);
    }

    #[test]
    fn test_dequeue_order_and_ties() {
        let q = queue();
        let t0 = Utc::now();
        let low = q.enqueue_at(NewTask::new("low", Priority::Low), t0).unwrap();
        let high_late = q
            .enqueue_at(NewTask::new("high late", Priority::High), t0 + secs(2))
            .unwrap();
        let high_early = q
            .enqueue_at(NewTask::new("high early", Priority::High), t0 + secs(1))
            .unwrap();
        let same_time = q
            .enqueue_at(NewTask::new("high same", Priority::High), t0 + secs(1))
            .unwrap();

        let order: Vec<TaskId> = std::iter::from_fn(|| q.dequeue("w").unwrap().map(|t| t.id)).collect();
        assert_eq!(order, vec![high_early, same_time, high_late, low]);
    }

    #[test]
    fn test_complete_requires_owner() {
        let q = queue();
        let id = q.enqueue(NewTask::new("work", Priority::Medium)).unwrap();
        q.dequeue("w1").unwrap().unwrap();
        let before = q.get(&id).unwrap();

        let err = q.complete(&id, "w2", json!("done")).unwrap_err();
        assert!(matches!(err, QueueError::Conflict { .. }));
        assert_eq!(q.get(&id).unwrap(), before);

        let done = q.complete(&id, "w1", json!("done")).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.finished_at.is_some());
        assert!(done.claimed_by.is_none());

        let after = q.get(&id).unwrap();
        assert!(q.complete(&id, "w1", json!("again")).is_err());
        assert!(q
            .fail(&id, "w1", TaskError::new(ErrorKind::Timeout, "late"))
            .is_err());
        assert_eq!(q.get(&id).unwrap(), after);
    }

    #[test]
    fn test_complete_pending_task_conflicts() {
        let q = queue();
        let id = q.enqueue(NewTask::new("work", Priority::Medium)).unwrap();
        assert!(matches!(
            q.complete(&id, "w1", json!(null)),
            Err(QueueError::Conflict { .. })
        ));
        assert_eq!(q.get(&id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_requeue_backoff_and_exhaustion() {
        let q = queue();
        let t0 = Utc::now();
        let id = q
            .enqueue_at(NewTask::new("flaky", Priority::High).with_max_retries(1), t0)
            .unwrap();
        q.dequeue_at("w1", t0).unwrap().unwrap();

        let err = TaskError::new(ErrorKind::ProviderTransient, "rate limited");
        let outcome = q
            .requeue_at(&id, Some("w1"), Some(err.clone()), None, t0)
            .unwrap();
        let available_at = match outcome {
            RequeueOutcome::Requeued {
                retry_count,
                available_at,
            } => {
                assert_eq!(retry_count, 1);
                available_at
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(available_at, t0 + secs(1));

        // Still backing off.
        assert!(q.dequeue_at("w2", t0).unwrap().is_none());
        let task = q.dequeue_at("w2", available_at).unwrap().unwrap();
        assert_eq!(task.last_error, Some(err));

        let outcome = q
            .requeue_at(&id, Some("w2"), None, None, available_at)
            .unwrap();
        assert_eq!(outcome, RequeueOutcome::Exhausted { retry_count: 1 });
        let failed = q.get(&id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.last_error.map(|e| e.kind),
            Some(ErrorKind::RetriesExhausted)
        );
    }

    #[test]
    fn test_release_keeps_retry_count() {
        let q = queue();
        let id = q.enqueue(NewTask::new("work", Priority::Low)).unwrap();
        q.dequeue("w1").unwrap();
        let released = q.release(&id, "w1").unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.retry_count, 0);
        assert_eq!(q.dequeue("w2").unwrap().unwrap().id, id);
    }

    #[test]
    fn test_cancel() {
        let q = queue();
        let pending = q.enqueue(NewTask::new("a", Priority::Low)).unwrap();
        let running = q.enqueue(NewTask::new("b", Priority::Critical)).unwrap();
        q.dequeue("w1").unwrap();

        assert_eq!(
            q.cancel(&pending, "user request").unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            q.cancel(&running, "user request").unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(matches!(
            q.cancel(&running, "again"),
            Err(QueueError::Conflict { .. })
        ));
        assert!(q.dequeue("w1").unwrap().is_none());
        assert!(matches!(
            q.cancel("missing", "x"),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_metadata_updates_require_claim() {
        let q = queue();
        let id = q.enqueue(NewTask::new("a", Priority::Low)).unwrap();
        q.update_pending_metadata(&id, "workflow", json!([])).unwrap();
        assert!(q.update_metadata(&id, "w1", "k", json!(1)).is_err());

        q.dequeue("w1").unwrap();
        let task = q.update_metadata(&id, "w1", "k", json!(1)).unwrap();
        assert_eq!(task.metadata["k"], 1);
        assert!(q.update_metadata(&id, "w2", "k", json!(2)).is_err());
        assert!(q.update_pending_metadata(&id, "k", json!(3)).is_err());
    }

    #[test]
    fn test_reclaim_stale_once_per_period() {
        let q = queue();
        let t0 = Utc::now();
        let id = q.enqueue_at(NewTask::new("a", Priority::Low), t0).unwrap();
        q.dequeue_at("w1", t0).unwrap();

        assert!(q.reclaim_stale(t0 + secs(30)).unwrap().is_empty());

        let later = t0 + secs(61);
        let reclaimed = q.reclaim_stale(later).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].task_id, id);
        assert_eq!(reclaimed[0].previous_worker.as_deref(), Some("w1"));
        assert!(q.reclaim_stale(later).unwrap().is_empty());

        let task = q.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.map(|e| e.kind), Some(ErrorKind::StaleClaim));
    }

    #[test]
    fn test_heartbeat_prevents_reclaim() {
        let q = queue();
        let t0 = Utc::now();
        let id = q.enqueue_at(NewTask::new("a", Priority::Low), t0).unwrap();
        q.dequeue_at("w1", t0).unwrap();
        q.heartbeat_at(&id, "w1", t0 + secs(50)).unwrap();
        assert!(q.reclaim_stale(t0 + secs(61)).unwrap().is_empty());
        assert!(q.heartbeat_at(&id, "w2", t0 + secs(62)).is_err());
    }

    #[test]
    fn test_purge_terminal() {
        let q = queue();
        let id = q.enqueue(NewTask::new("a", Priority::Low)).unwrap();
        let keep = q.enqueue(NewTask::new("b", Priority::Low)).unwrap();
        q.dequeue("w1").unwrap();
        q.complete(&id, "w1", json!(null)).unwrap();

        let now = Utc::now();
        assert!(q.purge_terminal(now).unwrap().is_empty());
        let purged = q.purge_terminal(now + secs(24 * 3600 + 1)).unwrap();
        assert_eq!(purged, vec![id.clone()]);
        assert!(matches!(q.get(&id), Err(QueueError::NotFound(_))));
        assert!(q.get(&keep).is_ok());
    }

    #[test]
    fn test_list_and_stats() {
        let q = queue();
        let t0 = Utc::now();
        let a = q.enqueue_at(NewTask::new("a", Priority::Low), t0).unwrap();
        let b = q.enqueue_at(NewTask::new("b", Priority::Critical), t0).unwrap();
        let c = q.enqueue_at(NewTask::new("c", Priority::Medium), t0).unwrap();

        let pending: Vec<TaskId> = q
            .list(Some(TaskStatus::Pending), None)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![b.clone(), c, a]);
        assert_eq!(q.list(None, Some(2)).unwrap().len(), 2);

        q.dequeue("w").unwrap();
        let stats = q.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.total(), 3);
        assert_eq!(q.get(&b).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn test_storage_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let q = TaskQueue::new(store.clone(), QueueConfig::default());
        store.set_available(false);
        assert!(q
            .enqueue(NewTask::new("a", Priority::Low))
            .unwrap_err()
            .is_storage_unavailable());
        assert!(q.health_check().is_err());
        store.set_available(true);
        assert!(q.health_check().is_ok());
    }
}
