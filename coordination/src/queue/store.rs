//! Task store abstraction and the in-memory backend
//!
//! The store is the single source of truth for task status and ordering.
//! Every method is atomic with respect to every other method on the same
//! store: a claim and the index update that goes with it are never observed
//! half-done.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::error::{QueueError, StoreError, StoreResult};
use super::types::{OrderKey, Task, TaskId, TaskStatus};

/// Shared reference to a task store
pub type SharedTaskStore = Arc<dyn TaskStore>;

/// Mutation applied by [`TaskStore::update`]. Returning an error aborts the
/// update and leaves the stored task unchanged.
pub type TaskMutation<'a> = &'a mut (dyn FnMut(&mut Task) -> Result<(), QueueError> + Send);

/// Backing store for the task queue.
pub trait TaskStore: Send + Sync {
    /// Insert a new task together with its pending index entry.
    fn insert(&self, task: &Task) -> StoreResult<()>;

    /// Fetch a task by id.
    fn get(&self, task_id: &str) -> StoreResult<Option<Task>>;

    /// Claim the first available pending task in dequeue order.
    fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<Task>>;

    /// Atomic read-modify-write of one task. The pending index follows the
    /// task's status.
    fn update(&self, task_id: &str, apply: TaskMutation<'_>) -> Result<Task, QueueError>;

    /// All tasks, optionally filtered by status.
    fn scan(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>>;

    /// Delete a task and any index entry. Returns whether it existed.
    fn remove(&self, task_id: &str) -> StoreResult<bool>;

    /// Next insertion sequence number.
    fn next_sequence(&self) -> StoreResult<u64>;

    /// Check that the backing store answers.
    fn health_check(&self) -> StoreResult<()>;
}

/// Apply the claim fields to a task picked by `claim_next`.
pub(crate) fn mark_claimed(task: &mut Task, worker_id: &str, now: DateTime<Utc>) {
    task.status = TaskStatus::InProgress;
    task.claimed_by = Some(worker_id.to_string());
    task.heartbeat_at = Some(now);
    task.available_at = None;
    task.updated_at = now;
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<TaskId, Task>,
    pending: BTreeMap<OrderKey, TaskId>,
}

/// In-process task store shared by every worker holding the `Arc`.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    sequence: AtomicU64,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            sequence: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedTaskStore {
        Arc::new(self)
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore for MemoryStore {
    fn insert(&self, task: &Task) -> StoreResult<()> {
        self.ensure_available()?;
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        if task.status == TaskStatus::Pending {
            inner.pending.insert(task.order_key(), task.id.clone());
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
        self.ensure_available()?;
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner.tasks.get(task_id).cloned())
    }

    fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        self.ensure_available()?;
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;

        let picked = inner
            .pending
            .iter()
            .find(|(_, id)| inner.tasks.get(*id).is_some_and(|t| t.is_available(now)))
            .map(|(key, id)| (*key, id.clone()));

        let Some((key, id)) = picked else {
            return Ok(None);
        };

        inner.pending.remove(&key);
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        mark_claimed(task, worker_id, now);
        Ok(Some(task.clone()))
    }

    fn update(&self, task_id: &str, apply: TaskMutation<'_>) -> Result<Task, QueueError> {
        self.ensure_available()?;
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;

        let current = inner
            .tasks
            .get(task_id)
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        let mut updated = current.clone();
        apply(&mut updated)?;

        let was_pending = current.status == TaskStatus::Pending;
        let old_key = current.order_key();
        if was_pending {
            inner.pending.remove(&old_key);
        }
        if updated.status == TaskStatus::Pending {
            inner.pending.insert(updated.order_key(), updated.id.clone());
        }
        inner.tasks.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    fn scan(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
        self.ensure_available()?;
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    fn remove(&self, task_id: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        match inner.tasks.remove(task_id) {
            Some(task) => {
                if task.status == TaskStatus::Pending {
                    inner.pending.remove(&task.order_key());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_sequence(&self) -> StoreResult<u64> {
        self.ensure_available()?;
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn health_check(&self) -> StoreResult<()> {
        self.ensure_available()
    }
}
