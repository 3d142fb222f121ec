//! RocksDB-backed task store
//!
//! Tasks live in the `tasks` column family as JSON. The `pending` column
//! family holds one empty-valued key per claimable task, laid out so that a
//! forward scan visits tasks in dequeue order (see [`schema::keys::pending`]).
//! Every mutation takes the write side of the database lock and commits the
//! task record and its index entry in a single `WriteBatch`.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};

use super::error::{QueueError, StoreError, StoreResult};
use super::schema::{self, keys, ALL_CFS};
use super::store::{mark_claimed, SharedTaskStore, TaskMutation, TaskStore};
use super::types::{Task, TaskStatus};

/// Persistent task store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedTaskStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> StoreResult<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Unavailable(format!("column family {} missing", name)))
}

fn encode(task: &Task) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(task).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> StoreResult<Task> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn read_task(db: &DB, task_id: &str) -> StoreResult<Option<Task>> {
    let tasks = cf(db, schema::CF_TASKS)?;
    match db.get_cf(tasks, keys::task(task_id).as_bytes())? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Stage a task write plus the index change implied by `previous`.
fn stage_write(
    db: &DB,
    batch: &mut WriteBatch,
    previous: Option<&Task>,
    task: &Task,
) -> StoreResult<()> {
    let tasks = cf(db, schema::CF_TASKS)?;
    let pending = cf(db, schema::CF_PENDING)?;

    if let Some(prev) = previous.filter(|p| p.status == TaskStatus::Pending) {
        batch.delete_cf(pending, keys::pending(&prev.order_key(), &prev.id).as_bytes());
    }
    if task.status == TaskStatus::Pending {
        batch.put_cf(
            pending,
            keys::pending(&task.order_key(), &task.id).as_bytes(),
            b"",
        );
    }
    batch.put_cf(tasks, keys::task(&task.id).as_bytes(), encode(task)?);
    Ok(())
}

impl TaskStore for RocksStore {
    fn insert(&self, task: &Task) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        if read_task(&db, &task.id)?.is_some() {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        let mut batch = WriteBatch::default();
        stage_write(&db, &mut batch, None, task)?;
        db.write(batch)?;
        Ok(())
    }

    fn get(&self, task_id: &str) -> StoreResult<Option<Task>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        read_task(&db, task_id)
    }

    fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let pending = cf(&db, schema::CF_PENDING)?;

        let mut picked = None;
        for item in db.iterator_cf(pending, IteratorMode::Start) {
            let (key, _) = item?;
            let key_str = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let Some(task_id) = keys::parse_pending_task_id(&key_str) else {
                continue;
            };
            if let Some(task) = read_task(&db, task_id)? {
                if task.is_available(now) {
                    picked = Some(task);
                    break;
                }
            }
        }

        let Some(previous) = picked else {
            return Ok(None);
        };
        let mut claimed = previous.clone();
        mark_claimed(&mut claimed, worker_id, now);

        let mut batch = WriteBatch::default();
        stage_write(&db, &mut batch, Some(&previous), &claimed)?;
        db.write(batch)?;
        Ok(Some(claimed))
    }

    fn update(&self, task_id: &str, apply: TaskMutation<'_>) -> Result<Task, QueueError> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let previous =
            read_task(&db, task_id)?.ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
        let mut updated = previous.clone();
        apply(&mut updated)?;

        let mut batch = WriteBatch::default();
        stage_write(&db, &mut batch, Some(&previous), &updated)?;
        db.write(batch).map_err(StoreError::from)?;
        Ok(updated)
    }

    fn scan(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let tasks = cf(&db, schema::CF_TASKS)?;

        let mut out = Vec::new();
        for item in db.iterator_cf(tasks, IteratorMode::Start) {
            let (_, value) = item?;
            let task = decode(&value)?;
            if status.map_or(true, |s| task.status == s) {
                out.push(task);
            }
        }
        Ok(out)
    }

    fn remove(&self, task_id: &str) -> StoreResult<bool> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let Some(task) = read_task(&db, task_id)? else {
            return Ok(false);
        };
        let tasks = cf(&db, schema::CF_TASKS)?;
        let pending = cf(&db, schema::CF_PENDING)?;

        let mut batch = WriteBatch::default();
        if task.status == TaskStatus::Pending {
            batch.delete_cf(pending, keys::pending(&task.order_key(), &task.id).as_bytes());
        }
        batch.delete_cf(tasks, keys::task(task_id).as_bytes());
        db.write(batch)?;
        Ok(true)
    }

    fn next_sequence(&self) -> StoreResult<u64> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let meta = cf(&db, schema::CF_META)?;

        let current = match db.get_cf(meta, keys::SEQUENCE.as_bytes())? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| StoreError::Deserialization("corrupt sequence counter".into()))?,
            None => 0,
        };
        let next = current + 1;
        db.put_cf(meta, keys::SEQUENCE.as_bytes(), next.to_string().as_bytes())?;
        Ok(next)
    }

    fn health_check(&self) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let meta = cf(&db, schema::CF_META)?;
        db.get_cf(meta, keys::SEQUENCE.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::Priority;
    use serde_json::Map;
    use tempfile::tempdir;

    fn test_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("tasks.db")).unwrap();
        (store, dir)
    }

    fn task(store: &RocksStore, id: &str, priority: Priority) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            task_type: "generic".to_string(),
            priority,
            status: TaskStatus::Pending,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            assigned_agent: None,
            retry_count: 0,
            max_retries: None,
            last_error: None,
            claimed_by: None,
            heartbeat_at: None,
            available_at: None,
            result: None,
            timeout_secs: None,
            correlation_id: None,
            parent_task_id: None,
            finished_at: None,
            seq: store.next_sequence().unwrap(),
        }
    }

    #[test]
    fn test_claim_order() {
        let (store, _dir) = test_store();
        let low = task(&store, "low", Priority::Low);
        let high = task(&store, "high", Priority::High);
        store.insert(&low).unwrap();
        store.insert(&high).unwrap();

        assert_eq!(store.claim_next("w", Utc::now()).unwrap().unwrap().id, "high");
        assert_eq!(store.claim_next("w", Utc::now()).unwrap().unwrap().id, "low");
        assert!(store.claim_next("w", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let store = RocksStore::open(&path).unwrap();
            let t = task(&store, "persisted", Priority::Medium);
            store.insert(&t).unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.next_sequence().unwrap(), 2);
        let claimed = store.claim_next("w", Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, "persisted");
        assert_eq!(claimed.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_update_back_to_pending_reindexes() {
        let (store, _dir) = test_store();
        let t = task(&store, "t1", Priority::High);
        store.insert(&t).unwrap();
        store.claim_next("w", Utc::now()).unwrap().unwrap();

        store
            .update("t1", &mut |t: &mut Task| {
                t.status = TaskStatus::Pending;
                t.claimed_by = None;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.claim_next("w2", Utc::now()).unwrap().unwrap().id, "t1");
    }

    #[test]
    fn test_scan_and_remove() {
        let (store, _dir) = test_store();
        for id in ["a", "b", "c"] {
            let t = task(&store, id, Priority::Low);
            store.insert(&t).unwrap();
        }
        store.claim_next("w", Utc::now()).unwrap();
        assert_eq!(store.scan(None).unwrap().len(), 3);
        assert_eq!(store.scan(Some(TaskStatus::Pending)).unwrap().len(), 2);

        assert!(store.remove("b").unwrap());
        assert!(!store.remove("b").unwrap());
        assert_eq!(store.scan(None).unwrap().len(), 2);
    }
}
