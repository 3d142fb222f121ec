//! RocksDB task store tests: queue state survives a reopen.
//!
//! Only built with `--features durable`.

#![cfg(feature = "durable")]

use foundry_coordination::queue::{
    NewTask, Priority, QueueConfig, RocksStore, TaskQueue, TaskStatus,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> TaskQueue {
    TaskQueue::new(
        RocksStore::open(dir.path()).unwrap().shared(),
        QueueConfig::default(),
    )
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let (low, high, claimed) = {
        let queue = open(&dir);
        let claimed = queue
            .enqueue(NewTask::new("claimed", Priority::Critical))
            .unwrap();
        let low = queue.enqueue(NewTask::new("low", Priority::Low)).unwrap();
        let high = queue.enqueue(NewTask::new("high", Priority::High)).unwrap();
        assert_eq!(queue.dequeue("w1").unwrap().unwrap().id, claimed);
        (low, high, claimed)
    };

    let queue = open(&dir);
    let task = queue.get(&claimed).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.claimed_by.as_deref(), Some("w1"));

    assert_eq!(queue.dequeue("w2").unwrap().unwrap().id, high);
    assert_eq!(queue.dequeue("w2").unwrap().unwrap().id, low);
    assert!(queue.dequeue("w2").unwrap().is_none());
}

#[test]
fn test_sequence_continues_after_reopen() {
    let dir = TempDir::new().unwrap();
    let first = {
        let queue = open(&dir);
        let id = queue.enqueue(NewTask::new("a", Priority::Medium)).unwrap();
        queue.get(&id).unwrap().seq
    };

    let queue = open(&dir);
    let id = queue.enqueue(NewTask::new("b", Priority::Medium)).unwrap();
    assert!(queue.get(&id).unwrap().seq > first);
}

#[test]
fn test_terminal_tasks_leave_pending_index() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir);
    let id = queue.enqueue(NewTask::new("a", Priority::Medium)).unwrap();
    queue.cancel(&id, "not needed").unwrap();
    assert!(queue.dequeue("w").unwrap().is_none());

    let stats = queue.stats().unwrap();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.pending, 0);
}
