//! Column family and key layout for the RocksDB task store
//!
//! Each column family provides logical separation of data types
//! while sharing the same RocksDB instance.

/// Column family for task records
pub const CF_TASKS: &str = "tasks";

/// Column family for the priority-ordered pending index
pub const CF_PENDING: &str = "pending";

/// Column family for store bookkeeping (sequence counter)
pub const CF_META: &str = "meta";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_TASKS, CF_PENDING, CF_META];

/// Key prefixes for compound keys
pub mod keys {
    use crate::queue::types::OrderKey;

    /// Prefix shared by every pending index key
    pub const PENDING_PREFIX: &str = "pending:";

    /// Key of the sequence counter in the meta column family
    pub const SEQUENCE: &str = "meta:seq";

    /// Create a task key
    pub fn task(task_id: &str) -> String {
        format!("task:{}", task_id)
    }

    /// Create a pending index key.
    ///
    /// Fixed-width numeric fields make lexicographic order equal dequeue
    /// order: rank, then creation time, then insertion sequence.
    pub fn pending(order: &OrderKey, task_id: &str) -> String {
        format!(
            "{}{}:{:020}:{:020}:{}",
            PENDING_PREFIX,
            order.rank,
            order.created_nanos.max(0),
            order.seq,
            task_id
        )
    }

    /// Parse the task id back out of a pending index key
    pub fn parse_pending_task_id(key: &str) -> Option<&str> {
        let rest = key.strip_prefix(PENDING_PREFIX)?;
        let mut parts = rest.splitn(4, ':');
        let _rank = parts.next()?;
        let _created = parts.next()?;
        let _seq = parts.next()?;
        parts.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::OrderKey;

    fn order(rank: u8, created_nanos: i64, seq: u64) -> OrderKey {
        OrderKey {
            rank,
            created_nanos,
            seq,
        }
    }

    #[test]
    fn test_key_generation() {
        assert_eq!(keys::task("abc123"), "task:abc123");
        assert_eq!(
            keys::pending(&order(1, 42, 7), "t-1"),
            "pending:1:00000000000000000042:00000000000000000007:t-1"
        );
    }

    #[test]
    fn test_pending_key_ordering() {
        let critical_late = keys::pending(&order(0, 2_000_000_000, 9), "b");
        let high_early = keys::pending(&order(1, 1_000_000_000, 1), "a");
        let high_early_later_seq = keys::pending(&order(1, 1_000_000_000, 2), "c");
        let high_late = keys::pending(&order(1, 3_000_000_000, 3), "d");

        let mut all = vec![
            high_late.clone(),
            high_early_later_seq.clone(),
            critical_late.clone(),
            high_early.clone(),
        ];
        all.sort();
        assert_eq!(
            all,
            vec![critical_late, high_early, high_early_later_seq, high_late]
        );
    }

    #[test]
    fn test_parse_pending_task_id() {
        let key = keys::pending(&order(3, 5, 6), "task-with-uuid");
        assert_eq!(keys::parse_pending_task_id(&key), Some("task-with-uuid"));
        assert_eq!(keys::parse_pending_task_id("task:abc"), None);
    }
}
