//! Task records, priorities and the task status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use super::error::QueueError;
use crate::error::TaskError;

/// Unique identifier for tasks
pub type TaskId = String;

/// Identifier of a worker claiming tasks
pub type WorkerId = String;

/// Task priority. Lower rank is dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities in dequeue order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Numeric priority score: critical 0 … low 3.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(QueueError::Validation(format!(
                "invalid priority '{}' (expected critical, high, medium or low)",
                other
            ))),
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by an external signal.
    Cancelled,
}

impl TaskStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Cancelled],
            Self::InProgress => &[
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
                Self::Pending,
            ],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Whether `to` is reachable from this status in one step.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Total dequeue order: priority rank, then creation time, then insertion
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderKey {
    pub rank: u8,
    pub created_nanos: i64,
    pub seq: u64,
}

/// A unit of work held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Short title (required).
    pub title: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Task-type tag, e.g. `code_review`.
    pub task_type: String,
    /// Dequeue priority.
    pub priority: Priority,
    /// Current status.
    pub status: TaskStatus,
    /// Free-form metadata. Workflow progress lives here.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Agent role the task targets, if any.
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// Number of requeues so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Per-task retry budget; the queue default applies when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Most recent failure.
    #[serde(default)]
    pub last_error: Option<TaskError>,
    /// Worker currently holding the claim.
    #[serde(default)]
    pub claimed_by: Option<WorkerId>,
    /// Last heartbeat from the claiming worker.
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Earliest time the task may be claimed (retry backoff).
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
    /// Result payload once completed.
    #[serde(default)]
    pub result: Option<Value>,
    /// Per-step time budget in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Correlation id for grouping related tasks.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Parent task, for sub-tasks.
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Insertion sequence number assigned by the store.
    pub seq: u64,
}

impl Task {
    /// Position of this task in dequeue order.
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            rank: self.priority.rank(),
            created_nanos: self.created_at.timestamp_nanos_opt().unwrap_or(0),
            seq: self.seq,
        }
    }

    /// Whether the task may be claimed at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.available_at.map_or(true, |at| at <= now)
    }

    /// Whether `worker_id` currently holds the claim.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == TaskStatus::InProgress && self.claimed_by.as_deref() == Some(worker_id)
    }

    /// Move to `to`, enforcing the state machine.
    pub(crate) fn transition(
        &mut self,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if !self.status.can_transition_to(to) {
            return Err(QueueError::conflict(
                &self.id,
                format!("invalid transition {} -> {}", self.status, to),
            ));
        }
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
            self.claimed_by = None;
            self.heartbeat_at = None;
        }
        Ok(())
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} ({}, retries={}) id={}",
            self.status, self.title, self.priority, self.retry_count, self.id
        )
    }
}

/// A task submission: everything the caller provides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
}

impl NewTask {
    /// Create a submission with the two required fields.
    pub fn new(title: impl Into<String>, priority: Priority) -> Self {
        Self {
            title: title.into(),
            priority: Some(priority),
            ..Default::default()
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the task-type tag.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Target a specific agent role.
    pub fn with_agent(mut self, role: impl Into<String>) -> Self {
        self.assigned_agent = Some(role.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set a per-step timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<Priority, QueueError> {
        if self.title.trim().is_empty() {
            return Err(QueueError::Validation("title is required".to_string()));
        }
        let priority = self
            .priority
            .ok_or_else(|| QueueError::Validation("priority is required".to_string()))?;
        if let Some(task_type) = &self.task_type {
            if task_type.trim().is_empty() {
                return Err(QueueError::Validation(
                    "task_type must not be blank".to_string(),
                ));
            }
        }
        Ok(priority)
    }
}

/// Untyped submission record, as received from an external caller.
///
/// Priority arrives as a string so malformed values can be rejected with a
/// validation error instead of a decoding failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type", alias = "task_type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
}

impl TryFrom<TaskSubmission> for NewTask {
    type Error = QueueError;

    fn try_from(sub: TaskSubmission) -> Result<Self, Self::Error> {
        let priority = match sub.priority {
            Some(raw) => Some(raw.parse::<Priority>()?),
            None => None,
        };
        let task = NewTask {
            title: sub.title.unwrap_or_default(),
            description: sub.description.unwrap_or_default(),
            task_type: sub.task_type,
            priority,
            metadata: sub.metadata,
            assigned_agent: sub.assigned_agent,
            ..Default::default()
        };
        task.validate()?;
        Ok(task)
    }
}

/// Outcome of a requeue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequeueOutcome {
    /// Back to pending, claimable from `available_at`.
    Requeued {
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the task is now failed.
    Exhausted { retry_count: u32 },
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    /// Total tasks tracked.
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_and_parse() {
        assert_eq!(Priority::Critical.rank(), 0);
        assert_eq!(Priority::Low.rank(), 3);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" medium ".parse::<Priority>().unwrap(), Priority::Medium);
        assert!(matches!(
            "urgent".parse::<Priority>(),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Pending));
        assert!(InProgress.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::new("Add caching layer", Priority::High)
            .validate()
            .is_ok());
        assert!(NewTask::new("   ", Priority::High).validate().is_err());

        let missing_priority = NewTask {
            title: "No priority".to_string(),
            ..Default::default()
        };
        assert_eq!(
            missing_priority.validate(),
            Err(QueueError::Validation("priority is required".to_string()))
        );
    }

    #[test]
    fn test_submission_rejects_bad_priority() {
        let sub: TaskSubmission = serde_json::from_value(serde_json::json!({
            "title": "Refactor parser",
            "type": "refactoring",
            "priority": "asap"
        }))
        .unwrap();
        let err = NewTask::try_from(sub).unwrap_err();
        assert!(matches!(err, QueueError::Validation(msg) if msg.contains("asap")));
    }

    #[test]
    fn test_submission_accepts_valid_record() {
        let sub: TaskSubmission = serde_json::from_value(serde_json::json!({
            "title": "Add caching layer",
            "priority": "high",
            "metadata": {"ticket": 42}
        }))
        .unwrap();
        let task = NewTask::try_from(sub).unwrap();
        assert_eq!(task.priority, Some(Priority::High));
        assert_eq!(task.metadata["ticket"], 42);
    }

    #[test]
    fn test_order_key_ordering() {
        let a = OrderKey {
            rank: 1,
            created_nanos: 10,
            seq: 5,
        };
        let b = OrderKey {
            rank: 1,
            created_nanos: 10,
            seq: 6,
        };
        let c = OrderKey {
            rank: 0,
            created_nanos: 99,
            seq: 7,
        };
        let mut keys = vec![b, a, c];
        keys.sort();
        assert_eq!(keys, vec![c, a, b]);
    }
}
