//! Event records, stable topic names and topic patterns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Unique identifier for events
pub type EventId = String;

/// Stable topic names, `<entity>.<transition>`.
pub mod topics {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_REQUEUED: &str = "task.requeued";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RECLAIMED: &str = "task.reclaimed";
    pub const TASK_PURGED: &str = "task.purged";
    /// Work may be available; idle workers wake up on this.
    pub const TASK_AVAILABLE: &str = "task.available";

    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";

    pub const DEBATE_STARTED: &str = "debate.started";
    pub const DEBATE_ROUND_COMPLETED: &str = "debate.round_completed";
    pub const DEBATE_CONSENSUS_REACHED: &str = "debate.consensus_reached";
    pub const DEBATE_ROUNDS_EXHAUSTED: &str = "debate.rounds_exhausted";
    pub const DEBATE_SYNTHESIZED: &str = "debate.synthesized";

    pub const SERVICE_DEGRADED: &str = "service.degraded";
    pub const SERVICE_RECOVERED: &str = "service.recovered";
}

/// A published event. Fire-and-forget: nothing acknowledges delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Component that published the event (`queue`, `orchestrator`, ...).
    pub origin: String,
    /// Task or debate id the event belongs to.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Event {
    /// Create an event stamped now
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Self::new_id(),
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            origin: "unknown".to_string(),
            correlation_id: None,
        }
    }

    /// Generate a new unique event ID
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Set the publishing component
    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Attach a correlation id
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Entity part of the topic (`task` for `task.completed`)
    pub fn entity(&self) -> &str {
        self.topic.split('.').next().unwrap_or_default()
    }
}

/// Topic selector used by subscriptions and history queries.
///
/// * `*` matches every topic
/// * a pattern containing `*` segments (`task.*`, `*.completed`) matches
///   topics with the same number of segments where every non-wildcard
///   segment is equal
/// * anything else matches exactly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicPattern {
    All,
    Exact(String),
    Segments(Vec<Option<String>>),
}

impl TopicPattern {
    /// Parse a pattern string
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Self::All;
        }
        if !pattern.split('.').any(|s| s == "*") {
            return Self::Exact(pattern.to_string());
        }
        Self::Segments(
            pattern
                .split('.')
                .map(|s| if s == "*" { None } else { Some(s.to_string()) })
                .collect(),
        )
    }

    /// Check whether `topic` is selected by this pattern
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == topic,
            Self::Segments(segments) => {
                let parts: Vec<&str> = topic.split('.').collect();
                parts.len() == segments.len()
                    && segments
                        .iter()
                        .zip(parts)
                        .all(|(want, got)| want.as_deref().map_or(true, |w| w == got))
            }
        }
    }
}

impl FromStr for TopicPattern {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for TopicPattern {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Exact(topic) => write!(f, "{}", topic),
            Self::Segments(segments) => {
                let rendered: Vec<&str> = segments
                    .iter()
                    .map(|s| s.as_deref().unwrap_or("*"))
                    .collect();
                write!(f, "{}", rendered.join("."))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        let all = TopicPattern::parse("*");
        assert!(all.matches("task.created"));
        assert!(all.matches("anything"));

        let exact = TopicPattern::parse("task.completed");
        assert!(exact.matches("task.completed"));
        assert!(!exact.matches("task.completed.extra"));
        assert!(!exact.matches("task.failed"));

        let entity = TopicPattern::parse("task.*");
        assert!(entity.matches("task.created"));
        assert!(entity.matches("task.purged"));
        assert!(!entity.matches("step.completed"));
        assert!(!entity.matches("task"));

        let transition = TopicPattern::parse("*.completed");
        assert!(transition.matches("task.completed"));
        assert!(transition.matches("step.completed"));
        assert!(!transition.matches("debate.synthesized"));
    }

    #[test]
    fn test_pattern_display_round_trip() {
        for raw in ["*", "task.*", "*.completed", "debate.started"] {
            assert_eq!(TopicPattern::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new(topics::TASK_CREATED, json!({"title": "x"}))
            .from_origin("queue")
            .correlated("task-1");
        assert_eq!(event.entity(), "task");
        assert_eq!(event.origin, "queue");
        assert_eq!(event.correlation_id.as_deref(), Some("task-1"));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
