//! Bounded in-memory event history
//!
//! Keeps the most recent events for inspection and debugging. This is not
//! durable: task state lives in the queue's store, never here.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Event, TopicPattern};

/// Default number of events retained
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Query over the retained history
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub pattern: Option<TopicPattern>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Match everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by topic pattern
    pub fn topic(mut self, pattern: &str) -> Self {
        self.pattern = Some(TopicPattern::parse(pattern));
        self
    }

    /// Filter by correlation id
    pub fn correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Only events at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Keep only the newest `limit` matches
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(pattern) = &self.pattern {
            if !pattern.matches(&event.topic) {
                return false;
            }
        }
        if let Some(cid) = &self.correlation_id {
            if event.correlation_id.as_deref() != Some(cid.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Publish counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub total_published: u64,
    pub by_topic: HashMap<String, u64>,
    pub retained: usize,
}

#[derive(Default)]
struct HistoryInner {
    events: VecDeque<Event>,
    stats: EventStats,
}

/// Ring buffer of recent events
pub struct EventHistory {
    inner: Mutex<HistoryInner>,
    limit: usize,
}

impl EventHistory {
    /// Create a history retaining at most `limit` events
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::default()),
            limit,
        }
    }

    /// Record a published event, evicting the oldest when full
    pub fn record(&self, event: &Event) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.stats.total_published += 1;
        *inner.stats.by_topic.entry(event.topic.clone()).or_insert(0) += 1;

        if self.limit == 0 {
            return;
        }
        while inner.events.len() >= self.limit {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
    }

    /// Matching events, oldest first
    pub fn query(&self, query: &HistoryQuery) -> Vec<Event> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut matched: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    /// Newest `n` events, oldest first
    pub fn recent(&self, n: usize) -> Vec<Event> {
        self.query(&HistoryQuery::new().limit(n))
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.events.len()).unwrap_or(0)
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of publish counters
    pub fn stats(&self) -> EventStats {
        match self.inner.lock() {
            Ok(inner) => EventStats {
                retained: inner.events.len(),
                ..inner.stats.clone()
            },
            Err(_) => EventStats::default(),
        }
    }

    /// Drop all retained events (counters are kept)
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.events.clear();
        }
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
