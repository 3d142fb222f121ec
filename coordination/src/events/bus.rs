//! Event bus for task coordination
//!
//! Publishing never blocks and never fails, with or without subscribers.
//! Handler subscriptions each own an unbounded queue fed by `publish`, so a
//! slow handler falls behind without losing events. Each one runs on its own
//! task, so a handler that errors or panics cannot disturb the publisher or
//! any other subscriber. Raw receivers share a bounded broadcast channel and
//! may observe `Lagged`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::history::{EventHistory, EventStats, HistoryQuery, DEFAULT_HISTORY_LIMIT};
use super::types::{Event, TopicPattern};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 1024;

/// Result returned by subscription handlers
pub type HandlerResult = anyhow::Result<()>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Delivery queue of one handler subscription
struct HandlerQueue {
    pattern: TopicPattern,
    sender: mpsc::UnboundedSender<Event>,
}

/// Event bus with broadcast fan-out and a bounded history ring
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    handlers: Mutex<Vec<HandlerQueue>>,
    history: EventHistory,
}

impl EventBus {
    /// Create a new event bus with the default history size
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a bus retaining at most `limit` recent events
    pub fn with_history_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: Mutex::new(Vec::new()),
            history: EventHistory::new(limit),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<HandlerQueue>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: Event) {
        self.history.record(&event);

        // Held across the whole fan-out so every handler queue sees events
        // in publication order.
        let mut handlers = self.handlers();
        handlers.retain(|queue| !queue.sender.is_closed());
        let mut delivered = 0;
        for queue in handlers.iter() {
            if queue.pattern.matches(&event.topic) && queue.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        drop(handlers);

        let topic = event.topic.clone();
        match self.sender.send(event) {
            Ok(count) => debug!(topic = %topic, handlers = delivered, receivers = count, "Event published"),
            Err(_) => debug!(topic = %topic, handlers = delivered, "Event published (no receivers)"),
        }
    }

    /// Invoke `handler` for every future event whose topic matches `pattern`.
    ///
    /// Must be called from within a Tokio runtime. One subscription sees
    /// every matching event in publication order, however slow the handler.
    /// Handler errors and panics are logged and the subscription keeps
    /// running.
    pub fn subscribe<F, Fut>(&self, pattern: impl Into<TopicPattern>, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let pattern = pattern.into();
        let label = pattern.to_string();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.handlers().push(HandlerQueue { pattern, sender });

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_label = label.clone();

        let handle = tokio::spawn(async move {
            let label = task_label;
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                };

                let topic = event.topic.clone();
                let outcome = AssertUnwindSafe(async { handler(event).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(pattern = %label, topic = %topic, error = %e, "Event handler failed")
                    }
                    Err(_) => error!(pattern = %label, topic = %topic, "Event handler panicked"),
                }
            }
            debug!(pattern = %label, "Subscription closed");
        });

        Subscription {
            pattern: label,
            cancel,
            handle,
        }
    }

    /// Subscribe to receive every event
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Get the number of raw receivers plus live handler subscriptions
    pub fn subscriber_count(&self) -> usize {
        let handlers = self
            .handlers()
            .iter()
            .filter(|queue| !queue.sender.is_closed())
            .count();
        self.sender.receiver_count() + handlers
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Query the recent-history ring
    pub fn history(&self, query: &HistoryQuery) -> Vec<Event> {
        self.history.query(query)
    }

    /// Publish counters
    pub fn stats(&self) -> EventStats {
        self.history.stats()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running handler subscription.
///
/// Dropping the handle leaves the subscription running; call
/// [`Subscription::unsubscribe`] to stop it.
pub struct Subscription {
    pattern: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Pattern this subscription listens on
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the subscription task is still running
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop delivering events and wait for the subscription task to exit
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(pattern = %self.pattern, error = %e, "Subscription task ended abnormally");
        }
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by topic pattern
    pub pattern: Option<TopicPattern>,
    /// Filter by correlation id (task or debate id)
    pub correlation_id: Option<String>,
    /// Filter by publishing component
    pub origin: Option<String>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
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

    /// Filter by origin component
    pub fn origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref pattern) = self.pattern {
            if !pattern.matches(&event.topic) {
                return false;
            }
        }

        if let Some(ref cid) = self.correlation_id {
            if event.correlation_id.as_deref() != Some(cid.as_str()) {
                return false;
            }
        }

        if let Some(ref origin) = self.origin {
            if &event.origin != origin {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<Event>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe_raw(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe_raw(), filter)
    }
}
