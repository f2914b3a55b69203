//! In-process message bus - topic pub/sub with request/response
//!
//! Information Hiding:
//! - Subscription table and topic index internalized
//! - Pending-request correlation table hidden behind request()/respond()
//! - Delivery ordering policy encapsulated

mod message;

pub use message::{handler_fn, ContentMap, Message, MessageFilter, MessageHandler, MessageKind};

use crate::config::BusConfig;
use crate::error::BusError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

struct Subscription {
    subscriber: String,
    topic: String,
    handler: Arc<dyn MessageHandler>,
    filter: Option<MessageFilter>,
    deliveries: u64,
}

/// Counters exposed through [`MessageBus::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
    pub dropped_history: u64,
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<Uuid, Subscription>,
    topics: HashMap<String, Vec<Uuid>>,
    pending: HashMap<Uuid, oneshot::Sender<Value>>,
    history: VecDeque<Message>,
    stats: BusStats,
    stopped: bool,
}

/// Topic-based broker shared by every agent in the process.
///
/// All mutable state sits behind one mutex that is taken briefly per call
/// and never held across an await; handlers run on a snapshot taken under
/// the lock.
pub struct MessageBus {
    state: Mutex<BusState>,
    history_capacity: usize,
}

/// Snapshot of one deliverable subscription, taken under the lock.
struct Delivery {
    id: Uuid,
    handler: Arc<dyn MessageHandler>,
    filter: Option<MessageFilter>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            history_capacity: config.history_capacity,
        }
    }

    /// Register a handler for a topic. Independent registrations coexist,
    /// even for the same (subscriber, topic) pair.
    pub fn subscribe(
        &self,
        subscriber: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
    ) -> Uuid {
        let subscriber = subscriber.into();
        let topic = topic.into();
        let id = Uuid::new_v4();

        let mut state = self.state.lock();
        state.subscriptions.insert(
            id,
            Subscription {
                subscriber: subscriber.clone(),
                topic: topic.clone(),
                handler,
                filter,
                deliveries: 0,
            },
        );
        state.topics.entry(topic.clone()).or_default().push(id);

        tracing::debug!(%subscriber, %topic, subscription = %id, "subscribed");
        id
    }

    /// Remove one subscription. Unknown ids are a harmless no-op.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        match state.subscriptions.remove(&id) {
            Some(sub) => {
                detach_from_topic(&mut state, &sub.topic, id);
                tracing::debug!(subscriber = %sub.subscriber, topic = %sub.topic, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription held by a subscriber, across all topics.
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<Uuid> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.subscriber == subscriber)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(sub) = state.subscriptions.remove(id) {
                detach_from_topic(&mut state, &sub.topic, *id);
            }
        }

        if !ids.is_empty() {
            tracing::debug!(%subscriber, removed = ids.len(), "unsubscribed all");
        }
        ids.len()
    }

    /// Publish a message to a topic, returning how many handlers completed
    /// without error.
    ///
    /// The topic on the message is always overwritten with the topic given
    /// here. Subscribers are invoked in ascending order of their own
    /// delivery count, a simple fairness heuristic; `Message::priority` is
    /// carried but does not reorder delivery.
    pub async fn publish(&self, topic: &str, mut message: Message) -> usize {
        message.topic = topic.to_string();

        let targets = {
            let mut state = self.state.lock();
            if state.stopped {
                tracing::warn!(%topic, "publish on stopped bus dropped");
                return 0;
            }
            state.stats.published += 1;

            state.history.push_back(message.clone());
            if state.history.len() > self.history_capacity {
                state.history.pop_front();
                state.stats.dropped_history += 1;
            }

            self.snapshot_for_topic(&state, topic)
        };

        self.deliver(targets, &message).await.1
    }

    /// Publish to every currently known topic. A subscriber listening on N
    /// topics may receive the message N times; deliveries are not
    /// deduplicated.
    pub async fn broadcast(&self, message: Message) -> usize {
        let topics: Vec<String> = {
            let state = self.state.lock();
            if state.stopped {
                return 0;
            }
            state.topics.keys().cloned().collect()
        };

        let mut delivered = 0;
        for topic in topics {
            delivered += self.publish(&topic, message.clone()).await;
        }
        delivered
    }

    /// Deliver to every subscription whose subscriber id matches the
    /// target, across all of that subscriber's topics.
    pub async fn send_direct(&self, target: &str, mut message: Message) -> usize {
        message.topic = target.to_string();
        message.target = Some(target.to_string());

        let targets = {
            let state = self.state.lock();
            if state.stopped {
                return 0;
            }
            self.snapshot_for_subscriber(&state, target)
        };

        self.deliver(targets, &message).await.1
    }

    /// Suspending request/response. The message's own id becomes the
    /// correlation id; the caller parks on a oneshot slot until
    /// [`respond`](Self::respond) resolves it or the timeout elapses.
    ///
    /// An unreachable target fails immediately without waiting. On timeout
    /// the slot is removed, so a late `respond` with the same correlation
    /// id is a no-op.
    pub async fn request(
        &self,
        target: &str,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let correlation_id = message.id;
        message.correlation_id = Some(correlation_id);

        let rx = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(BusError::Stopped);
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(correlation_id, tx);
            rx
        };

        let matched = {
            let state = self.state.lock();
            self.snapshot_for_subscriber(&state, target)
        };

        if matched.is_empty() {
            self.state.lock().pending.remove(&correlation_id);
            return Err(BusError::Unreachable(target.to_string()));
        }

        message.topic = target.to_string();
        message.target = Some(target.to_string());
        self.deliver(matched, &message).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                // Sender dropped without resolving, e.g. the bus stopped.
                self.state.lock().pending.remove(&correlation_id);
                Err(BusError::Cancelled)
            }
            Err(_) => {
                self.state.lock().pending.remove(&correlation_id);
                tracing::debug!(%correlation_id, %target, ?timeout, "request timed out");
                Err(BusError::Timeout(timeout))
            }
        }
    }

    /// Resolve a pending request slot. Returns false when the correlation
    /// id is unknown or already resolved; that case is harmless.
    pub fn respond(&self, correlation_id: Uuid, data: Value) -> bool {
        let sender = self.state.lock().pending.remove(&correlation_id);
        match sender {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Stop the bus: reject further publishes and cancel every outstanding
    /// request wait.
    pub fn stop(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.pending)
        };
        let cancelled = pending.len();
        drop(pending);

        tracing::info!(cancelled, "message bus stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.keys().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Most recent publishes, newest last, at most `limit` entries.
    pub fn history(&self, limit: usize) -> Vec<Message> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        self.state.lock().stats
    }

    fn snapshot_for_topic(&self, state: &BusState, topic: &str) -> Vec<Delivery> {
        let ids = match state.topics.get(topic) {
            Some(ids) => ids.as_slice(),
            None => return Vec::new(),
        };

        let mut entries: Vec<(u64, Delivery)> = ids
            .iter()
            .filter_map(|id| state.subscriptions.get(id).map(|sub| (id, sub)))
            .map(|(id, sub)| {
                (
                    sub.deliveries,
                    Delivery {
                        id: *id,
                        handler: Arc::clone(&sub.handler),
                        filter: sub.filter.clone(),
                    },
                )
            })
            .collect();

        entries.sort_by_key(|(deliveries, _)| *deliveries);
        entries.into_iter().map(|(_, d)| d).collect()
    }

    fn snapshot_for_subscriber(&self, state: &BusState, subscriber: &str) -> Vec<Delivery> {
        let mut entries: Vec<(u64, Delivery)> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.subscriber == subscriber)
            .map(|(id, sub)| {
                (
                    sub.deliveries,
                    Delivery {
                        id: *id,
                        handler: Arc::clone(&sub.handler),
                        filter: sub.filter.clone(),
                    },
                )
            })
            .collect();

        entries.sort_by_key(|(deliveries, _)| *deliveries);
        entries.into_iter().map(|(_, d)| d).collect()
    }

    /// Run each handler to completion, in order, outside the lock. Returns
    /// (handlers invoked, handlers that completed without error).
    async fn deliver(&self, targets: Vec<Delivery>, message: &Message) -> (usize, usize) {
        let mut invoked = Vec::new();
        let mut completed = 0;
        let mut failed = 0;

        for delivery in targets {
            if let Some(filter) = &delivery.filter {
                if !filter(message) {
                    continue;
                }
            }

            invoked.push(delivery.id);
            match delivery.handler.handle(message.clone()).await {
                Ok(()) => completed += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        message_id = %message.id,
                        topic = %message.topic,
                        error = %e,
                        "handler failed during delivery"
                    );
                }
            }
        }

        let mut state = self.state.lock();
        for id in &invoked {
            if let Some(sub) = state.subscriptions.get_mut(id) {
                sub.deliveries += 1;
            }
        }
        state.stats.delivered += completed as u64;
        state.stats.failed_deliveries += failed as u64;

        (invoked.len(), completed)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn detach_from_topic(state: &mut BusState, topic: &str, id: Uuid) {
    if let Some(ids) = state.topics.get_mut(topic) {
        ids.retain(|other| *other != id);
        if ids.is_empty() {
            state.topics.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_counts_successful_handlers() {
        let bus = MessageBus::default();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.subscribe("a", "updates", counting_handler(counter.clone()), None);
        bus.subscribe("b", "updates", counting_handler(counter.clone()), None);

        let delivered = bus
            .publish(
                "updates",
                Message::new(MessageKind::Event, "test", ContentMap::new()),
            )
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_filter_excludes_messages() {
        let bus = MessageBus::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let filter: MessageFilter = Arc::new(|msg: &Message| msg.priority > 3);
        bus.subscribe("a", "updates", counting_handler(counter.clone()), Some(filter));

        let low = Message::new(MessageKind::Event, "test", ContentMap::new());
        let high = Message::new(MessageKind::Event, "test", ContentMap::new()).with_priority(5);

        assert_eq!(bus.publish("updates", low).await, 0);
        assert_eq!(bus.publish("updates", high).await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_noop_on_unknown_id() {
        let bus = MessageBus::default();
        assert!(!bus.unsubscribe(Uuid::new_v4()));
        assert_eq!(bus.unsubscribe_all("ghost"), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = MessageBus::new(BusConfig {
            history_capacity: 3,
        });

        for _ in 0..5 {
            bus.publish(
                "t",
                Message::new(MessageKind::Event, "test", ContentMap::new()),
            )
            .await;
        }

        assert_eq!(bus.history(10).len(), 3);
        assert_eq!(bus.stats().dropped_history, 2);
    }

    #[tokio::test]
    async fn test_respond_without_pending_slot() {
        let bus = MessageBus::default();
        assert!(!bus.respond(Uuid::new_v4(), Value::Null));
    }
}
