use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Shorthand for the opaque string-keyed maps carried in message content,
/// envelope data and workflow context.
pub type ContentMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Broadcast,
    Direct,
    Request,
    Response,
    Event,
    Command,
}

/// A message travelling over the bus. Immutable once published; the topic
/// field is always stamped by the publish call, never trusted from the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub source: String,
    pub target: Option<String>,
    pub topic: String,
    pub content: ContentMap,
    /// Carried for compatibility; delivery order does not consult it.
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(kind: MessageKind, source: impl Into<String>, content: ContentMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            target: None,
            topic: String::new(),
            content,
            priority: 0,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn to_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Predicate applied to a message before a subscription's handler runs.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Handler invoked for each message delivered to a subscription.
///
/// A returned error is caught by the bus, logged and counted; it never
/// aborts delivery to sibling subscribers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
