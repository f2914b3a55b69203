//! Per-agent communication protocol over the message bus
//!
//! Information Hiding:
//! - Envelope wrapping/unwrapping internalized
//! - Reply routing (pending-slot resolve vs direct send) hidden
//! - Handler dispatch table encapsulated

mod envelope;

pub use envelope::{
    MessageType, ProtocolHeader, ProtocolMessage, ProtocolPayload, ProtocolResponse, StatusCode,
};

use crate::bus::{handler_fn, ContentMap, Message, MessageBus, MessageKind};
use crate::config::ProtocolConfig;
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Topic every started protocol listens on, in addition to its own agent
/// id topic.
pub const BROADCAST_TOPIC: &str = "agent.broadcast";

/// Handler for one inbound message type. Returning an envelope sends it
/// back as the reply; returning None ends processing. An error is caught
/// and answered with an INTERNAL_ERROR response so the requester is never
/// left waiting out its timeout.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn handle(&self, message: ProtocolMessage) -> anyhow::Result<Option<ProtocolMessage>>;
}

struct FnProtocolHandler<F>(F);

#[async_trait]
impl<F, Fut> ProtocolHandler for FnProtocolHandler<F>
where
    F: Fn(ProtocolMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<ProtocolMessage>>> + Send + 'static,
{
    async fn handle(&self, message: ProtocolMessage) -> anyhow::Result<Option<ProtocolMessage>> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`ProtocolHandler`].
pub fn protocol_fn<F, Fut>(f: F) -> Arc<dyn ProtocolHandler>
where
    F: Fn(ProtocolMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<ProtocolMessage>>> + Send + 'static,
{
    Arc::new(FnProtocolHandler(f))
}

/// Snapshot of protocol counters.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolStats {
    pub running: bool,
    pub sent: u64,
    pub received: u64,
    pub requests: u64,
}

/// Structured messaging facade for one agent.
///
/// Wraps raw bus messages in the protocol envelope, dispatches inbound
/// envelopes through a table keyed by [`MessageType`], and offers a
/// request call with timeout/not-found/latency semantics.
pub struct CommunicationProtocol {
    me: Weak<Self>,
    agent_id: String,
    version: String,
    default_timeout: Duration,
    bus: Arc<MessageBus>,
    running: AtomicBool,
    handlers: RwLock<HashMap<MessageType, Arc<dyn ProtocolHandler>>>,
    subscriptions: Mutex<Vec<Uuid>>,
    sent: AtomicU64,
    received: AtomicU64,
    requests: AtomicU64,
}

impl CommunicationProtocol {
    pub fn new(agent_id: impl Into<String>, bus: Arc<MessageBus>) -> Arc<Self> {
        Self::with_config(agent_id, bus, ProtocolConfig::default())
    }

    pub fn with_config(
        agent_id: impl Into<String>,
        bus: Arc<MessageBus>,
        config: ProtocolConfig,
    ) -> Arc<Self> {
        let agent_id = agent_id.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            agent_id,
            version: config.version,
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            bus,
            running: AtomicBool::new(false),
            handlers: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe this agent's own-id topic and the shared broadcast topic,
    /// then gate send/broadcast/request open.
    ///
    /// Callers that manage their own subscriptions (the lifecycle manager
    /// does) use [`activate`](Self::activate) instead.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(agent = %self.agent_id, "protocol already running");
            return;
        }

        let inbound = {
            let weak = self.me.clone();
            handler_fn(move |message| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(protocol) => protocol.dispatch(message).await,
                        None => Ok(()),
                    }
                }
            })
        };

        let own = self
            .bus
            .subscribe(&self.agent_id, &self.agent_id, Arc::clone(&inbound), None);
        let broadcast = self
            .bus
            .subscribe(&self.agent_id, BROADCAST_TOPIC, inbound, None);

        self.subscriptions.lock().extend([own, broadcast]);
        tracing::info!(agent = %self.agent_id, "protocol started");
    }

    /// Open the send/broadcast/request gate without subscribing anything.
    pub fn activate(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Unsubscribe everything this protocol registered and close the gate.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<Uuid> = self.subscriptions.lock().drain(..).collect();
        for id in ids {
            self.bus.unsubscribe(id);
        }
        tracing::info!(agent = %self.agent_id, "protocol stopped");
    }

    /// Register the handler for one message type, replacing any previous
    /// registration for that type.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.write().insert(message_type, handler);
    }

    /// Wrap a fresh envelope (no correlation id) and direct-send it.
    /// Returns whether at least one subscription of the target saw it.
    pub async fn send(
        &self,
        target: &str,
        message_type: MessageType,
        data: ContentMap,
        metadata: ContentMap,
    ) -> bool {
        if !self.is_running() {
            tracing::warn!(agent = %self.agent_id, "send on stopped protocol dropped");
            return false;
        }

        let envelope = self.envelope(Some(target.to_string()), message_type, data, metadata);
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bus
            .send_direct(target, envelope.to_bus_message(MessageKind::Direct))
            .await
            > 0
    }

    /// Publish an envelope on the broadcast topic; every started agent
    /// receives it. Returns the delivered count.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        data: ContentMap,
        metadata: ContentMap,
    ) -> usize {
        if !self.is_running() {
            tracing::warn!(agent = %self.agent_id, "broadcast on stopped protocol dropped");
            return 0;
        }

        let envelope = self.envelope(None, message_type, data, metadata);
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bus
            .publish(
                BROADCAST_TOPIC,
                envelope.to_bus_message(MessageKind::Broadcast),
            )
            .await
    }

    /// Request/response with a wall-clock budget.
    ///
    /// Classifies the outcome: an unreachable target fails fast with
    /// NOT_FOUND (no waiting), an expired budget yields TIMEOUT, and a
    /// well-formed reply succeeds iff its status is a success code.
    /// Latency is measured around the whole exchange.
    pub async fn request(
        &self,
        target: &str,
        message_type: MessageType,
        data: ContentMap,
        timeout: Duration,
    ) -> ProtocolResponse {
        let start = Instant::now();

        if !self.is_running() {
            return ProtocolResponse::failed(
                StatusCode::Unavailable,
                "protocol is not running",
                start.elapsed(),
            );
        }

        self.requests.fetch_add(1, Ordering::Relaxed);
        self.sent.fetch_add(1, Ordering::Relaxed);

        let envelope = self.envelope(Some(target.to_string()), message_type, data, ContentMap::new());
        let bus_message = envelope.to_bus_message(MessageKind::Request);

        match self.bus.request(target, bus_message, timeout).await {
            Ok(value) => match serde_json::from_value::<ProtocolMessage>(value) {
                Ok(reply) => ProtocolResponse::completed(reply, start.elapsed()),
                Err(e) => ProtocolResponse::failed(
                    StatusCode::InternalError,
                    format!("malformed response: {}", e),
                    start.elapsed(),
                ),
            },
            Err(BusError::Unreachable(target)) => ProtocolResponse::failed(
                StatusCode::NotFound,
                format!("target '{}' is not reachable", target),
                start.elapsed(),
            ),
            Err(BusError::Timeout(budget)) => ProtocolResponse::failed(
                StatusCode::Timeout,
                format!("no response within {:?}", budget),
                start.elapsed(),
            ),
            Err(e) => ProtocolResponse::failed(StatusCode::Unavailable, e.to_string(), start.elapsed()),
        }
    }

    /// Liveness probe: sends PING and expects a SUCCESS response.
    pub async fn ping(&self, target: &str, timeout: Duration) -> ProtocolResponse {
        self.request(target, MessageType::Ping, ContentMap::new(), timeout)
            .await
    }

    pub fn stats(&self) -> ProtocolStats {
        ProtocolStats {
            running: self.is_running(),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }

    /// Entry point for inbound bus messages: envelopes go through the
    /// handler table, anything else is ignored here.
    pub async fn dispatch(&self, message: Message) -> anyhow::Result<()> {
        match ProtocolMessage::from_bus_message(&message) {
            Some(envelope) => self.handle_envelope(envelope).await,
            None => {
                tracing::debug!(
                    agent = %self.agent_id,
                    message_id = %message.id,
                    "ignoring non-envelope message"
                );
                Ok(())
            }
        }
    }

    /// Dispatch one parsed envelope. A handler's returned envelope is
    /// routed back as the reply; a handler error is converted into an
    /// INTERNAL_ERROR response.
    pub async fn handle_envelope(&self, envelope: ProtocolMessage) -> anyhow::Result<()> {
        // Broadcast echoes of our own messages come back through the shared
        // topic; drop them unless explicitly self-addressed.
        if envelope.header.source_agent == self.agent_id
            && envelope.header.target_agent.as_deref() != Some(self.agent_id.as_str())
        {
            return Ok(());
        }

        self.received.fetch_add(1, Ordering::Relaxed);

        let handler = self
            .handlers
            .read()
            .get(&envelope.payload.message_type)
            .cloned();

        let Some(handler) = handler else {
            tracing::debug!(
                agent = %self.agent_id,
                message_type = ?envelope.payload.message_type,
                "no handler for message type"
            );
            return Ok(());
        };

        let request_id = envelope.header.message_id;
        match handler.handle(envelope.clone()).await {
            Ok(Some(reply)) => self.route_reply(request_id, reply).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    agent = %self.agent_id,
                    message_type = ?envelope.payload.message_type,
                    error = %e,
                    "handler failed, replying with internal error"
                );
                let mut data = ContentMap::new();
                data.insert("error".to_string(), json!(e.to_string()));
                let reply = envelope.create_response(StatusCode::InternalError, data);
                self.route_reply(request_id, reply).await;
            }
        }

        Ok(())
    }

    /// Resolve the requester's pending slot if one exists; otherwise fall
    /// back to a plain direct send driven by the reply's target agent.
    async fn route_reply(&self, request_id: Uuid, reply: ProtocolMessage) {
        let correlation_id = reply.header.correlation_id.unwrap_or(request_id);

        let value = match serde_json::to_value(&reply) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(agent = %self.agent_id, error = %e, "could not serialize reply");
                return;
            }
        };

        if self.bus.respond(correlation_id, value) {
            return;
        }

        if let Some(target) = reply.header.target_agent.clone() {
            self.sent.fetch_add(1, Ordering::Relaxed);
            self.bus
                .send_direct(&target, reply.to_bus_message(MessageKind::Response))
                .await;
        }
    }

    fn envelope(
        &self,
        target: Option<String>,
        message_type: MessageType,
        data: ContentMap,
        metadata: ContentMap,
    ) -> ProtocolMessage {
        ProtocolMessage::new(&self.agent_id, target, message_type, data, metadata)
            .with_version(&self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_running() {
        let bus = Arc::new(MessageBus::default());
        let protocol = CommunicationProtocol::new("solo", Arc::clone(&bus));

        assert!(
            !protocol
                .send("anyone", MessageType::Ack, ContentMap::new(), ContentMap::new())
                .await
        );

        let stats = protocol.stats();
        assert!(!stats.running);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn test_start_subscribes_own_and_broadcast_topics() {
        let bus = Arc::new(MessageBus::default());
        let protocol = CommunicationProtocol::new("solo", Arc::clone(&bus));

        protocol.start();

        let mut topics = bus.topics();
        topics.sort();
        assert_eq!(topics, vec![BROADCAST_TOPIC.to_string(), "solo".to_string()]);

        protocol.stop();
        assert!(bus.topics().is_empty());
    }

    #[tokio::test]
    async fn test_own_broadcast_echo_is_dropped() {
        let bus = Arc::new(MessageBus::default());
        let protocol = CommunicationProtocol::new("echo", Arc::clone(&bus));
        protocol.start();

        protocol
            .broadcast(MessageType::AgentHeartbeat, ContentMap::new(), ContentMap::new())
            .await;

        // Delivered to our own broadcast subscription, but filtered before
        // the handler table.
        assert_eq!(protocol.stats().received, 0);
    }
}
