//! Agent lifecycle manager
//!
//! Information Hiding:
//! - Transition bookkeeping and operation log internalized
//! - Default protocol handlers (ping, status, heartbeat) wired invisibly
//! - Hook failures converted to the error state, never propagated
//!
//! Every lifecycle operation returns a success boolean; an invalid source
//! state logs a warning and returns false, a hook failure moves the agent
//! to the error state and returns false. Nothing here panics or raises.

mod state;

pub use state::{AgentState, OperationLog, OperationLogEntry, WorkState};

use crate::bus::{handler_fn, ContentMap, Message, MessageBus};
use crate::config::{AgentConfig, ProtocolConfig};
use crate::protocol::{
    CommunicationProtocol, MessageType, ProtocolHandler, ProtocolMessage, StatusCode,
    BROADCAST_TOPIC,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Domain callbacks run inside lifecycle transitions and message dispatch.
/// All methods default to no-ops; trivial agents implement nothing.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for inbound bus messages that do not carry the protocol
    /// envelope shape.
    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        let _ = message;
        Ok(())
    }
}

/// Hooks implementation that does nothing; useful for tests and agents
/// whose behavior lives entirely in protocol handlers.
pub struct NoopHooks;

#[async_trait]
impl AgentHooks for NoopHooks {}

struct AgentShared {
    agent_id: String,
    agent_type: String,
    states: Mutex<(AgentState, WorkState)>,
    last_activity: Mutex<DateTime<Utc>>,
    log: Mutex<OperationLog>,
}

/// Per-agent state machine wrapping a protocol instance and the bus.
///
/// created → initializing → ready → running ⇄ paused → stopping → stopped,
/// with error reachable from any transition's failure. Concurrent
/// lifecycle calls serialize on a per-agent lock.
pub struct ManagedAgent {
    me: Weak<Self>,
    bus: Arc<MessageBus>,
    hooks: Arc<dyn AgentHooks>,
    protocol_config: ProtocolConfig,
    stale_after: ChronoDuration,
    shared: Arc<AgentShared>,
    /// Serializes initialize/start/pause/resume/stop.
    gate: tokio::sync::Mutex<()>,
    protocol: Mutex<Option<Arc<CommunicationProtocol>>>,
    subscriptions: Mutex<Vec<Uuid>>,
}

impl ManagedAgent {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        bus: Arc<MessageBus>,
        hooks: Arc<dyn AgentHooks>,
    ) -> Arc<Self> {
        Self::with_config(
            agent_id,
            agent_type,
            bus,
            hooks,
            AgentConfig::default(),
            ProtocolConfig::default(),
        )
    }

    pub fn with_config(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        bus: Arc<MessageBus>,
        hooks: Arc<dyn AgentHooks>,
        agent_config: AgentConfig,
        protocol_config: ProtocolConfig,
    ) -> Arc<Self> {
        let agent_id = agent_id.into();
        let agent_type = agent_type.into();

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            hooks,
            protocol_config,
            stale_after: ChronoDuration::milliseconds(agent_config.stale_after_ms as i64),
            shared: Arc::new(AgentShared {
                agent_id,
                agent_type,
                states: Mutex::new((AgentState::Created, WorkState::Offline)),
                last_activity: Mutex::new(Utc::now()),
                log: Mutex::new(OperationLog::new(agent_config.operation_log_capacity)),
            }),
            gate: tokio::sync::Mutex::new(()),
            protocol: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.shared.agent_type
    }

    pub fn lifecycle_state(&self) -> AgentState {
        self.shared.states.lock().0
    }

    pub fn work_state(&self) -> WorkState {
        self.shared.states.lock().1
    }

    /// The protocol instance wired by initialize(), for domain code that
    /// wants to send or register additional handlers.
    pub fn protocol(&self) -> Option<Arc<CommunicationProtocol>> {
        self.protocol.lock().clone()
    }

    pub fn operation_log(&self) -> Vec<OperationLogEntry> {
        self.shared.log.lock().entries()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.shared.last_activity.lock()
    }

    /// Whether the agent has gone quiet past the configured idle window.
    pub fn is_stale(&self) -> bool {
        Utc::now().signed_duration_since(self.last_activity()) > self.stale_after
    }

    /// created → initializing → ready. Wires a fresh protocol with the
    /// default handlers (ping, status query, heartbeat).
    pub async fn initialize(&self) -> bool {
        let _gate = self.gate.lock().await;

        if !self.expect_state("initialize", AgentState::Created) {
            return false;
        }
        self.transition("initialize", AgentState::Initializing, None);

        let protocol = CommunicationProtocol::with_config(
            &self.shared.agent_id,
            Arc::clone(&self.bus),
            self.protocol_config.clone(),
        );
        protocol.register_handler(MessageType::Ping, Arc::new(PingHandler));
        protocol.register_handler(
            MessageType::AgentStatus,
            Arc::new(StatusHandler {
                shared: Arc::clone(&self.shared),
            }),
        );
        protocol.register_handler(
            MessageType::AgentHeartbeat,
            Arc::new(HeartbeatHandler {
                shared: Arc::clone(&self.shared),
            }),
        );
        *self.protocol.lock() = Some(protocol);

        if let Err(e) = self.hooks.on_initialize().await {
            return self.hook_failed("initialize", e);
        }

        self.transition("initialize", AgentState::Ready, None);
        true
    }

    /// ready → running. Opens the protocol gate and subscribes the three
    /// standing topics: own id, broadcast, and the agent-type topic.
    pub async fn start(&self) -> bool {
        let _gate = self.gate.lock().await;

        if !self.expect_state("start", AgentState::Ready) {
            return false;
        }

        let Some(protocol) = self.protocol.lock().clone() else {
            return self.hook_failed("start", anyhow::anyhow!("protocol not initialized"));
        };
        protocol.activate();

        let inbound = {
            let weak = self.me.clone();
            handler_fn(move |message| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(agent) => agent.handle_inbound(message).await,
                        None => Ok(()),
                    }
                }
            })
        };

        let agent_id = self.shared.agent_id.clone();
        let type_topic = format!("agent.type.{}", self.shared.agent_type);
        let ids = [
            self.bus
                .subscribe(&agent_id, &agent_id, Arc::clone(&inbound), None),
            self.bus
                .subscribe(&agent_id, BROADCAST_TOPIC, Arc::clone(&inbound), None),
            self.bus.subscribe(&agent_id, &type_topic, inbound, None),
        ];
        self.subscriptions.lock().extend(ids);

        if let Err(e) = self.hooks.on_start().await {
            self.unwind_subscriptions();
            protocol.stop();
            return self.hook_failed("start", e);
        }

        self.transition("start", AgentState::Running, Some(WorkState::Idle));
        true
    }

    /// running → paused.
    pub async fn pause(&self) -> bool {
        let _gate = self.gate.lock().await;

        if !self.expect_state("pause", AgentState::Running) {
            return false;
        }
        self.transition("pause", AgentState::Paused, Some(WorkState::Offline));
        true
    }

    /// paused → running.
    pub async fn resume(&self) -> bool {
        let _gate = self.gate.lock().await;

        if !self.expect_state("resume", AgentState::Paused) {
            return false;
        }
        self.transition("resume", AgentState::Running, Some(WorkState::Idle));
        true
    }

    /// running/paused (or ready) → stopping → stopped. Unwinds the
    /// standing subscriptions and the protocol. Idempotent: stopping a
    /// stopped agent succeeds without re-running hooks.
    pub async fn stop(&self) -> bool {
        let _gate = self.gate.lock().await;

        let current = self.lifecycle_state();
        if current == AgentState::Stopped {
            return true;
        }
        if !matches!(
            current,
            AgentState::Ready | AgentState::Running | AgentState::Paused
        ) {
            return self.reject("stop", current);
        }

        self.transition("stop", AgentState::Stopping, Some(WorkState::Offline));

        self.unwind_subscriptions();
        if let Some(protocol) = self.protocol.lock().clone() {
            protocol.stop();
        }

        if let Err(e) = self.hooks.on_stop().await {
            return self.hook_failed("stop", e);
        }

        self.transition("stop", AgentState::Stopped, Some(WorkState::Offline));
        true
    }

    /// Change the momentary work state; valid only while running.
    pub fn update_work_state(&self, work_state: WorkState) -> bool {
        let mut states = self.shared.states.lock();
        if states.0 != AgentState::Running {
            tracing::warn!(
                agent = %self.shared.agent_id,
                lifecycle = %states.0,
                requested = %work_state,
                "work state change rejected, agent is not running"
            );
            return false;
        }
        states.1 = work_state;
        true
    }

    /// Entry point for the three standing subscriptions. Envelope-shaped
    /// messages dispatch through the protocol handler table, everything
    /// else goes to the generic message hook; either way the last-activity
    /// timestamp is refreshed and the outcome is logged.
    async fn handle_inbound(&self, message: Message) -> anyhow::Result<()> {
        *self.shared.last_activity.lock() = Utc::now();

        let (operation, result) = match ProtocolMessage::from_bus_message(&message) {
            Some(envelope) => {
                let operation = format!("message:{:?}", envelope.payload.message_type);
                let protocol = self.protocol.lock().clone();
                let result = match protocol {
                    Some(protocol) => protocol.handle_envelope(envelope).await,
                    None => Ok(()),
                };
                (operation, result)
            }
            None => (
                "message:raw".to_string(),
                self.hooks.on_message(message).await,
            ),
        };
        let state = self.lifecycle_state();
        match result {
            Ok(()) => {
                self.record(&operation, state, state, true, None);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    agent = %self.shared.agent_id,
                    %operation,
                    error = %e,
                    "message dispatch failed"
                );
                self.record(&operation, state, state, false, Some(e.to_string()));
                Ok(())
            }
        }
    }

    fn unwind_subscriptions(&self) {
        let ids: Vec<Uuid> = self.subscriptions.lock().drain(..).collect();
        for id in ids {
            self.bus.unsubscribe(id);
        }
    }

    fn expect_state(&self, operation: &str, expected: AgentState) -> bool {
        let current = self.lifecycle_state();
        if current == expected {
            return true;
        }
        self.reject(operation, current);
        false
    }

    fn reject(&self, operation: &str, current: AgentState) -> bool {
        tracing::warn!(
            agent = %self.shared.agent_id,
            %operation,
            state = %current,
            "lifecycle operation rejected in current state"
        );
        self.record(
            operation,
            current,
            current,
            false,
            Some(format!("invalid in state '{}'", current)),
        );
        false
    }

    fn transition(&self, operation: &str, to: AgentState, work: Option<WorkState>) {
        let from = {
            let mut states = self.shared.states.lock();
            let from = states.0;
            states.0 = to;
            if let Some(work) = work {
                states.1 = work;
            }
            from
        };
        tracing::info!(
            agent = %self.shared.agent_id,
            %operation,
            from = %from,
            to = %to,
            "lifecycle transition"
        );
        self.record(operation, from, to, true, None);
    }

    fn hook_failed(&self, operation: &str, error: anyhow::Error) -> bool {
        let from = {
            let mut states = self.shared.states.lock();
            let from = states.0;
            states.0 = AgentState::Error;
            states.1 = WorkState::Error;
            from
        };
        tracing::warn!(
            agent = %self.shared.agent_id,
            %operation,
            error = %error,
            "transition hook failed, agent moved to error state"
        );
        self.record(
            operation,
            from,
            AgentState::Error,
            false,
            Some(error.to_string()),
        );
        false
    }

    fn record(
        &self,
        operation: &str,
        from: AgentState,
        to: AgentState,
        success: bool,
        error: Option<String>,
    ) {
        self.shared.log.lock().record(OperationLogEntry {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            from_state: from,
            to_state: to,
            success,
            error,
        });
    }
}

struct PingHandler;

#[async_trait]
impl ProtocolHandler for PingHandler {
    async fn handle(&self, message: ProtocolMessage) -> anyhow::Result<Option<ProtocolMessage>> {
        let mut data = ContentMap::new();
        data.insert("pong".to_string(), json!(true));
        let mut reply = message.create_response(StatusCode::Success, data);
        reply.payload.message_type = MessageType::Pong;
        Ok(Some(reply))
    }
}

struct StatusHandler {
    shared: Arc<AgentShared>,
}

#[async_trait]
impl ProtocolHandler for StatusHandler {
    async fn handle(&self, message: ProtocolMessage) -> anyhow::Result<Option<ProtocolMessage>> {
        let (lifecycle, work) = *self.shared.states.lock();
        let mut data = ContentMap::new();
        data.insert("agent_id".to_string(), json!(self.shared.agent_id));
        data.insert("agent_type".to_string(), json!(self.shared.agent_type));
        data.insert("lifecycle_state".to_string(), json!(lifecycle));
        data.insert("work_state".to_string(), json!(work));
        data.insert(
            "last_activity".to_string(),
            json!(self.shared.last_activity.lock().to_rfc3339()),
        );
        Ok(Some(message.create_response(StatusCode::Success, data)))
    }
}

struct HeartbeatHandler {
    shared: Arc<AgentShared>,
}

#[async_trait]
impl ProtocolHandler for HeartbeatHandler {
    async fn handle(&self, message: ProtocolMessage) -> anyhow::Result<Option<ProtocolMessage>> {
        *self.shared.last_activity.lock() = Utc::now();
        let mut reply = message.create_response(StatusCode::Success, ContentMap::new());
        reply.payload.message_type = MessageType::Ack;
        Ok(Some(reply))
    }
}
