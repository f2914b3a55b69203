//! Agora - in-process coordination kernel for multi-agent systems
//!
//! This library provides the plumbing long-running agents coordinate
//! through: a topic-based message bus with request/response, a typed
//! communication protocol on top of it, a step-based workflow engine with
//! pause/resume, and a per-agent lifecycle state machine.
//!
//! There is no ambient global state: the composition root constructs a
//! [`MessageBus`], shares it via `Arc`, and wires protocols, agents and
//! the [`WorkflowEngine`] explicitly.

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod protocol;
pub mod workflow;

pub use agent::{AgentHooks, AgentState, ManagedAgent, NoopHooks, WorkState};
pub use bus::{handler_fn, ContentMap, Message, MessageBus, MessageKind};
pub use config::Settings;
pub use error::BusError;
pub use protocol::{
    protocol_fn, CommunicationProtocol, MessageType, ProtocolMessage, ProtocolResponse, StatusCode,
    BROADCAST_TOPIC,
};
pub use workflow::{
    task_fn, InstanceStatus, WorkflowDefinition, WorkflowEngine, WorkflowInstance, WorkflowStep,
};
