use crate::bus::{ContentMap, Message, MessageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Closed message-type enumeration. Extended only by mutual agreement
/// between agent authors; unknown types fail envelope parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Ack,
    Nack,
    AgentRegister,
    AgentUnregister,
    AgentStatus,
    AgentHeartbeat,
    TaskAssign,
    TaskAccept,
    TaskReject,
    TaskProgress,
    TaskComplete,
    TaskFailed,
    DataRequest,
    DataResponse,
    DataSync,
    ConflictReport,
    ConflictResolve,
    WorkflowStart,
    WorkflowStep,
    WorkflowEnd,
}

/// Closed status-code enumeration, serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Success,
    Accepted,
    BadRequest,
    Unauthorized,
    NotFound,
    Timeout,
    Conflict,
    InternalError,
    Unavailable,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Success => 200,
            StatusCode::Accepted => 202,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotFound => 404,
            StatusCode::Timeout => 408,
            StatusCode::Conflict => 409,
            StatusCode::InternalError => 500,
            StatusCode::Unavailable => 503,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success | StatusCode::Accepted)
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> u16 {
        status.code()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(StatusCode::Success),
            202 => Ok(StatusCode::Accepted),
            400 => Ok(StatusCode::BadRequest),
            401 => Ok(StatusCode::Unauthorized),
            404 => Ok(StatusCode::NotFound),
            408 => Ok(StatusCode::Timeout),
            409 => Ok(StatusCode::Conflict),
            500 => Ok(StatusCode::InternalError),
            503 => Ok(StatusCode::Unavailable),
            other => Err(format!("unknown status code: {}", other)),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolHeader {
    pub message_id: Uuid,
    pub source_agent: String,
    pub target_agent: Option<String>,
    pub protocol_version: String,
    pub priority: u8,
    pub timestamp: DateTime<Utc>,
    /// Set on responses; equal to the originating request's message_id.
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolPayload {
    pub message_type: MessageType,
    #[serde(default)]
    pub data: ContentMap,
    #[serde(default)]
    pub metadata: ContentMap,
    /// Responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusCode>,
}

/// The structured envelope exchanged between agents: header plus payload,
/// carried inside a bus message's content map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub header: ProtocolHeader,
    pub payload: ProtocolPayload,
}

impl ProtocolMessage {
    pub fn new(
        source: impl Into<String>,
        target: Option<String>,
        message_type: MessageType,
        data: ContentMap,
        metadata: ContentMap,
    ) -> Self {
        Self {
            header: ProtocolHeader {
                message_id: Uuid::new_v4(),
                source_agent: source.into(),
                target_agent: target,
                protocol_version: "1.0".to_string(),
                priority: 0,
                timestamp: Utc::now(),
                correlation_id: None,
            },
            payload: ProtocolPayload {
                message_type,
                data,
                metadata,
                status: None,
            },
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.header.protocol_version = version.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.header.priority = priority;
        self
    }

    /// Build the reply to this envelope: source and target swap, the
    /// correlation id is set to this message's id, and the status code is
    /// stamped on the payload.
    pub fn create_response(&self, status: StatusCode, data: ContentMap) -> Self {
        Self {
            header: ProtocolHeader {
                message_id: Uuid::new_v4(),
                source_agent: self
                    .header
                    .target_agent
                    .clone()
                    .unwrap_or_else(|| self.header.source_agent.clone()),
                target_agent: Some(self.header.source_agent.clone()),
                protocol_version: self.header.protocol_version.clone(),
                priority: self.header.priority,
                timestamp: Utc::now(),
                correlation_id: Some(self.header.message_id),
            },
            payload: ProtocolPayload {
                message_type: self.payload.message_type,
                data,
                metadata: ContentMap::new(),
                status: Some(status),
            },
        }
    }

    /// Lower the envelope into a bus message; the envelope itself becomes
    /// the message content.
    pub fn to_bus_message(&self, kind: MessageKind) -> Message {
        let content = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => ContentMap::new(),
        };

        Message {
            id: self.header.message_id,
            kind,
            source: self.header.source_agent.clone(),
            target: self.header.target_agent.clone(),
            topic: String::new(),
            content,
            priority: self.header.priority,
            timestamp: self.header.timestamp,
            correlation_id: self.header.correlation_id,
        }
    }

    /// Sniff a bus message for the envelope shape. Returns None for
    /// messages that do not carry a well-formed envelope.
    pub fn from_bus_message(message: &Message) -> Option<Self> {
        serde_json::from_value(serde_json::Value::Object(message.content.clone())).ok()
    }
}

/// Outcome of a protocol request: explicit fields, never a raised error.
#[derive(Debug, Clone)]
pub struct ProtocolResponse {
    pub success: bool,
    pub status: StatusCode,
    pub message: Option<ProtocolMessage>,
    pub error: Option<String>,
    pub latency: Duration,
}

impl ProtocolResponse {
    pub fn completed(message: ProtocolMessage, latency: Duration) -> Self {
        let status = message.payload.status.unwrap_or(StatusCode::Success);
        let error = if status.is_success() {
            None
        } else {
            Some(format!("request returned status {}", status))
        };
        Self {
            success: status.is_success(),
            status,
            message: Some(message),
            error,
            latency,
        }
    }

    pub fn failed(status: StatusCode, error: impl Into<String>, latency: Duration) -> Self {
        Self {
            success: false,
            status,
            message: None,
            error: Some(error.into()),
            latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ProtocolMessage {
        ProtocolMessage::new(
            "analyzer",
            Some("director".to_string()),
            MessageType::DataRequest,
            ContentMap::new(),
            ContentMap::new(),
        )
    }

    #[test]
    fn test_create_response_swaps_and_correlates() {
        let request = sample_request();
        let response = request.create_response(StatusCode::Success, ContentMap::new());

        assert_eq!(response.header.correlation_id, Some(request.header.message_id));
        assert_eq!(response.header.source_agent, "director");
        assert_eq!(response.header.target_agent.as_deref(), Some("analyzer"));
        assert_eq!(response.payload.status, Some(StatusCode::Success));
        assert_ne!(response.header.message_id, request.header.message_id);
    }

    #[test]
    fn test_status_code_serde_roundtrip() {
        let json = serde_json::to_string(&StatusCode::NotFound).unwrap();
        assert_eq!(json, "404");

        let status: StatusCode = serde_json::from_str("500").unwrap();
        assert_eq!(status, StatusCode::InternalError);

        assert!(serde_json::from_str::<StatusCode>("999").is_err());
    }

    #[test]
    fn test_message_type_serde() {
        let json = serde_json::to_string(&MessageType::AgentHeartbeat).unwrap();
        assert_eq!(json, "\"agent_heartbeat\"");
    }

    #[test]
    fn test_bus_message_roundtrip() {
        let envelope = sample_request();
        let bus_message = envelope.to_bus_message(MessageKind::Request);

        assert_eq!(bus_message.id, envelope.header.message_id);
        assert_eq!(bus_message.source, "analyzer");

        let parsed = ProtocolMessage::from_bus_message(&bus_message)
            .expect("envelope should round-trip");
        assert_eq!(parsed.header.message_id, envelope.header.message_id);
        assert_eq!(parsed.payload.message_type, MessageType::DataRequest);
    }

    #[test]
    fn test_non_envelope_message_is_rejected() {
        let mut content = ContentMap::new();
        content.insert("text".to_string(), serde_json::json!("plain"));
        let message = Message::new(MessageKind::Direct, "someone", content);

        assert!(ProtocolMessage::from_bus_message(&message).is_none());
    }
}
