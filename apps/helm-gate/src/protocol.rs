use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Wire envelope for every frame exchanged between the panel and an agent.
///
/// JSON text frames, tagged by `type`. Commands always flow panel -> agent;
/// responses and events flow agent -> panel. `hello`/`hello_ok` are only
/// valid as the opening handshake exchange of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Panel-initiated request expecting exactly one response with the same id.
    #[serde(rename_all = "camelCase")]
    Command {
        id: String,
        timestamp: DateTime<Utc>,
        agent_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        #[serde(default)]
        payload: Map<String, Value>,
    },
    /// Agent reply to a command, matched by id.
    #[serde(rename_all = "camelCase")]
    Response {
        id: String,
        timestamp: DateTime<Utc>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteErrorBody>,
    },
    /// Unsolicited agent notification (status change, log line, metric sample).
    #[serde(rename_all = "camelCase")]
    Event {
        timestamp: DateTime<Utc>,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default)]
        data: Map<String, Value>,
    },
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// First frame of a connection: claimed identity plus bearer token.
    #[serde(rename_all = "camelCase")]
    Hello {
        agent_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// Panel acknowledgement of a successful handshake.
    #[serde(rename_all = "camelCase")]
    HelloOk { agent_id: String },
}

/// Structured failure reported by an agent inside a `response` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("frame has no `type` field")]
    MissingKind,
    #[error("unknown frame type `{0}`")]
    UnknownKind(String),
    #[error("invalid `{kind}` frame: {source}")]
    Envelope {
        kind: String,
        source: serde_json::Error,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "command", "response", "event", "ping", "pong", "hello", "hello_ok",
];

/// Serialize a message to a JSON text frame.
pub fn encode(message: &WireMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Parse a JSON text frame into a message.
///
/// Unknown keys inside `payload`/`data` survive as-is; unknown top-level
/// frame types and missing required fields are rejected.
pub fn decode(text: &str) -> Result<WireMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Syntax)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingKind)?
        .to_string();
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Envelope { kind, source })
}

/// Generate a fresh command id.
pub fn generate_command_id() -> String {
    Uuid::new_v4().to_string()
}
