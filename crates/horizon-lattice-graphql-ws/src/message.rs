//! Protocol messages and their codec.
//!
//! Every message is validated against the schema of its `type` before it is
//! accepted, in both directions. Validation runs on the JSON value, so a
//! message that merely deserializes is not enough. Every value the validator
//! accepts also deserializes, and `next`/`error` payloads keep unknown keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;
use crate::request::GraphQLRequest;
use crate::response::{GraphQLError, GraphQLResponse};

/// The `type` of a protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `connection_init`
    ConnectionInit,
    /// `connection_ack`
    ConnectionAck,
    /// `subscribe`
    Subscribe,
    /// `next`
    Next,
    /// `error`
    Error,
    /// `complete`
    Complete,
}

impl MessageType {
    /// The wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::ConnectionAck => "connection_ack",
            Self::Subscribe => "subscribe",
            Self::Next => "next",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// Look up a type by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "connection_init" => Some(Self::ConnectionInit),
            "connection_ack" => Some(Self::ConnectionAck),
            "subscribe" => Some(Self::Subscribe),
            "next" => Some(Self::Next),
            "error" => Some(Self::Error),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `graphql-transport-ws` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client -> Server: initialize the connection.
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Map<String, Value>>,
    },
    /// Server -> Client: connection acknowledged.
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Map<String, Value>>,
    },
    /// Client -> Server: start an operation.
    Subscribe { id: String, payload: GraphQLRequest },
    /// Server -> Client: an execution result.
    Next { id: String, payload: GraphQLResponse },
    /// Server -> Client: the operation failed before or during execution.
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    /// Both directions: the operation is done.
    Complete { id: String },
}

impl Message {
    /// The type of this message.
    pub fn kind(&self) -> MessageType {
        match self {
            Self::ConnectionInit { .. } => MessageType::ConnectionInit,
            Self::ConnectionAck { .. } => MessageType::ConnectionAck,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Next { .. } => MessageType::Next,
            Self::Error { .. } => MessageType::Error,
            Self::Complete { .. } => MessageType::Complete,
        }
    }

    /// The operation id, for messages that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Subscribe { id, .. }
            | Self::Next { id, .. }
            | Self::Error { id, .. }
            | Self::Complete { id } => Some(id),
            Self::ConnectionInit { .. } | Self::ConnectionAck { .. } => None,
        }
    }

    /// Validate an already-structured JSON value and convert it.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        if !is_message(&value) {
            return Err(CodecError::Parse("Invalid message".into()));
        }
        serde_json::from_value(value).map_err(|e| CodecError::Parse(e.to_string()))
    }
}

/// Parse raw text frame data into a validated message.
pub fn parse_message(data: &str) -> Result<Message, CodecError> {
    let value: Value =
        serde_json::from_str(data).map_err(|e| CodecError::Parse(format!("Message not parsable: {e}")))?;
    Message::from_value(value)
}

/// Serialize a message after validating it.
pub fn stringify_message(message: &Message) -> Result<String, CodecError> {
    let value = serde_json::to_value(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    if !is_message(&value) {
        return Err(CodecError::Encode(format!(
            "{} message does not match its schema",
            message.kind()
        )));
    }
    serde_json::to_string(&value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Check whether a JSON value is a valid protocol message.
pub fn is_message(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        return false;
    };

    match MessageType::from_wire(kind) {
        Some(MessageType::ConnectionInit) | Some(MessageType::ConnectionAck) => {
            nullable(obj.get("payload"), Value::is_object)
        }
        Some(MessageType::Subscribe) => {
            has_string(obj, "id")
                && obj
                    .get("payload")
                    .and_then(Value::as_object)
                    .is_some_and(is_subscribe_payload)
        }
        Some(MessageType::Next) => {
            has_string(obj, "id") && obj.get("payload").is_some_and(Value::is_object)
        }
        Some(MessageType::Error) => {
            has_string(obj, "id") && obj.get("payload").is_some_and(are_graphql_errors)
        }
        Some(MessageType::Complete) => has_string(obj, "id"),
        None => false,
    }
}

fn has_string(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).is_some_and(Value::is_string)
}

fn is_subscribe_payload(payload: &Map<String, Value>) -> bool {
    has_string(payload, "query")
        && nullable(payload.get("operationName"), Value::is_string)
        && nullable(payload.get("variables"), Value::is_object)
        && nullable(payload.get("extensions"), Value::is_object)
}

/// Absent, `null`, or satisfying `check`.
fn nullable(value: Option<&Value>, check: fn(&Value) -> bool) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(value) => check(value),
    }
}

fn are_graphql_errors(value: &Value) -> bool {
    value.as_array().is_some_and(|errors| {
        !errors.is_empty()
            && errors
                .iter()
                .all(|e| e.as_object().is_some_and(|e| has_string(e, "message")))
    })
}
