//! `graphql-transport-ws` frame types.
//!
//! Every frame is a JSON text message with a `"type"` discriminator. The
//! same [`Frame`] enum is used on both sides of the relay: downstream
//! (clients talking to us) and upstream (us talking to subgraphs).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// WebSocket subprotocol negotiated on both legs of the relay.
pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";

/// Frame types this module knows how to decode.
const KNOWN_TYPES: &[&str] = &[
    "connection_init",
    "connection_ack",
    "ping",
    "pong",
    "subscribe",
    "next",
    "error",
    "complete",
];

/// The operation carried by a `subscribe` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// GraphQL document text.
    pub query: String,
    /// Operation variables, forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

impl SubscribePayload {
    /// Payload without variables.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
        }
    }

    /// Attach a variables object.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }
}

/// One protocol frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client → server handshake.
    ConnectionInit {
        /// Optional connection parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Server → client handshake acknowledgement.
    ConnectionAck {
        /// Optional acknowledgement payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Keep-alive probe.
    Ping {
        /// Optional ping payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Keep-alive answer.
    Pong {
        /// Optional pong payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Start an operation under a client-chosen id.
    Subscribe {
        /// Operation id, unique among the sender's live operations.
        id: String,
        /// The operation.
        payload: SubscribePayload,
    },
    /// One result of an operation.
    Next {
        /// Operation id.
        id: String,
        /// Execution result, forwarded verbatim.
        payload: Value,
    },
    /// Operation failed. Terminal for the operation.
    Error {
        /// Operation id.
        id: String,
        /// GraphQL errors, always an array on the wire.
        #[serde(deserialize_with = "deserialize_errors")]
        payload: Vec<Value>,
    },
    /// Operation finished, or a request to stop it.
    Complete {
        /// Operation id.
        id: String,
    },
}

impl Frame {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionInit { .. } => "connection_init",
            Self::ConnectionAck { .. } => "connection_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Subscribe { .. } => "subscribe",
            Self::Next { .. } => "next",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }

    /// Error frame carrying a single `{ "message": ... }` entry.
    pub fn error_message(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id: id.into(),
            payload: vec![error_entry(message)],
        }
    }

    /// Serialize to the JSON text sent on the socket.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A GraphQL error object with only a message.
pub fn error_entry(message: impl Into<String>) -> Value {
    serde_json::json!({ "message": message.into() })
}

/// Coerce an error payload into an array.
///
/// Conforming peers always send an array. A lone object or string is
/// wrapped so downstream clients never see a non-array `error` payload.
pub fn normalize_errors(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(errors) => errors,
        Value::Null => Vec::new(),
        Value::String(message) => vec![error_entry(message)],
        other => vec![other],
    }
}

fn deserialize_errors<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(normalize_errors)
}

/// Why a text message could not be decoded into a [`Frame`].
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not JSON at all.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// JSON without a string `type` field.
    #[error("frame has no \"type\" field")]
    MissingType,
    /// A `type` this protocol does not define.
    #[error("unsupported frame type: {0}")]
    UnsupportedType(String),
    /// A known `type` whose fields are wrong.
    #[error("malformed {kind} frame: {source}")]
    Malformed {
        /// The frame type that failed to decode.
        kind: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one text message.
pub fn parse_frame(text: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::InvalidJson)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_owned();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(FrameError::UnsupportedType(kind));
    }

    serde_json::from_value(value).map_err(|source| FrameError::Malformed { kind, source })
}
