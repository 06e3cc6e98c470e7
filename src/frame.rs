//! Wire frames exchanged with the Home Assistant WebSocket API.
//!
//! Outbound frames are plain JSON objects so generic commands can share the
//! send path with service calls. Inbound frames are decoded into
//! [`InboundFrame`]; anything carrying an `id` is routed to the correlator,
//! everything else drives the handshake.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::command::{Command, CommandResult, RemoteError, Target};
use crate::error::ClientError;

pub fn auth_frame(access_token: &str) -> Value {
    json!({
        "type": "auth",
        "access_token": access_token
    })
}

#[derive(Debug, Serialize)]
struct CallServiceFrame<'a> {
    id: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    domain: &'a str,
    service: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a Target>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_data: Option<&'a serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    return_response: bool,
}

pub fn call_service_frame(id: u64, command: &Command) -> Result<Value, ClientError> {
    let frame = CallServiceFrame {
        id,
        kind: "call_service",
        domain: &command.domain,
        service: &command.service,
        target: command.target.as_ref(),
        service_data: command.service_data.as_ref(),
        return_response: command.return_response,
    };
    serde_json::to_value(frame).map_err(|e| ClientError::Protocol(e.to_string()))
}

/// Builds a generic correlated command such as `config/area_registry/list`.
pub fn command_frame(
    id: u64,
    kind: &str,
    fields: serde_json::Map<String, Value>,
) -> Value {
    let mut frame = serde_json::Map::new();
    // Caller supplied fields never override the envelope.
    for (key, value) in fields {
        if !value.is_null() && key != "id" && key != "type" {
            frame.insert(key, value);
        }
    }
    frame.insert("id".into(), json!(id));
    frame.insert("type".into(), json!(kind));
    Value::Object(frame)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteError>,
    },
    Pong {
        id: u64,
    },
    Event {
        id: u64,
        #[serde(default)]
        event: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Correlation id of a frame, read without requiring the rest of it to decode.
pub fn correlation_id(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Converts a correlated frame into the outcome delivered to its caller.
    /// Returns `None` for handshake frames.
    pub fn into_outcome(self) -> Option<(u64, CommandResult)> {
        match self {
            InboundFrame::Result {
                id,
                success: true,
                result,
                ..
            } => Some((id, CommandResult::Success(result.unwrap_or(Value::Null)))),
            InboundFrame::Result {
                id,
                success: false,
                error,
                ..
            } => Some((
                id,
                CommandResult::Failure(error.unwrap_or_else(|| RemoteError {
                    code: "unknown_error".into(),
                    message: "Home Assistant reported a failure without details".into(),
                })),
            )),
            InboundFrame::Pong { id } => Some((id, CommandResult::Success(Value::Null))),
            InboundFrame::Event { id, event } => Some((id, CommandResult::Success(event))),
            _ => None,
        }
    }
}
