//! Request and response envelopes exchanged with the server.
//!
//! Requests are sent as form fields (`message`, `context`, `token`); the
//! `message` field carries a JSON [`RequestEnvelope`]. Responses are a JSON
//! [`ResponseEnvelope`], optionally prefixed with a `while(1);` guard that the
//! decoder strips.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::{ActionInvocation, ActionState};
use crate::ids::ActionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub actions: Vec<ActionInvocation>,
}

/// Per-action result record inside a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub id: ActionId,
    pub state: ActionState,
    #[serde(default)]
    pub return_value: Value,
    #[serde(default)]
    pub error: Vec<Value>,
    #[serde(default)]
    pub storable: bool,
    /// Descriptor of the action, present on server-pushed responses.
    #[serde(default, rename = "action", skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ActionResponse {
    pub fn success(id: ActionId, return_value: Value) -> Self {
        Self {
            id,
            state: ActionState::Success,
            return_value,
            error: Vec::new(),
            storable: false,
            descriptor: None,
            params: None,
        }
    }

    pub fn failure(id: ActionId, state: ActionState, message: impl Into<String>) -> Self {
        Self {
            id,
            state,
            return_value: Value::Null,
            error: vec![serde_json::json!({ "message": message.into() })],
            storable: false,
            descriptor: None,
            params: None,
        }
    }

    /// First error message carried by the response, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.iter().find_map(|entry| match entry {
            Value::String(message) => Some(message.clone()),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub descriptor: String,
    #[serde(default)]
    pub attributes: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub actions: Vec<ActionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub events: Vec<ServerEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Body of an error response (non-200 status or `/*ERROR*/` trailer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub exception_event: bool,
    #[serde(default)]
    pub event: Option<ServerEvent>,
}

/// One outgoing request as handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub message: String,
    pub context: String,
    pub token: Option<String>,
    pub background: bool,
    pub marker: u64,
}

/// Raw completion reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}
