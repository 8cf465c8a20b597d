//! Wire messages
//!
//! One JSON object per line. Outgoing requests are `{id, method, params}`;
//! incoming lines are either a response (`id` plus `result` or `error`) or a
//! notification (`method` and `params`, no `id`).

use serde::Serialize;
use serde_json::Value;

use crate::error::TransportError;

/// Outgoing request
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize without the trailing newline (the codec adds it).
    pub fn to_line(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

/// Methods the server may push without being asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationMethod {
    AddressChanged,
    HeaderChanged,
    BlockCountChanged,
}

impl NotificationMethod {
    pub const ADDRESS_SUBSCRIBE: &'static str = "blockchain.address.subscribe";
    pub const HEADERS_SUBSCRIBE: &'static str = "blockchain.headers.subscribe";
    pub const NUMBLOCKS_SUBSCRIBE: &'static str = "blockchain.numblocks.subscribe";

    /// Allow-list lookup. Anything not listed is dropped by the transport.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            Self::ADDRESS_SUBSCRIBE => Some(Self::AddressChanged),
            Self::HEADERS_SUBSCRIBE => Some(Self::HeaderChanged),
            Self::NUMBLOCKS_SUBSCRIBE => Some(Self::BlockCountChanged),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddressChanged => Self::ADDRESS_SUBSCRIBE,
            Self::HeaderChanged => Self::HEADERS_SUBSCRIBE,
            Self::BlockCountChanged => Self::NUMBLOCKS_SUBSCRIBE,
        }
    }
}

/// Unsolicited message from the server
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: NotificationMethod,
    pub params: Vec<Value>,
}

/// A parsed incoming line
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, Value>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Incoming {
    /// Parse one line of the wire protocol.
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| TransportError::Protocol(format!("unparseable message: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| TransportError::Protocol("message is not an object".to_string()))?;

        match obj.get("id") {
            Some(id) if !id.is_null() => {
                let id = id
                    .as_u64()
                    .ok_or_else(|| TransportError::Protocol(format!("invalid id {}", id)))?;
                let outcome = match obj.get("error") {
                    Some(err) if !err.is_null() => Err(err.clone()),
                    _ => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
                };
                Ok(Incoming::Response { id, outcome })
            }
            _ => {
                let method = obj
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TransportError::Protocol("message has neither id nor method".to_string())
                    })?
                    .to_string();
                let params = match obj.get("params") {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => vec![other.clone()],
                };
                Ok(Incoming::Notification { method, params })
            }
        }
    }
}

/// Human-readable text of a server `error` member.
pub fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}
