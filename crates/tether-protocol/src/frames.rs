//! Frame types and channel discriminators
//!
//! Wire shapes use camelCase field names. A frame is decoded by inspecting
//! its `protocol` field first (versioned RPC takes precedence), then its
//! `channel` field, and finally the legacy request/hello shapes which carry
//! no explicit discriminator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Channel tag carried by legacy RPC response frames.
pub const RPC_CHANNEL: &str = "rpc";

/// Channel tag carried by server-pushed event frames.
pub const EVENT_CHANNEL: &str = "event";

/// Protocol tag for the versioned RPC channel. Frames bearing this tag are
/// delegated whole to the versioned dispatch seam before any legacy decoding.
pub const VERSIONED_PROTOCOL: &str = "rpc-v2";

/// Service name reserved for the bus's own built-in endpoints.
pub const BUS_SERVICE: &str = "bus";

/// Built-in heartbeat method; returns the host's version string.
pub const HEARTBEAT_METHOD: &str = "heartbeat";

/// Built-in event subscription handshake methods.
pub const SUBSCRIBE_METHOD: &str = "subscribe_event";
pub const UNSUBSCRIBE_METHOD: &str = "unsubscribe_event";

/// Request correlation id.
///
/// A plain incrementing 64-bit counter, allocated per client process starting
/// at 1 and never reused within that process's lifetime. No wraparound
/// handling: at one call per nanosecond the counter lasts centuries.
pub type RequestId = u64;

/// First frame on every new physical socket; carries the logical client id
/// the transport binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    pub client_id: String,
}

/// A method invocation on the legacy RPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub service_name: String,
    pub method_name: String,
    #[serde(default)]
    pub method_args: Vec<Value>,
    #[serde(default)]
    pub service_options: Value,
    pub request_id: RequestId,
}

/// Error payload carried in a response frame in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Response on the legacy RPC channel, correlated by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub channel: String,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ResponseFrame {
    pub fn success(request_id: RequestId, result: Value) -> Self {
        Self {
            channel: RPC_CHANNEL.to_string(),
            request_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: RequestId, error: RemoteError) -> Self {
        Self {
            channel: RPC_CHANNEL.to_string(),
            request_id,
            result: None,
            error: Some(error),
        }
    }
}

/// Fire-and-forget event frame pushed from the daemon to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub channel: String,
    pub event: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventFrame {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            channel: EVENT_CHANNEL.to_string(),
            event: EventPayload {
                name: name.into(),
                args,
            },
        }
    }
}

/// Request on the versioned RPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedRequestFrame {
    pub protocol: String,
    pub service_name: String,
    pub method_name: String,
    #[serde(default)]
    pub method_args: Vec<Value>,
    #[serde(default)]
    pub service_options: Value,
    pub request_id: RequestId,
}

impl VersionedRequestFrame {
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        method_args: Vec<Value>,
        service_options: Value,
        request_id: RequestId,
    ) -> Self {
        Self {
            protocol: VERSIONED_PROTOCOL.to_string(),
            service_name: service_name.into(),
            method_name: method_name.into(),
            method_args,
            service_options,
            request_id,
        }
    }
}

/// Response on the versioned RPC channel. Unlike the legacy channel, error
/// presence is signalled by an explicit flag rather than field absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedResponseFrame {
    pub protocol: String,
    pub request_id: RequestId,
    pub had_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl VersionedResponseFrame {
    pub fn success(request_id: RequestId, result: Value) -> Self {
        Self {
            protocol: VERSIONED_PROTOCOL.to_string(),
            request_id,
            had_error: false,
            error: None,
            result: Some(result),
        }
    }

    pub fn failure(request_id: RequestId, error: Value) -> Self {
        Self {
            protocol: VERSIONED_PROTOCOL.to_string(),
            request_id,
            had_error: true,
            error: Some(error),
            result: None,
        }
    }
}

/// A decoded wire frame.
///
/// Versioned frames are kept as raw JSON: the bus core does not interpret
/// them beyond the protocol tag, it hands them whole to the installed
/// versioned dispatch handler.
#[derive(Debug, Clone)]
pub enum Frame {
    Hello(HelloFrame),
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
    Versioned(Value),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame does not match any known channel")]
    UnknownFrame,
}

impl Frame {
    /// Decode one newline-delimited frame.
    ///
    /// The versioned protocol tag wins over everything else; then the
    /// channel field selects event vs. RPC response; frames with neither
    /// are matched structurally against the request and hello shapes.
    pub fn decode(line: &str) -> Result<Frame, DecodeError> {
        let value: Value = serde_json::from_str(line)?;

        if value.get("protocol").and_then(Value::as_str) == Some(VERSIONED_PROTOCOL) {
            return Ok(Frame::Versioned(value));
        }

        match value.get("channel").and_then(Value::as_str) {
            Some(RPC_CHANNEL) => Ok(Frame::Response(serde_json::from_value(value)?)),
            Some(EVENT_CHANNEL) => Ok(Frame::Event(serde_json::from_value(value)?)),
            Some(_) => Err(DecodeError::UnknownFrame),
            None => {
                if value.get("serviceName").is_some() {
                    Ok(Frame::Request(serde_json::from_value(value)?))
                } else if value.get("clientId").is_some() {
                    Ok(Frame::Hello(serde_json::from_value(value)?))
                } else {
                    Err(DecodeError::UnknownFrame)
                }
            }
        }
    }
}

fn json_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

macro_rules! impl_to_json_line {
    ($($frame:ty),+ $(,)?) => {
        $(impl $frame {
            /// Serialize to a JSON string with a trailing newline.
            pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
                json_line(self)
            }
        })+
    };
}

impl_to_json_line!(
    HelloFrame,
    RequestFrame,
    ResponseFrame,
    EventFrame,
    VersionedRequestFrame,
    VersionedResponseFrame,
);

/// Canonical endpoint name for a service method, `/{service}/{method}`.
pub fn endpoint_name(service: &str, method: &str) -> String {
    format!("/{}/{}", service, method)
}

/// Derive the canonical event name for a service event.
///
/// Both the subscribing client and the firing handler compute this
/// independently, so the derivation must be deterministic: options are
/// rendered as a sorted `key:value` list appended behind a `#`.
pub fn remote_event_name(service: &str, method: &str, options: &Value) -> String {
    let suffix = options_to_string(options);
    if suffix.is_empty() {
        format!("{}/{}", service, method)
    } else {
        format!("{}/{}#{}", service, method, suffix)
    }
}

fn options_to_string(options: &Value) -> String {
    match options {
        Value::Null => String::new(),
        Value::Object(map) => {
            let mut entries: Vec<String> = map
                .iter()
                .map(|(key, value)| match value {
                    // Strings render bare, without JSON quoting.
                    Value::String(s) => format!("{}:{}", key, s),
                    other => format!("{}:{}", key, other),
                })
                .collect();
            entries.sort();
            entries.join("&")
        }
        other => other.to_string(),
    }
}
