//! Inbound Message Types
//!
//! A frame is one JSON object whose top-level key names its kind:
//!
//! - `notify`: heartbeats and server notices
//! - `response`: outcome of a LOGIN, LOGOUT, QOS or subscription command
//! - `snapshot`: reply to a GET
//! - `data`: streamed content, batched per service
//!
//! Each kind carries an array; elements are processed in array order.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::domain::service::{Command, Service, request_ids};

/// Top-level frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Heartbeat / notice.
    Notify,
    /// Command outcome.
    Response,
    /// GET reply.
    Snapshot,
    /// Streamed content.
    Data,
}

impl FrameKind {
    /// Resolve a top-level key.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "notify" => Some(Self::Notify),
            "response" => Some(Self::Response),
            "snapshot" => Some(Self::Snapshot),
            "data" => Some(Self::Data),
            _ => None,
        }
    }

    /// Top-level key and metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::Response => "response",
            Self::Snapshot => "snapshot",
            Self::Data => "data",
        }
    }
}

// =============================================================================
// Response
// =============================================================================

/// `content` of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseContent {
    /// Zero on success.
    pub code: i64,
    /// Human-readable outcome.
    #[serde(default)]
    pub msg: String,
}

/// One element of a `response` array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResponseMessage {
    /// Service the command targeted.
    pub service: String,
    /// Request id echoed back.
    #[serde(default, deserialize_with = "lenient_string")]
    pub requestid: String,
    /// Command echoed back.
    #[serde(default)]
    pub command: String,
    /// Server time (epoch ms).
    #[serde(default)]
    pub timestamp: i64,
    /// Outcome.
    #[serde(default)]
    pub content: ResponseContent,
}

impl ResponseMessage {
    /// Target service.
    #[must_use]
    pub fn service(&self) -> Service {
        Service::from_wire(&self.service)
    }

    /// Echoed command verb.
    #[must_use]
    pub fn command(&self) -> Option<Command> {
        Command::from_wire(&self.command)
    }

    /// Whether the server reported success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.content.code == 0
    }

    /// Whether this answers the LOGIN request.
    #[must_use]
    pub fn is_login(&self) -> bool {
        self.service() == Service::Admin
            && (self.command() == Some(Command::Login)
                || self.requestid == request_ids::LOGIN.to_string())
    }

    /// Whether this answers the LOGOUT request.
    #[must_use]
    pub fn is_logout(&self) -> bool {
        self.service() == Service::Admin && self.command() == Some(Command::Logout)
    }

    /// Whether this answers a QOS request.
    #[must_use]
    pub fn is_qos(&self) -> bool {
        self.service() == Service::Admin && self.command() == Some(Command::Qos)
    }
}

// =============================================================================
// Data
// =============================================================================

/// One element of a `data` array: all content for one service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DataMessage {
    /// Service name.
    pub service: String,
    /// Frame time (epoch ms).
    #[serde(default)]
    pub timestamp: i64,
    /// Command the data belongs to, usually `SUBS`.
    #[serde(default)]
    pub command: Option<String>,
    /// One entry per key, fields indexed by stringified position.
    #[serde(default)]
    pub content: Vec<Map<String, Value>>,
}

impl DataMessage {
    /// Service of this block.
    #[must_use]
    pub fn service(&self) -> Service {
        Service::from_wire(&self.service)
    }
}

// =============================================================================
// Notify
// =============================================================================

/// Heartbeat time carried by a notify element, if any.
#[must_use]
pub fn heartbeat_ms(notify: &Value) -> Option<i64> {
    match notify.get("heartbeat")? {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_i64(),
        _ => None,
    }
}

/// Decoded element of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Heartbeat or notice.
    Notify(Value),
    /// Command outcome.
    Response(ResponseMessage),
    /// GET reply, kept verbatim.
    Snapshot(Value),
    /// Streamed content.
    Data(DataMessage),
}

impl InboundMessage {
    /// Kind of frame this element came from.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::Notify(_) => FrameKind::Notify,
            Self::Response(_) => FrameKind::Response,
            Self::Snapshot(_) => FrameKind::Snapshot,
            Self::Data(_) => FrameKind::Data,
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn login_response() {
        let response: ResponseMessage = serde_json::from_value(json!({
            "service": "ADMIN",
            "requestid": "0",
            "command": "LOGIN",
            "timestamp": 1_614_612_600_000_i64,
            "content": {"code": 0, "msg": "29-3"}
        }))
        .unwrap();

        assert!(response.is_login());
        assert!(response.is_success());
        assert!(!response.is_qos());
    }

    #[test]
    fn numeric_request_id_is_accepted() {
        let response: ResponseMessage = serde_json::from_value(json!({
            "service": "ADMIN",
            "requestid": 0,
            "content": {"code": 3, "msg": "Login Denied"}
        }))
        .unwrap();

        assert_eq!(response.requestid, "0");
        assert!(response.is_login());
        assert!(!response.is_success());
    }

    #[test]
    fn heartbeat_as_string_or_number() {
        assert_eq!(
            heartbeat_ms(&json!({"heartbeat": "1614612600000"})),
            Some(1_614_612_600_000)
        );
        assert_eq!(heartbeat_ms(&json!({"heartbeat": 5})), Some(5));
        assert_eq!(heartbeat_ms(&json!({"service": "ADMIN"})), None);
    }

    #[test]
    fn frame_kinds() {
        for kind in [
            FrameKind::Notify,
            FrameKind::Response,
            FrameKind::Snapshot,
            FrameKind::Data,
        ] {
            assert_eq!(FrameKind::from_key(kind.as_str()), Some(kind));
        }
        assert_eq!(FrameKind::from_key("other"), None);
    }
}
