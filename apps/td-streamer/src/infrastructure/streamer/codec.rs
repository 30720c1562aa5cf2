//! Frame Codec
//!
//! Splits one inbound text frame into its logical messages. A frame that is
//! not a JSON object is a protocol error; a single malformed element inside
//! an otherwise valid frame is logged and skipped so the rest of the batch
//! still goes through.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::messages::{DataMessage, FrameKind, InboundMessage, ResponseMessage};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Form encoding of the LOGIN credential failed.
    #[error("credential encoding error: {0}")]
    UrlEncode(#[from] serde_urlencoded::ser::Error),

    /// Frame shape is not what the protocol allows.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Decoder for streamer text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into its messages, preserving array order.
    ///
    /// Unknown top-level keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or not a JSON object.
    pub fn decode(&self, text: &str) -> Result<Vec<InboundMessage>, CodecError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let Value::Object(frame) = value else {
            return Err(CodecError::InvalidFrame(format!(
                "expected JSON object, got: {}...",
                preview(text)
            )));
        };

        Ok(Self::split(frame))
    }

    fn split(frame: Map<String, Value>) -> Vec<InboundMessage> {
        let mut messages = Vec::new();

        for (key, body) in frame {
            let Some(kind) = FrameKind::from_key(&key) else {
                tracing::debug!(key = %key, "Ignoring unknown top-level key");
                continue;
            };

            for element in elements(body) {
                let message = match kind {
                    FrameKind::Notify => Some(InboundMessage::Notify(element)),
                    FrameKind::Snapshot => Some(InboundMessage::Snapshot(element)),
                    FrameKind::Response => {
                        typed::<ResponseMessage>(kind, element).map(InboundMessage::Response)
                    }
                    FrameKind::Data => typed::<DataMessage>(kind, element).map(InboundMessage::Data),
                };
                messages.extend(message);
            }
        }

        messages
    }
}

fn elements(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn typed<T: DeserializeOwned>(kind: FrameKind, element: Value) -> Option<T> {
    match serde_json::from_value(element) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(kind = kind.as_str(), error = %e, "Dropping malformed element");
            None
        }
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(index, _)| index);
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_notify() {
        let messages = FrameCodec::new()
            .decode(r#"{"notify":[{"heartbeat":"1614612600000"}]}"#)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind(), FrameKind::Notify);
    }

    #[test]
    fn decodes_batched_data_in_order() {
        let text = r#"{"data":[
            {"service":"CHART_EQUITY","timestamp":1,"command":"SUBS","content":[{"key":"SPY","seq":1}]},
            {"service":"TIMESALE_EQUITY","timestamp":2,"command":"SUBS","content":[]}
        ]}"#;
        let messages = FrameCodec::new().decode(text).unwrap();

        let services: Vec<_> = messages
            .iter()
            .map(|message| match message {
                InboundMessage::Data(data) => data.service.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(services, vec!["CHART_EQUITY", "TIMESALE_EQUITY"]);
    }

    #[test]
    fn malformed_element_is_skipped() {
        let text = r#"{"response":[
            {"requestid":"0"},
            {"service":"ADMIN","requestid":"2","command":"QOS","content":{"code":0,"msg":"ok"}}
        ]}"#;
        let messages = FrameCodec::new().decode(text).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], InboundMessage::Response(r) if r.is_qos()));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let messages = FrameCodec::new()
            .decode(r#"{"something":[1,2,3],"snapshot":[{"service":"NEWS_STORY"}]}"#)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind(), FrameKind::Snapshot);
    }

    #[test]
    fn non_object_frame_is_an_error() {
        let err = FrameCodec::new().decode("[1,2]").unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));

        let err = FrameCodec::new().decode("not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
