//! Account Activity Payloads
//!
//! `ACCT_ACTIVITY` entries carry an XML document as a JSON string. The
//! wire contract stays a string; internally the document is turned into a
//! JSON tree:
//!
//! - attributes become `@name` members
//! - text of an element that also has children or attributes becomes `#text`
//! - repeated child elements collapse into an array
//! - leaf elements become their text, or `null` when empty

use quick_xml::Reader;
use quick_xml::escape::{resolve_xml_entity, unescape};
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

use crate::domain::records::ActivityPayload;

/// Activity payload decoding error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    /// The markup is not well formed.
    #[error("malformed activity markup: {0}")]
    Malformed(String),

    /// The document has no root element.
    #[error("activity markup has no root element")]
    Empty,
}

/// Turns an activity payload into a structured record.
#[cfg_attr(test, mockall::automock)]
pub trait ActivityDecoder: Send + Sync {
    /// Decode `markup` sent with `message_type` (e.g. `OrderFill`).
    ///
    /// # Errors
    ///
    /// Returns `ActivityError` if the markup cannot be parsed.
    fn decode(&self, message_type: &str, markup: &str) -> Result<ActivityPayload, ActivityError>;
}

/// XML decoder backed by `quick-xml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlActivityDecoder;

impl XmlActivityDecoder {
    /// Create a new decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ActivityDecoder for XmlActivityDecoder {
    fn decode(&self, message_type: &str, markup: &str) -> Result<ActivityPayload, ActivityError> {
        let (root, body) = parse_tree(markup)?;

        let expected = format!("{message_type}Message");
        if local_name(&root) != expected {
            tracing::debug!(
                message_type,
                root = %root,
                "Activity root element does not match message type"
            );
        }

        Ok(ActivityPayload { root, body })
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self, ActivityError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut children = Map::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(malformed)?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute.unescape_value().map_err(malformed)?.into_owned();
            children.insert(format!("@{key}"), Value::String(value));
        }
        Ok(Self {
            name,
            children,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        let value = if self.children.is_empty() {
            if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            }
        } else {
            let mut children = self.children;
            if !text.is_empty() {
                children.insert("#text".to_string(), Value::String(text));
            }
            Value::Object(children)
        };
        (self.name, value)
    }

    fn adopt(&mut self, name: String, value: Value) {
        match self.children.get_mut(&name) {
            None => {
                self.children.insert(name, value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
}

fn parse_tree(markup: &str) -> Result<(String, Value), ActivityError> {
    let mut reader = Reader::from_str(markup);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(start) => stack.push(Node::open(&start)?),
            Event::Empty(start) => {
                let (name, value) = Node::open(&start)?.close();
                attach(&mut stack, &mut root, name, value);
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ActivityError::Malformed("unbalanced end tag".to_string()))?;
                let (name, value) = node.close();
                attach(&mut stack, &mut root, name, value);
            }
            Event::Text(text) => {
                if let Some(node) = stack.last_mut() {
                    let raw = text.decode().map_err(malformed)?;
                    node.text.push_str(&unescape(&raw).map_err(malformed)?);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text
                        .push_str(&String::from_utf8_lossy(data.into_inner().as_ref()));
                }
            }
            Event::GeneralRef(reference) => {
                if let Some(node) = stack.last_mut() {
                    let resolved = match reference.resolve_char_ref().map_err(malformed)? {
                        Some(ch) => ch.to_string(),
                        None => {
                            let name = reference.decode().map_err(malformed)?;
                            resolve_xml_entity(&name)
                                .map_or_else(|| format!("&{name};"), str::to_string)
                        }
                    };
                    node.text.push_str(&resolved);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ActivityError::Malformed("unclosed element".to_string()));
    }
    root.ok_or(ActivityError::Empty)
}

fn attach(stack: &mut [Node], root: &mut Option<(String, Value)>, name: String, value: Value) {
    match stack.last_mut() {
        Some(parent) => parent.adopt(name, value),
        None => {
            if root.is_none() {
                *root = Some((name, value));
            }
        }
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

fn malformed(error: impl std::fmt::Display) -> ActivityError {
    ActivityError::Malformed(error.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ORDER_FILL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OrderFillMessage xmlns="urn:xmlns:beb.ameritrade.com">
  <OrderGroupID><Firm>150</Firm><Branch>123</Branch></OrderGroupID>
  <ActivityTimestamp>2021-03-01T10:30:00.250-05:00</ActivityTimestamp>
  <Order>
    <OrderKey>4567</OrderKey>
    <Security><CUSIP>78462F103</CUSIP><Symbol>SPY</Symbol></Security>
    <OrderPricing xsi:type="LimitT"><Limit>390.25</Limit></OrderPricing>
  </Order>
  <ExecutionInformation><Quantity>10</Quantity><ExecutionPrice>390.2</ExecutionPrice></ExecutionInformation>
  <ExecutionInformation><Quantity>5</Quantity><ExecutionPrice>390.25</ExecutionPrice></ExecutionInformation>
  <MarkupAmount/>
  <Note>Fill &amp; kill</Note>
</OrderFillMessage>"#;

    #[test]
    fn decodes_order_fill() {
        let payload = XmlActivityDecoder::new()
            .decode("OrderFill", ORDER_FILL)
            .unwrap();

        assert_eq!(payload.root, "OrderFillMessage");
        let body = &payload.body;
        assert_eq!(body["@xmlns"], "urn:xmlns:beb.ameritrade.com");
        assert_eq!(body["OrderGroupID"]["Branch"], "123");
        assert_eq!(body["Order"]["Security"]["Symbol"], "SPY");
        assert_eq!(body["Order"]["OrderPricing"]["@xsi:type"], "LimitT");
        assert_eq!(body["Order"]["OrderPricing"]["Limit"], "390.25");
        assert_eq!(body["MarkupAmount"], Value::Null);
        assert_eq!(body["Note"], "Fill & kill");
    }

    #[test]
    fn repeated_children_become_an_array() {
        let payload = XmlActivityDecoder::new()
            .decode("OrderFill", ORDER_FILL)
            .unwrap();

        assert_eq!(
            payload.body["ExecutionInformation"],
            json!([
                {"Quantity": "10", "ExecutionPrice": "390.2"},
                {"Quantity": "5", "ExecutionPrice": "390.25"}
            ])
        );
    }

    #[test]
    fn mismatched_tags_are_rejected() {
        let err = XmlActivityDecoder::new()
            .decode("OrderFill", "<OrderFillMessage><A></B></OrderFillMessage>")
            .unwrap_err();
        assert!(matches!(err, ActivityError::Malformed(_)));
    }

    #[test]
    fn unclosed_document_is_rejected() {
        let err = XmlActivityDecoder::new()
            .decode("OrderFill", "<OrderFillMessage><A>1</A>")
            .unwrap_err();
        assert!(matches!(err, ActivityError::Malformed(_)));
    }

    #[test]
    fn empty_markup_has_no_root() {
        let err = XmlActivityDecoder::new().decode("OrderFill", "").unwrap_err();
        assert_eq!(err, ActivityError::Empty);
    }

    #[test]
    fn text_alongside_attributes() {
        let payload = XmlActivityDecoder::new()
            .decode("UROUT", r#"<UROUTMessage><Reason code="7">Cancelled</Reason></UROUTMessage>"#)
            .unwrap();
        assert_eq!(
            payload.body,
            json!({"Reason": {"@code": "7", "#text": "Cancelled"}})
        );
    }
}
