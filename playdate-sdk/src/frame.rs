//! Wire frames exchanged over the persistent socket.
//!
//! Every frame is a JSON object with a required `type` discriminant. Replies
//! add `success` and usually `message`; everything else is payload. The bag
//! stays untyped here: routing only ever needs the discriminant, and the few
//! fields the session store cares about are read through typed accessors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Field carrying the client-generated correlation id of a command.
pub const REQUEST_ID: &str = "requestId";

/// One JSON message sent or received over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Frame {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Build a frame whose payload is the given object.
    pub fn with_payload(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        let mut frame = Self {
            kind: kind.into(),
            payload,
        };
        // A stray `type` key in the payload would shadow the discriminant on the wire.
        frame.payload.remove("type");
        frame
    }

    /// Parse a raw text frame. Anything that is not an object with a string
    /// `type` fails as a whole.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Set a payload field, builder style.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// `success` flag of a reply; `None` for push frames that carry none.
    pub fn success(&self) -> Option<bool> {
        self.payload.get("success").and_then(Value::as_bool)
    }

    pub fn is_success(&self) -> bool {
        self.success().unwrap_or(false)
    }

    /// Server-provided human readable message, when it is a string.
    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Integer field, accepting numeric strings as sent by some endpoints.
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(value_as_i64)
    }

    pub fn request_id(&self) -> Option<u64> {
        self.payload.get(REQUEST_ID).and_then(Value::as_u64)
    }

    /// Deserialize one payload field into `T`, `None` if absent or mistyped.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.payload.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(kind = %self.kind, field = key, "undecodable field: {e}");
                None
            }
        }
    }
}

/// Read an id that may arrive either as a JSON number or a numeric string.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_reply_frame() {
        let frame =
            Frame::parse(r#"{"type":"deleteEvent","success":false,"message":"not yours","eventId":"12"}"#)
                .unwrap();
        assert_eq!(frame.kind, "deleteEvent");
        assert_eq!(frame.success(), Some(false));
        assert!(!frame.is_success());
        assert_eq!(frame.message(), Some("not yours"));
        assert_eq!(frame.i64_field("eventId"), Some(12));
    }

    #[test]
    fn push_frame_has_no_success_flag() {
        let frame = Frame::parse(r#"{"type":"newChat","chatId":3,"message":{"text":"hi"}}"#).unwrap();
        assert_eq!(frame.success(), None);
        // an object-valued `message` is payload, not a reply message
        assert_eq!(frame.message(), None);
        assert_eq!(frame.get("message").unwrap()["text"], "hi");
    }

    #[test]
    fn rejects_frames_without_type() {
        assert!(Frame::parse(r#"{"success":true}"#).is_err());
        assert!(Frame::parse(r#"{"type":7}"#).is_err());
        assert!(Frame::parse("[1,2,3]").is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn outbound_frame_serializes_type_first_class() {
        let frame = Frame::new("addNewEvent")
            .with("topic", "Picnic")
            .with(REQUEST_ID, 9u64);
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "addNewEvent", "topic": "Picnic", "requestId": 9}));
        assert_eq!(frame.request_id(), Some(9));
    }

    #[test]
    fn payload_cannot_shadow_type() {
        let mut payload = Map::new();
        payload.insert("type".into(), json!("evil"));
        payload.insert("kidId".into(), json!(4));
        let frame = Frame::with_payload("deleteKidInfo", payload);
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "deleteKidInfo");
    }

    #[test]
    fn decode_typed_field() {
        let frame = Frame::new("x").with("ids", json!([1, 2, 3]));
        let ids: Vec<i64> = frame.decode("ids").unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(frame.decode::<Vec<String>>("ids").is_none());
        assert!(frame.decode::<Vec<i64>>("missing").is_none());
    }
}
