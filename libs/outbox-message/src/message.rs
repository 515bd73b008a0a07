use crate::headers;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The message envelope: `{type, payload, headers}`.
///
/// `message_type` and `payload` are frozen at construction — only the
/// constructor sets them. Decorators (and outbox repositories) may add or
/// overwrite headers, never the type or payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    message_type: String,
    payload: Value,
    #[serde(default)]
    headers: HashMap<String, Value>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(key, value);
        self
    }

    pub fn aggregate_root_id(&self) -> Option<&Value> {
        self.header(headers::AGGREGATE_ROOT_ID)
    }

    pub fn aggregate_root_version(&self) -> Option<i64> {
        self.header(headers::AGGREGATE_ROOT_VERSION)?.as_i64()
    }

    pub fn event_id(&self) -> Option<&str> {
        self.header(headers::EVENT_ID)?.as_str()
    }

    pub fn attempt(&self) -> Option<u32> {
        self.header(headers::ATTEMPT)?.as_u64().map(|v| v as u32)
    }

    pub fn delay_until_ms(&self) -> Option<i64> {
        self.header(headers::DELAY_UNTIL)?.as_i64()
    }

    pub fn schema_version(&self) -> Option<u32> {
        self.header(headers::SCHEMA_VERSION)?
            .as_u64()
            .map(|v| v as u32)
    }

    pub fn stream_offset(&self) -> Option<i64> {
        self.header(headers::STREAM_OFFSET)?.as_i64()
    }

    pub fn tenant_id(&self) -> Option<&Value> {
        self.header(headers::TENANT_ID)
    }

    pub fn outbox_id(&self) -> Option<i64> {
        self.header(headers::OUTBOX_ID)?.as_i64()
    }

    pub fn outbox_table(&self) -> Option<&str> {
        self.header(headers::OUTBOX_TABLE)?.as_str()
    }

    pub fn outbox_consumed(&self) -> Option<bool> {
        self.header(headers::OUTBOX_CONSUMED)?.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_payload_round_trip_through_json() {
        let msg = Message::new("user.created", serde_json::json!({"id": 1}))
            .with_header(headers::EVENT_ID, "evt-1");
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "user.created");
        assert_eq!(encoded["payload"]["id"], 1);
        assert_eq!(encoded["headers"]["event_id"], "evt-1");

        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn with_header_overwrites_rather_than_duplicates() {
        let msg = Message::new("x", Value::Null)
            .with_header(headers::ATTEMPT, 1)
            .with_header(headers::ATTEMPT, 2);
        assert_eq!(msg.attempt(), Some(2));
    }

    #[test]
    fn typed_accessors_return_none_for_absent_headers() {
        let msg = Message::new("x", Value::Null);
        assert_eq!(msg.event_id(), None);
        assert_eq!(msg.outbox_id(), None);
        assert_eq!(msg.tenant_id(), None);
    }
}
