use crate::message::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A predicate over a message's payload, used to validate that a message
/// presented to a stream's dispatcher actually matches the shape declared
/// for its `type`.
pub type PayloadShape = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Accepts any payload; the default for message types that declare no
/// shape constraint.
pub fn any_shape() -> PayloadShape {
    Arc::new(|_| true)
}

/// A stream's closed set of message kinds: `{aggregate_root_id type,
/// messages map}`. A dispatcher for this stream accepts only messages
/// whose `type` is a registered key and whose payload satisfies that
/// type's shape predicate.
///
/// The aggregate-root class of the original triple is out of scope here —
/// aggregate reconstruction lives with the event-sourcing layer, not the
/// outbox core.
#[derive(Clone)]
pub struct StreamDefinition {
    name: String,
    message_types: HashMap<String, PayloadShape>,
}

impl StreamDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_types: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>, shape: PayloadShape) -> Self {
        self.message_types.insert(message_type.into(), shape);
        self
    }

    /// Register a message type with no payload-shape constraint.
    pub fn with_untyped_message(self, message_type: impl Into<String>) -> Self {
        self.with_message_type(message_type, any_shape())
    }

    pub fn accepts(&self, message: &Message) -> bool {
        match self.message_types.get(message.message_type()) {
            Some(shape) => shape(message.payload()),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unregistered_message_types() {
        let stream = StreamDefinition::new("orders").with_untyped_message("order.placed");
        let msg = Message::new("order.cancelled", serde_json::json!({}));
        assert!(!stream.accepts(&msg));
    }

    #[test]
    fn enforces_registered_payload_shape() {
        let stream = StreamDefinition::new("orders").with_message_type(
            "order.placed",
            Arc::new(|p: &Value| p.get("order_id").is_some()),
        );
        let good = Message::new("order.placed", serde_json::json!({"order_id": 1}));
        let bad = Message::new("order.placed", serde_json::json!({}));
        assert!(stream.accepts(&good));
        assert!(!stream.accepts(&bad));
    }
}
