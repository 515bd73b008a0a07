use crate::headers;
use crate::message::Message;
use ctx_scope::{ErasedSlot, Slot};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;

/// The context slot read by [`TenantIdDecorator`]. Callers scope a
/// request/command with `ctx_scope::run(Overrides::new().set(&TENANT_ID,
/// ...), ...)` and any decorator further down the call chain picks it up
/// without having to thread it through every function signature.
pub static TENANT_ID: Lazy<Slot<Value>> = Lazy::new(|| Slot::new("tenant_id"));

/// A pure `messages -> messages` transform (spec §4.4).
pub trait Decorator: Send + Sync {
    fn decorate(&self, messages: Vec<Message>) -> Vec<Message>;
}

/// Adds the `tenant_id` header from the current context, if one is set.
/// Messages are left untouched when no tenant is in scope.
pub struct TenantIdDecorator;

impl Decorator for TenantIdDecorator {
    fn decorate(&self, messages: Vec<Message>) -> Vec<Message> {
        let Some(tenant_id) = TENANT_ID.get() else {
            return messages;
        };
        messages
            .into_iter()
            .map(|mut m| {
                m.set_header(headers::TENANT_ID, tenant_id.clone());
                m
            })
            .collect()
    }
}

/// Copies a fixed set of context slot values into headers of the same
/// name, using the slot's declared name as the header key.
pub struct ContextKeysDecorator {
    slots: Vec<&'static dyn ErasedSlot>,
}

impl ContextKeysDecorator {
    pub fn new(slots: Vec<&'static dyn ErasedSlot>) -> Self {
        Self { slots }
    }
}

impl Decorator for ContextKeysDecorator {
    fn decorate(&self, messages: Vec<Message>) -> Vec<Message> {
        let snapshot = ctx_scope::snapshot(&self.slots);
        if snapshot.is_empty() {
            return messages;
        }
        messages
            .into_iter()
            .map(|mut m| {
                for (key, value) in &snapshot {
                    m.set_header(key.clone(), value.clone());
                }
                m
            })
            .collect()
    }
}

/// Sets `schema_version` to the current version for message types that
/// have registered upcasters. Types absent from the table are untouched
/// — the spec treats "no registered upcasters" as "nothing to tag".
pub struct SchemaVersionDecorator {
    current_versions: HashMap<String, u32>,
}

impl SchemaVersionDecorator {
    pub fn new(current_versions: HashMap<String, u32>) -> Self {
        Self { current_versions }
    }
}

impl Decorator for SchemaVersionDecorator {
    fn decorate(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
            .into_iter()
            .map(|mut m| {
                if let Some(&version) = self.current_versions.get(m.message_type()) {
                    m.set_header(headers::SCHEMA_VERSION, version);
                }
                m
            })
            .collect()
    }
}

/// Runs a fixed pipeline of decorators in order, left to right.
pub struct DecoratorChain {
    decorators: Vec<Box<dyn Decorator>>,
}

impl DecoratorChain {
    pub fn new(decorators: Vec<Box<dyn Decorator>>) -> Self {
        Self { decorators }
    }

    pub fn decorate(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for decorator in &self.decorators {
            messages = decorator.decorate(messages);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctx_scope::Overrides;

    #[tokio::test]
    async fn tenant_id_decorator_adds_header_only_when_in_scope() {
        let undecorated = vec![Message::new("x", Value::Null)];
        let out = TenantIdDecorator.decorate(undecorated.clone());
        assert_eq!(out[0].tenant_id(), None);

        let out = ctx_scope::run(Overrides::new().set(&TENANT_ID, Value::from("tenant-42")), async {
            TenantIdDecorator.decorate(undecorated)
        })
        .await;
        assert_eq!(out[0].tenant_id(), Some(&Value::from("tenant-42")));
    }

    #[test]
    fn schema_version_decorator_only_tags_known_types() {
        let mut versions = HashMap::new();
        versions.insert("user.created".to_string(), 3);
        let decorator = SchemaVersionDecorator::new(versions);

        let out = decorator.decorate(vec![
            Message::new("user.created", Value::Null),
            Message::new("user.renamed", Value::Null),
        ]);
        assert_eq!(out[0].schema_version(), Some(3));
        assert_eq!(out[1].schema_version(), None);
    }
}
