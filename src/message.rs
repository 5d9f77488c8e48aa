//! Flat, explicit-field replacement for `twoost`'s dynamic-attribute-
//! delegating `AMQPMessage` (spec.md §9 REDESIGN FLAGS).

use once_cell::sync::OnceCell;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::serialization::SerializationRegistry;

/// Delivery metadata: where a message came from and how to ack/reject it.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub redelivered: bool,
}

/// The AMQP basic-properties subset recognised on publish (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub type_: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl MessageProperties {
    /// Default a `correlation_id` to a fresh UUID if the caller left it
    /// unset, the way a sender typically wants a unique id without having to
    /// generate one at every call site.
    pub fn with_default_correlation_id(mut self) -> Self {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        }
        self
    }
}

/// A received (or about-to-be-published) AMQP message.
///
/// `raw_data` caches the decoded-to-`serde_json::Value` view the way
/// `twoost`'s `AMQPMessage.data` property memoizes itself on first access;
/// `data::<T>()` is the typed accessor most callers want and decodes fresh
/// per call (a single cache slot can't serve two different `T`s).
pub struct Message {
    pub body: Vec<u8>,
    pub deliver: DeliveryInfo,
    pub properties: MessageProperties,
    raw_data: OnceCell<Result<serde_json::Value>>,
}

impl Message {
    pub fn new(body: Vec<u8>, deliver: DeliveryInfo, properties: MessageProperties) -> Self {
        Self { body, deliver, properties, raw_data: OnceCell::new() }
    }

    /// Apply the registry decoder for this message's `content_type` into a
    /// caller-chosen type.
    pub fn data<T: serde::de::DeserializeOwned>(&self, registry: &SerializationRegistry) -> Result<T> {
        let content_type = self.properties.content_type.as_deref().unwrap_or("");
        registry.decode(&self.body, content_type)
    }

    /// The untyped, memoized `serde_json::Value` view of the body.
    pub fn raw_data(&self, registry: &SerializationRegistry) -> Result<&serde_json::Value> {
        self.raw_data
            .get_or_init(|| {
                let content_type = self.properties.content_type.as_deref().unwrap_or("");
                registry.decode(&self.body, content_type)
            })
            .as_ref()
            .map_err(|e| match e {
                crate::error::Error::UnknownContentType(ct) => {
                    crate::error::Error::UnknownContentType(ct.clone())
                }
                crate::error::Error::SerializationError(s) => {
                    crate::error::Error::SerializationError(s.clone())
                }
                other => crate::error::Error::SerializationError(other.to_string()),
            })
    }

    pub fn exchange(&self) -> &str {
        &self.deliver.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.deliver.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.deliver.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.deliver.redelivered
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.deliver.exchange)
            .field("routing_key", &self.deliver.routing_key)
            .field("delivery_tag", &self.deliver.delivery_tag)
            .field("redelivered", &self.deliver.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> DeliveryInfo {
        DeliveryInfo {
            exchange: "x".into(),
            routing_key: "rk".into(),
            delivery_tag: 1,
            consumer_tag: "ct-1".into(),
            redelivered: false,
        }
    }

    #[test]
    fn data_decodes_json_body() {
        let registry = SerializationRegistry::default();
        let body = serde_json::to_vec(&42u32).unwrap();
        let mut props = MessageProperties::default();
        props.content_type = Some("application/json".into());
        let msg = Message::new(body, info(), props);
        let decoded: u32 = msg.data(&registry).unwrap();
        assert_eq!(decoded, 42);
    }

    #[test]
    fn default_correlation_id_is_filled_when_absent() {
        let props = MessageProperties::default().with_default_correlation_id();
        assert!(props.correlation_id.is_some());
    }
}
