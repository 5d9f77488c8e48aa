//! Declarative queue/exchange/binding schema, replayed on every (re)connect
//! (spec.md §4.2). Grounded on `twoost/amqp.py`'s `IAMQPSchemaBuilder` /
//! `schemaFromDict`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lapin::{types::FieldTable, ExchangeKind};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ExchangeDecl {
    pub name: String,
    pub exchange_type: ExchangeKind,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl Default for ExchangeDecl {
    fn default() -> Self {
        Self {
            name: String::new(),
            exchange_type: ExchangeKind::Direct,
            passive: false,
            durable: false,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueDecl {
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub message_ttl: Option<u32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub arguments: FieldTable,
}

impl QueueDecl {
    /// Merge `message_ttl` / `dead_letter_exchange[+routing_key]` into
    /// `arguments` as `x-message-ttl` / `x-dead-letter-exchange` /
    /// `x-dead-letter-routing-key`, exactly as `declareQueue` does in
    /// `twoost/amqp.py`.
    pub fn merged_arguments(&self) -> FieldTable {
        let mut args = self.arguments.clone();
        if let Some(ttl) = self.message_ttl {
            args.insert("x-message-ttl".into(), lapin::types::AMQPValue::LongUInt(ttl));
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                lapin::types::AMQPValue::LongString(dlx.as_str().into()),
            );
            if let Some(rk) = &self.dead_letter_routing_key {
                args.insert(
                    "x-dead-letter-routing-key".into(),
                    lapin::types::AMQPValue::LongString(rk.as_str().into()),
                );
            }
        }
        args
    }
}

#[derive(Debug, Clone, Default)]
pub struct BindingDecl {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeBindingDecl {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// A capability any connection handshake can declare a schema against —
/// `IAMQPSchemaBuilder` in `twoost/amqp.py`, realized as an async trait over
/// the two write channels `Protocol` owns.
#[async_trait]
pub trait SchemaBuilder: Send + Sync {
    async fn declare_exchange(&self, decl: &ExchangeDecl) -> Result<()>;
    async fn declare_queue(&self, decl: &QueueDecl) -> Result<()>;
    async fn bind_queue(&self, decl: &BindingDecl) -> Result<()>;
    async fn bind_exchange(&self, decl: &ExchangeBindingDecl) -> Result<()>;
}

/// An ordered collection of declarations, replayed sequentially
/// (await-each-before-the-next) on every handshake.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub exchanges: Vec<ExchangeDecl>,
    pub queues: Vec<QueueDecl>,
    pub bindings: Vec<BindingDecl>,
    pub exchange_bindings: Vec<ExchangeBindingDecl>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn declare(&self, builder: &dyn SchemaBuilder) -> Result<()> {
        for exchange in &self.exchanges {
            builder.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            builder.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            builder.bind_queue(binding).await?;
        }
        for binding in &self.exchange_bindings {
            builder.bind_exchange(binding).await?;
        }
        Ok(())
    }
}

// --- mapping-shaped schema (spec.md §6) ---

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExchangeMapEntry {
    #[serde(default, rename = "type")]
    pub exchange_type: Option<String>,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueueMapEntry {
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub message_ttl: Option<u32>,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub dead_letter_exchange_rk: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BindEntry {
    Tuple(Vec<String>),
    Object { exchange: String, queue: String, #[serde(default)] routing_key: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BindExchangeEntry {
    Tuple(Vec<String>),
    Object { source: String, destination: String, #[serde(default)] routing_key: String },
}

/// The JSON/mapping schema shape from spec.md §6.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchemaMap {
    #[serde(default)]
    pub exchange: BTreeMap<String, ExchangeMapEntry>,
    #[serde(default)]
    pub queue: BTreeMap<String, QueueMapEntry>,
    #[serde(default)]
    pub bind: Vec<BindEntry>,
    #[serde(default)]
    pub bind_exchange: Vec<BindExchangeEntry>,
}

fn parse_exchange_kind(kind: Option<&str>) -> ExchangeKind {
    match kind.unwrap_or("direct") {
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Direct,
    }
}

impl From<SchemaMap> for Schema {
    fn from(map: SchemaMap) -> Self {
        let mut schema = Schema::new();

        for (name, entry) in map.exchange {
            schema.exchanges.push(ExchangeDecl {
                name,
                exchange_type: parse_exchange_kind(entry.exchange_type.as_deref()),
                passive: entry.passive,
                durable: entry.durable,
                auto_delete: entry.auto_delete,
                internal: entry.internal,
                arguments: FieldTable::default(),
            });
        }

        for (name, entry) in map.queue {
            schema.queues.push(QueueDecl {
                name,
                passive: entry.passive,
                durable: entry.durable,
                exclusive: entry.exclusive,
                auto_delete: entry.auto_delete,
                message_ttl: entry.message_ttl,
                dead_letter_exchange: entry.dead_letter_exchange,
                dead_letter_routing_key: entry.dead_letter_exchange_rk,
                arguments: FieldTable::default(),
            });
        }

        for bind in map.bind {
            let binding = match bind {
                BindEntry::Tuple(parts) => BindingDecl {
                    exchange: parts.first().cloned().unwrap_or_default(),
                    queue: parts.get(1).cloned().unwrap_or_default(),
                    routing_key: parts.get(2).cloned().unwrap_or_default(),
                    arguments: FieldTable::default(),
                },
                BindEntry::Object { exchange, queue, routing_key } => {
                    BindingDecl { exchange, queue, routing_key, arguments: FieldTable::default() }
                }
            };
            schema.bindings.push(binding);
        }

        for bind in map.bind_exchange {
            let binding = match bind {
                BindExchangeEntry::Tuple(parts) => ExchangeBindingDecl {
                    source: parts.first().cloned().unwrap_or_default(),
                    destination: parts.get(1).cloned().unwrap_or_default(),
                    routing_key: parts.get(2).cloned().unwrap_or_default(),
                    arguments: FieldTable::default(),
                },
                BindExchangeEntry::Object { source, destination, routing_key } => {
                    ExchangeBindingDecl { source, destination, routing_key, arguments: FieldTable::default() }
                }
            };
            schema.exchange_bindings.push(binding);
        }

        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn message_ttl_and_dlx_merge_into_arguments() {
        let decl = QueueDecl {
            name: "q".into(),
            message_ttl: Some(1000),
            dead_letter_exchange: Some("dlx".into()),
            dead_letter_routing_key: Some("dlx-rk".into()),
            ..Default::default()
        };
        let args = decl.merged_arguments();
        assert!(matches!(args.inner().get("x-message-ttl"), Some(lapin::types::AMQPValue::LongUInt(1000))));
        assert!(args.inner().contains_key("x-dead-letter-exchange"));
        assert!(args.inner().contains_key("x-dead-letter-routing-key"));
    }

    #[test]
    fn dlx_routing_key_omitted_without_dlx() {
        let decl = QueueDecl { name: "q".into(), ..Default::default() };
        let args = decl.merged_arguments();
        assert!(args.inner().is_empty());
    }

    #[derive(Default)]
    struct RecordingBuilder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SchemaBuilder for RecordingBuilder {
        async fn declare_exchange(&self, decl: &ExchangeDecl) -> Result<()> {
            self.calls.lock().unwrap().push(format!("exchange:{}", decl.name));
            Ok(())
        }
        async fn declare_queue(&self, decl: &QueueDecl) -> Result<()> {
            self.calls.lock().unwrap().push(format!("queue:{}", decl.name));
            Ok(())
        }
        async fn bind_queue(&self, decl: &BindingDecl) -> Result<()> {
            self.calls.lock().unwrap().push(format!("bind:{}->{}", decl.exchange, decl.queue));
            Ok(())
        }
        async fn bind_exchange(&self, decl: &ExchangeBindingDecl) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("bind_exchange:{}->{}", decl.source, decl.destination));
            Ok(())
        }
    }

    #[tokio::test]
    async fn declare_order_is_exchanges_then_queues_then_bindings() {
        let mut schema = Schema::new();
        schema.exchanges.push(ExchangeDecl { name: "ex1".into(), ..Default::default() });
        schema.queues.push(QueueDecl { name: "q1".into(), ..Default::default() });
        schema.bindings.push(BindingDecl {
            exchange: "ex1".into(),
            queue: "q1".into(),
            ..Default::default()
        });
        schema.exchange_bindings.push(ExchangeBindingDecl {
            source: "ex1".into(),
            destination: "ex2".into(),
            ..Default::default()
        });

        let builder = RecordingBuilder::default();
        schema.declare(&builder).await.unwrap();

        let calls = builder.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "exchange:ex1".to_string(),
                "queue:q1".to_string(),
                "bind:ex1->q1".to_string(),
                "bind_exchange:ex1->ex2".to_string(),
            ]
        );
    }

    #[test]
    fn schema_map_tuple_bind_converts() {
        let json = serde_json::json!({
            "exchange": { "ex1": { "type": "topic", "durable": true } },
            "queue": { "q1": { "durable": true, "message_ttl": 500 } },
            "bind": [["ex1", "q1", "rk"]],
            "bind_exchange": [["ex1", "ex2", ""]],
        });
        let map: SchemaMap = serde_json::from_value(json).unwrap();
        let schema: Schema = map.into();
        assert_eq!(schema.exchanges.len(), 1);
        assert_eq!(schema.exchanges[0].exchange_type, ExchangeKind::Topic);
        assert_eq!(schema.queues[0].message_ttl, Some(500));
        assert_eq!(schema.bindings[0].routing_key, "rk");
        assert_eq!(schema.exchange_bindings[0].destination, "ex2");
    }
}
