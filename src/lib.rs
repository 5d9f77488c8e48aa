//! Resilient AMQP 0-9-1 client: reconnecting publish-with-confirm and
//! consume-with-retry on top of [`lapin`].
//!
//! Layers, leaves first:
//! - [`serialization`] — content-type keyed encode/decode registry.
//! - [`message`] — the flat `Message` value handed to consumer callbacks.
//! - [`schema`] — declarative exchange/queue/binding declarations, replayed
//!   on every (re)connect.
//! - [`confirm`] / [`delayed_reject`] / [`consume`] — pure bookkeeping used
//!   by the connection protocol; each is independently unit-tested without a
//!   broker.
//! - [`protocol`] — one live AMQP connection: handshake, dual write
//!   channels, publish, consume loops.
//! - [`factory`] — keeps one logical endpoint alive across reconnects.
//! - [`consumer_service`] — a durable (queue|exchange, callback) registration
//!   with start/stop lifecycle.
//! - [`supervisor`] — named factories, consumer services, and sender
//!   closures under one root.

#[forbid(unsafe_code)]
#[macro_use]
extern crate tracing;

pub mod config;
pub mod confirm;
pub mod consume;
pub mod consumer_service;
pub mod delayed_reject;
pub mod error;
pub mod factory;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod schema;
pub mod serialization;
pub mod supervisor;

pub use config::{ConnectionParameters, FactoryConfig, TlsConfig};
pub use error::{Error, Result};
pub use factory::ReconnectingFactory;
pub use message::{DeliveryInfo, Message, MessageProperties};
pub use protocol::{ConsumeCallback, Protocol};
pub use schema::{BindingDecl, ExchangeBindingDecl, ExchangeDecl, QueueDecl, Schema, SchemaBuilder};
pub use serialization::SerializationRegistry;
pub use supervisor::{RoutingKey, Sender, Supervisor};
