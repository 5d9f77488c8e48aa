//! Multi-endpoint supervisor: named factories, sender closures, ordered
//! shutdown (spec.md §4.6).
//!
//! Grounded on `AMQPService`/`_ClientWithConsumersContainer` in
//! `twoost/amqp.py`.

use std::collections::HashMap;
use std::sync::Arc;

use lapin::types::FieldTable;
use tokio::sync::RwLock;

use crate::config::FactoryConfig;
use crate::consumer_service::{ConsumerService, ConsumerServiceConfig};
use crate::error::{Error, Result};
use crate::factory::ReconnectingFactory;
use crate::message::{Message, MessageProperties};
use crate::schema::Schema;
use crate::serialization::SerializationRegistry;

/// Either a fixed routing key or a per-message routing-key function, as
/// spec.md §4.6's `makeSender` allows exactly one of the two.
pub enum RoutingKey<T> {
    Fixed(String),
    Computed(Box<dyn Fn(&T) -> String + Send + Sync>),
}

impl<T> RoutingKey<T> {
    fn resolve(&self, value: &T) -> String {
        match self {
            RoutingKey::Fixed(rk) => rk.clone(),
            RoutingKey::Computed(f) => f(value),
        }
    }
}

impl<T> Default for RoutingKey<T> {
    fn default() -> Self {
        RoutingKey::Fixed(String::new())
    }
}

type FactoryMap = Arc<RwLock<HashMap<String, Arc<ReconnectingFactory>>>>;

/// Holds every named connection and the consumer services installed against
/// them. Safe for concurrent use — each named factory is independently
/// reconnecting (spec.md §5).
pub struct Supervisor {
    registry: Arc<SerializationRegistry>,
    factories: FactoryMap,
    consumer_services: RwLock<Vec<Arc<ConsumerService>>>,
}

impl Supervisor {
    pub fn new(registry: Arc<SerializationRegistry>) -> Self {
        Self {
            registry,
            factories: Arc::new(RwLock::new(HashMap::new())),
            consumer_services: RwLock::new(Vec::new()),
        }
    }

    /// Construct and start a factory under `name` (spec.md §4.6
    /// `addConnection`).
    pub async fn add_connection(&self, name: impl Into<String>, config: FactoryConfig, schema: Schema) {
        let name = name.into();
        let factory = ReconnectingFactory::start(config, schema, self.registry.clone(), name.clone());
        self.factories.write().await.insert(name, factory);
    }

    async fn factory(&self, name: &str) -> Result<Arc<ReconnectingFactory>> {
        self.factories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SchemaDeclarationError(format!("no connection named {name:?}")))
    }

    /// Install a queue consumer under the named factory (spec.md §4.6
    /// `setupQueueConsuming`).
    pub async fn setup_queue_consuming<T, F, Fut>(
        &self,
        name: &str,
        queue: impl Into<String>,
        config: ConsumerServiceConfig,
        handler: F,
    ) -> Result<Arc<ConsumerService>>
    where
        T: serde::de::DeserializeOwned + Default + Send + 'static,
        F: Fn(T, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), ()>> + Send + 'static,
    {
        let factory = self.factory(name).await?;
        let service = Arc::new(ConsumerService::for_queue(factory, queue, config, self.registry.clone()));
        service.start(handler).await?;
        self.consumer_services.write().await.push(service.clone());
        Ok(service)
    }

    /// Install an exchange consumer under the named factory (spec.md §4.6
    /// `setupExchangeConsuming`).
    #[allow(clippy::too_many_arguments)]
    pub async fn setup_exchange_consuming<T, F, Fut>(
        &self,
        name: &str,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        bind_arguments: FieldTable,
        config: ConsumerServiceConfig,
        handler: F,
    ) -> Result<Arc<ConsumerService>>
    where
        T: serde::de::DeserializeOwned + Default + Send + 'static,
        F: Fn(T, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), ()>> + Send + 'static,
    {
        let factory = self.factory(name).await?;
        let service = Arc::new(ConsumerService::for_exchange(
            factory,
            exchange,
            routing_key,
            bind_arguments,
            config,
            self.registry.clone(),
        ));
        service.start(handler).await?;
        self.consumer_services.write().await.push(service.clone());
        Ok(service)
    }

    /// Build a send closure bound to one named factory, exchange and
    /// routing-key rule (spec.md §4.6 `makeSender`).
    pub fn make_sender<T>(
        &self,
        name: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: RoutingKey<T>,
        content_type: impl Into<String>,
        confirm: bool,
    ) -> Sender<T>
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        Sender {
            factories: self.factories.clone(),
            name: name.into(),
            exchange: exchange.into(),
            routing_key,
            content_type: content_type.into(),
            confirm,
            registry: self.registry.clone(),
        }
    }

    /// Stop every consumer first, then every factory, in that order (spec.md
    /// §4.6 "Shutdown").
    pub async fn shutdown(&self) {
        let services = self.consumer_services.write().await.split_off(0);
        for service in &services {
            service.stop().await;
        }
        for factory in self.factories.read().await.values() {
            factory.shutdown();
        }
    }
}

/// A bound publish closure returned by [`Supervisor::make_sender`].
pub struct Sender<T> {
    factories: FactoryMap,
    name: String,
    exchange: String,
    routing_key: RoutingKey<T>,
    content_type: String,
    confirm: bool,
    registry: Arc<SerializationRegistry>,
}

impl<T> Sender<T>
where
    T: serde::Serialize + Send + Sync + 'static,
{
    pub async fn send(&self, value: &T) -> Result<()> {
        let factory = self
            .factories
            .read()
            .await
            .get(&self.name)
            .cloned()
            .ok_or_else(|| Error::SchemaDeclarationError(format!("no connection named {:?}", self.name)))?;

        let body = self.registry.encode(value, &self.content_type)?;
        let routing_key = self.routing_key.resolve(value);
        let handle = factory
            .publish(
                &self.exchange,
                &routing_key,
                &body,
                Some(&self.content_type),
                MessageProperties::default().with_default_correlation_id(),
                None,
                self.confirm,
            )
            .await?;
        handle.wait().await
    }
}
