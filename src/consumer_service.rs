//! A durable registration binding a queue (or exchange) to a typed callback
//! on a factory, with start/stop lifecycle (spec.md §4.5).
//!
//! Grounded on `_BaseConsumer`/`QueueConsumer`/`ExchangeConsumer` in
//! `twoost/amqp.py`: `start()` installs the consumer and waits for it to be
//! live, `stop()` cancels with a bounded timeout and never propagates its
//! error.

use std::sync::Arc;
use std::time::Duration;

use lapin::types::FieldTable;

use crate::error::Result;
use crate::factory::ReconnectingFactory;
use crate::message::Message;
use crate::protocol::ConsumeCallback;
use crate::serialization::SerializationRegistry;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

enum Target {
    Queue(String),
    Exchange { exchange: String, routing_key: String, bind_arguments: FieldTable },
}

/// Configuration for one `ConsumerService`.
pub struct ConsumerServiceConfig {
    pub no_ack: bool,
    pub parallel: i64,
    pub consumer_tag: Option<String>,
    pub requeue_delay: Option<Duration>,
    pub always_requeue: Option<bool>,
    pub stop_timeout: Duration,
    /// Whether each delivery is deserialised by content-type before reaching
    /// the handler (spec.md §4.5). When `false`, the handler's typed
    /// argument is `T::default()` and the handler reads the delivery body
    /// itself off the `Message` it's always given alongside it.
    pub deserialize: bool,
}

impl Default for ConsumerServiceConfig {
    fn default() -> Self {
        Self {
            no_ack: false,
            parallel: 1,
            consumer_tag: None,
            requeue_delay: None,
            always_requeue: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            deserialize: true,
        }
    }
}

/// A started-or-stopped consumer registration. `start` is idempotent only in
/// the sense that calling it twice installs two registrations; callers
/// typically hold one `ConsumerService` per logical subscription.
pub struct ConsumerService {
    factory: Arc<ReconnectingFactory>,
    target: Target,
    config: ConsumerServiceConfig,
    registry: Arc<SerializationRegistry>,
    consumer_tag: tokio::sync::Mutex<Option<String>>,
}

impl ConsumerService {
    pub fn for_queue(
        factory: Arc<ReconnectingFactory>,
        queue: impl Into<String>,
        config: ConsumerServiceConfig,
        registry: Arc<SerializationRegistry>,
    ) -> Self {
        Self {
            factory,
            target: Target::Queue(queue.into()),
            config,
            registry,
            consumer_tag: tokio::sync::Mutex::new(None),
        }
    }

    pub fn for_exchange(
        factory: Arc<ReconnectingFactory>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        bind_arguments: FieldTable,
        config: ConsumerServiceConfig,
        registry: Arc<SerializationRegistry>,
    ) -> Self {
        Self {
            factory,
            target: Target::Exchange {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                bind_arguments,
            },
            config,
            registry,
            consumer_tag: tokio::sync::Mutex::new(None),
        }
    }

    /// Install the consumer and return the (possibly generated) consumer
    /// tag. `handler` receives deserialised data when `config.deserialize`
    /// is true (the default); when false, deserialisation is skipped
    /// entirely and the handler is called with `T::default()`, reading the
    /// raw `Message` it's always given alongside it, matching spec.md
    /// §4.5's "each delivery is optionally deserialised by content-type
    /// before being handed to the user callback".
    pub async fn start<T, F, Fut>(&self, handler: F) -> Result<String>
    where
        T: serde::de::DeserializeOwned + Default + Send + 'static,
        F: Fn(T, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), ()>> + Send + 'static,
    {
        let registry = self.registry.clone();
        let handler = Arc::new(handler);
        let deserialize = self.config.deserialize;
        let callback: ConsumeCallback = Arc::new(move |message: Message| {
            let registry = registry.clone();
            let handler = handler.clone();
            Box::pin(async move {
                if !deserialize {
                    return handler(T::default(), message).await;
                }
                let decoded: T = match message.data(&registry) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::error!(%err, "failed to deserialize delivery, rejecting");
                        return Err(());
                    }
                };
                handler(decoded, message).await
            }) as futures_lite::future::Boxed<std::result::Result<(), ()>>
        });

        let tag = match &self.target {
            Target::Queue(queue) => {
                self.factory
                    .consume(
                        queue,
                        callback,
                        self.config.no_ack,
                        self.config.parallel,
                        self.config.consumer_tag.clone(),
                        self.config.requeue_delay,
                        self.config.always_requeue,
                        FieldTable::default(),
                    )
                    .await?
            }
            Target::Exchange { exchange, routing_key, bind_arguments } => {
                self.factory
                    .consume_exchange(
                        exchange,
                        callback,
                        self.config.no_ack,
                        self.config.parallel,
                        self.config.consumer_tag.clone(),
                        routing_key,
                        bind_arguments.clone(),
                        self.config.requeue_delay,
                        self.config.always_requeue,
                    )
                    .await?
            }
        };

        *self.consumer_tag.lock().await = Some(tag.clone());
        Ok(tag)
    }

    /// Cancel the consumer with a bounded timeout; errors (including
    /// timeout) are logged, never propagated, per spec.md §4.5.
    pub async fn stop(&self) {
        let tag = self.consumer_tag.lock().await.take();
        let Some(tag) = tag else { return };

        let result = tokio::time::timeout(self.config.stop_timeout, self.factory.cancel_consuming(&tag)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(%err, consumer_tag = %tag, "cancel_consuming failed"),
            Err(_) => tracing::error!(consumer_tag = %tag, timeout = ?self.config.stop_timeout, "cancel_consuming timed out"),
        }
    }
}
