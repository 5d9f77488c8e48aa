//! The connection protocol: one AMQP connection, its two write channels,
//! publish-confirm tracking, consume loops and the requeue scheduler
//! (spec.md §4.3). Grounded end-to-end on `_AMQPProtocol` in
//! `twoost/amqp.py`, translated from Twisted deferreds into `lapin`'s async
//! API.
//!
//! **Adaptation note** (see DESIGN.md): `twoost`'s pika-based confirm model
//! registers a raw ack/nack callback and resolves a delivery-tag table
//! itself, including ascending multi-ack batches. `lapin` already resolves
//! the wire-level multi-ack grouping internally and hands back one
//! [`lapin::publisher_confirm::Confirmation`] per publish future. We keep our
//! own [`ConfirmTable`] (exercised directly, and unit-tested, with its full
//! single/multiple-ack API) as the bookkeeping layer spec.md §3/§8 describes,
//! but the live glue code below resolves each entry with `multiple: false`
//! since `lapin` has already done that grouping for us — the table's
//! `multiple` path exists for direct callers and for the documented
//! behavior, not because we re-parse raw AMQP method frames ourselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, ExchangeBindOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_amqp::LapinTokioExt;

use crate::confirm::{ConfirmHandle, ConfirmTable};
use crate::consume::{
    cleanup_delayed_rejects, decide_rejection, ConcurrencyGate, ConsumeState, ConsumerRegistration,
    InboxItem, LoopExit, RejectDecision, DEFAULT_DELAYED_REJECTIONS_LIMIT,
};
use crate::delayed_reject::DelayedRejectTable;
use crate::error::{Error, Result};
use crate::message::{DeliveryInfo, Message, MessageProperties};
use crate::metrics;
use crate::schema::{BindingDecl, ExchangeBindingDecl, ExchangeDecl, QueueDecl, Schema, SchemaBuilder};
use crate::serialization::SerializationRegistry;

/// Callback invoked per delivery by a consumer; `Ok` acks (or is ignored in
/// no-ack mode), `Err` drives the rejection policy (spec.md §4.3.2).
pub type ConsumeCallback =
    Arc<dyn Fn(Message) -> futures_lite::future::Boxed<std::result::Result<(), ()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolState {
    Connecting,
    Handshaking,
    Ready,
    Draining,
    Closed,
}

struct ProtocolInner {
    connection: Connection,
    write_channel: tokio::sync::RwLock<Channel>,
    safe_write_channel: tokio::sync::RwLock<Option<Channel>>,
    confirm_table: ConfirmTable,
    consume_state: Mutex<ConsumeState>,
    delayed_reject: DelayedRejectTable,
    exclusive_queues: Mutex<HashMap<String, (String, bool)>>,
    schema: Schema,
    prefetch_count: Option<u16>,
    always_requeue: bool,
    requeue_delay: Duration,
    delayed_rejections_limit: usize,
    registry: Arc<SerializationRegistry>,
    ready_for_publish: AtomicBool,
    state: Mutex<ProtocolState>,
    conn_name: String,
    closed_tx: tokio::sync::watch::Sender<bool>,
    closed_rx: tokio::sync::watch::Receiver<bool>,
}

/// One live AMQP connection and everything it owns. Cheap to clone (an
/// `Arc` handle); clones share the same underlying connection.
#[derive(Clone)]
pub struct Protocol(Arc<ProtocolInner>);

#[async_trait::async_trait]
impl SchemaBuilder for Protocol {
    async fn declare_exchange(&self, decl: &ExchangeDecl) -> Result<()> {
        let channel = self.0.write_channel.read().await;
        channel
            .exchange_declare(
                &decl.name,
                decl.exchange_type.clone(),
                ExchangeDeclareOptions {
                    passive: decl.passive,
                    durable: decl.durable,
                    auto_delete: decl.auto_delete,
                    internal: decl.internal,
                    nowait: false,
                },
                decl.arguments.clone(),
            )
            .await
            .map_err(|e| Error::SchemaDeclarationError(e.to_string()))
    }

    async fn declare_queue(&self, decl: &QueueDecl) -> Result<()> {
        let channel = self.0.write_channel.read().await;
        channel
            .queue_declare(
                &decl.name,
                QueueDeclareOptions {
                    passive: decl.passive,
                    durable: decl.durable,
                    exclusive: decl.exclusive,
                    auto_delete: decl.auto_delete,
                    nowait: false,
                },
                decl.merged_arguments(),
            )
            .await
            .map_err(|e| Error::SchemaDeclarationError(e.to_string()))?;
        Ok(())
    }

    async fn bind_queue(&self, decl: &BindingDecl) -> Result<()> {
        let channel = self.0.write_channel.read().await;
        channel
            .queue_bind(
                &decl.queue,
                &decl.exchange,
                &decl.routing_key,
                QueueBindOptions::default(),
                decl.arguments.clone(),
            )
            .await
            .map_err(|e| Error::SchemaDeclarationError(e.to_string()))
    }

    async fn bind_exchange(&self, decl: &ExchangeBindingDecl) -> Result<()> {
        let channel = self.0.write_channel.read().await;
        channel
            .exchange_bind(
                &decl.destination,
                &decl.source,
                &decl.routing_key,
                ExchangeBindOptions::default(),
                decl.arguments.clone(),
            )
            .await
            .map_err(|e| Error::SchemaDeclarationError(e.to_string()))
    }
}

impl Protocol {
    /// Connect and run the full handshake (spec.md §4.3 "Handshake"):
    /// open the write channel, open+enable-confirms on the safe-write
    /// channel, replay the schema, then mark ready.
    pub async fn connect(
        uri: &str,
        connection_properties: ConnectionProperties,
        schema: Schema,
        prefetch_count: Option<u16>,
        always_requeue: bool,
        requeue_delay: Duration,
        registry: Arc<SerializationRegistry>,
        conn_name: impl Into<String>,
    ) -> Result<Self> {
        let conn_name = conn_name.into();
        tracing::info!(connection = %conn_name, "connecting to amqp broker");

        let connection = Connection::connect(uri, connection_properties.with_tokio())
            .await
            .map_err(|e| classify_connect_error(e))?;

        let (closed_tx, closed_rx) = tokio::sync::watch::channel(false);
        let closed_tx_for_handler = closed_tx.clone();
        connection.on_error(move |err| {
            tracing::warn!(%err, "amqp connection closed");
            let _ = closed_tx_for_handler.send(true);
        });

        let write_channel = connection.create_channel().await?;

        let safe_write_channel = match connection.create_channel().await {
            Ok(channel) => match channel.confirm_select(ConfirmSelectOptions::default()).await {
                Ok(()) => Some(channel),
                Err(err) => {
                    tracing::warn!(%err, "broker rejected confirm.select, publishing with confirm=true will fail");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(%err, "failed to open safe-write channel");
                None
            }
        };

        let inner = Arc::new(ProtocolInner {
            connection,
            write_channel: tokio::sync::RwLock::new(write_channel),
            safe_write_channel: tokio::sync::RwLock::new(safe_write_channel),
            confirm_table: ConfirmTable::new(),
            consume_state: Mutex::new(ConsumeState::new()),
            delayed_reject: DelayedRejectTable::new(),
            exclusive_queues: Mutex::new(HashMap::new()),
            schema,
            prefetch_count,
            always_requeue,
            requeue_delay,
            delayed_rejections_limit: DEFAULT_DELAYED_REJECTIONS_LIMIT,
            registry,
            ready_for_publish: AtomicBool::new(false),
            state: Mutex::new(ProtocolState::Handshaking),
            conn_name,
            closed_tx,
            closed_rx,
        });

        let protocol = Protocol(inner);

        install_write_channel_reopen(protocol.weak(), protocol.0.write_channel.read().await.clone());
        if let Some(channel) = protocol.0.safe_write_channel.read().await.clone() {
            install_safe_write_channel_reopen(protocol.weak(), channel);
        }

        tracing::debug!("declaring schema");
        let schema = protocol.0.schema.clone();
        schema.declare(&protocol).await?;
        tracing::info!("amqp schema declared");

        protocol.0.ready_for_publish.store(true, Ordering::SeqCst);
        *protocol.0.state.lock().unwrap() = ProtocolState::Ready;
        tracing::info!(connection = %protocol.0.conn_name, "handshake complete, ready for publish");

        Ok(protocol)
    }

    pub fn ready_for_publish(&self) -> bool {
        self.0.ready_for_publish.load(Ordering::SeqCst)
    }

    /// Resolves once the underlying connection reports a close, letting a
    /// `ReconnectingFactory` drive `connection_lost` + reconnect without
    /// polling. Safe to call from multiple tasks; each gets its own
    /// receiver clone.
    pub async fn wait_closed(&self) {
        let mut rx = self.0.closed_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn weak(&self) -> Weak<ProtocolInner> {
        Arc::downgrade(&self.0)
    }

    /// Publish a message (spec.md §4.3 "Publish").
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: Option<&str>,
        mut properties: MessageProperties,
        ttl: Option<Duration>,
        confirm: bool,
    ) -> Result<ConfirmHandle> {
        if !self.ready_for_publish() {
            return Err(Error::NotReady);
        }

        if let Some(ct) = content_type {
            properties.content_type = Some(ct.to_string());
        }
        if let Some(ttl) = ttl {
            properties.expiration = Some(ttl.as_secs().to_string());
        }

        let props = to_basic_properties(&properties);
        let _duration_timer = metrics::publisher_duration(&self.0.conn_name, exchange, routing_key).start_timer();

        if confirm {
            let safe_write = self.0.safe_write_channel.read().await;
            let Some(channel) = safe_write.as_ref() else {
                return Err(Error::ConfirmsUnsupported);
            };
            let (tag, handle) = self.0.confirm_table.register();
            metrics::pending_confirms(&self.0.conn_name).set(self.0.confirm_table.len() as i64);

            let publish = channel
                .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, props)
                .await?;

            let confirm_table = Weak::clone(&self.weak());
            let conn_name = self.0.conn_name.clone();
            tokio::spawn(async move {
                let outcome = publish.await;
                if let Some(inner) = confirm_table.upgrade() {
                    match outcome {
                        Ok(Confirmation::Ack(_)) => inner.confirm_table.resolve_ack(tag, false),
                        Ok(Confirmation::Nack(_)) => inner.confirm_table.resolve_nack(tag, false),
                        Ok(Confirmation::NotRequested) => inner.confirm_table.resolve_ack(tag, false),
                        Err(err) => {
                            tracing::warn!(%err, "publisher confirm future errored, resolving as connection lost");
                            inner.confirm_table.fail_one_connection_lost(tag);
                        }
                    }
                    metrics::pending_confirms(&conn_name).set(inner.confirm_table.len() as i64);
                }
            });

            Ok(handle)
        } else {
            let write_channel = self.0.write_channel.read().await;
            write_channel
                .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, props)
                .await?;
            Ok(ConfirmHandle::resolved_ok())
        }
    }

    /// Set up a new consumer (spec.md §4.3 "Consume setup").
    pub async fn consume(
        &self,
        queue: &str,
        callback: ConsumeCallback,
        no_ack: bool,
        parallel: i64,
        consumer_tag: Option<String>,
        requeue_delay: Option<Duration>,
        always_requeue: Option<bool>,
        extra_args: FieldTable,
    ) -> Result<String> {
        let channel = self.0.connection.create_channel().await?;

        if let Some(prefetch_count) = self.0.prefetch_count {
            channel
                .basic_qos(prefetch_count, BasicQosOptions { global: false })
                .await?;
        }

        let options = BasicConsumeOptions { no_ack, ..Default::default() };
        let consumer = channel
            .basic_consume(queue, consumer_tag.as_deref().unwrap_or(""), options, extra_args.clone())
            .await?;
        let consumer_tag = consumer.tag().to_string();

        let requeue_delay = requeue_delay.unwrap_or(self.0.requeue_delay);
        let always_requeue = always_requeue.unwrap_or(self.0.always_requeue);
        let local_cancel = Arc::new(AtomicBool::new(false));

        self.0.consume_state.lock().unwrap().insert(ConsumerRegistration {
            consumer_tag: consumer_tag.clone(),
            queue: queue.to_string(),
            no_ack,
            parallel,
            requeue_delay,
            always_requeue,
            channel: channel.clone(),
            local_cancel: local_cancel.clone(),
        });

        self.install_auto_reconsume(
            channel.clone(),
            queue.to_string(),
            callback.clone(),
            no_ack,
            parallel,
            consumer_tag.clone(),
            requeue_delay,
            always_requeue,
            extra_args,
        );

        self.spawn_consume_loop(consumer, channel, callback, no_ack, parallel, consumer_tag.clone(), local_cancel);

        tracing::debug!(consumer_tag = %consumer_tag, queue, "consumer installed");
        Ok(consumer_tag)
    }

    /// Spec.md §4.3 "Auto-reconsume": when the broker closes a consumer's
    /// channel, re-issue `consume(...)` with the preserved state including
    /// the original `consumer_tag`. A failure here surrenders the consumer
    /// to the next full reconnect.
    #[allow(clippy::too_many_arguments)]
    fn install_auto_reconsume(
        &self,
        channel: Channel,
        queue: String,
        callback: ConsumeCallback,
        no_ack: bool,
        parallel: i64,
        consumer_tag: String,
        requeue_delay: Duration,
        always_requeue: bool,
        extra_args: FieldTable,
    ) {
        let protocol = self.clone();
        channel.on_error(move |err| {
            let protocol = protocol.clone();
            let queue = queue.clone();
            let callback = callback.clone();
            let consumer_tag = consumer_tag.clone();
            let extra_args = extra_args.clone();
            let reason = err.to_string();
            tokio::spawn(async move {
                tracing::warn!(err = %reason, consumer_tag = %consumer_tag, queue, "consumer channel closed by broker, auto-reconsuming");
                let result = protocol
                    .consume(
                        &queue,
                        callback,
                        no_ack,
                        parallel,
                        Some(consumer_tag.clone()),
                        Some(requeue_delay),
                        Some(always_requeue),
                        extra_args,
                    )
                    .await;
                if let Err(err) = result {
                    tracing::error!(%err, consumer_tag = %consumer_tag, "auto-reconsume failed, surrendering consumer to next reconnect");
                }
            });
        });
    }

    /// Exclusive-queue "consume-exchange" sugar (spec.md §4.3
    /// "Consume-exchange").
    pub async fn consume_exchange(
        &self,
        exchange: &str,
        callback: ConsumeCallback,
        no_ack: bool,
        parallel: i64,
        consumer_tag: Option<String>,
        routing_key: &str,
        bind_arguments: FieldTable,
        requeue_delay: Option<Duration>,
        always_requeue: Option<bool>,
    ) -> Result<String> {
        let write_channel = self.0.write_channel.read().await;
        let queue = write_channel
            .queue_declare(
                "",
                QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        let queue_name = queue.name().to_string();
        drop(write_channel);

        let write_channel = self.0.write_channel.read().await;
        write_channel
            .queue_bind(&queue_name, exchange, routing_key, QueueBindOptions::default(), bind_arguments)
            .await?;
        drop(write_channel);

        let ct = self
            .consume(
                &queue_name,
                callback,
                no_ack,
                parallel,
                consumer_tag,
                requeue_delay,
                always_requeue,
                FieldTable::default(),
            )
            .await?;

        self.0.exclusive_queues.lock().unwrap().insert(ct.clone(), (queue_name, no_ack));
        Ok(ct)
    }

    /// Cancel an active consumer (spec.md §4.3 "Cancel consuming").
    pub async fn cancel_consuming(&self, consumer_tag: &str) -> Result<()> {
        let registration = self.0.consume_state.lock().unwrap().remove(consumer_tag);
        let Some(registration) = registration else {
            tracing::warn!(consumer_tag, "cancel_consuming: unknown consumer tag");
            return Ok(());
        };

        // Tell the consume loop this is a local cancel before it notices its
        // stream ending, so its own exit handling (not us) rejects-with-
        // requeue any buffered ack-mode deliveries per spec.md §4.3.3.
        registration.local_cancel.store(true, Ordering::SeqCst);

        if let Err(err) = registration
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
        {
            tracing::error!(%err, consumer_tag, "basic.cancel failed");
        }

        if let Some((queue, no_ack)) = self.0.exclusive_queues.lock().unwrap().remove(consumer_tag) {
            let result = if no_ack {
                self.0.write_channel.read().await.queue_delete(&queue, QueueDeleteOptions::default()).await
            } else {
                match self.0.safe_write_channel.read().await.as_ref() {
                    Some(channel) => channel.queue_delete(&queue, QueueDeleteOptions::default()).await,
                    None => self.0.write_channel.read().await.queue_delete(&queue, QueueDeleteOptions::default()).await,
                }
            };
            if let Err(err) = result {
                tracing::error!(%err, queue, "failed to delete exclusive queue on cancel");
            }
        }

        // Cleanup of this consumer's delayed-reject timers happens in the
        // consume loop's own exit handling once it observes the cancel,
        // using `local_cancel` to decide whether to reject-with-requeue.
        Ok(())
    }

    /// Connection lost teardown (spec.md §4.3 "Connection lost"). Closes the
    /// underlying connection and awaits it so its heartbeat task is stopped
    /// before returning — `ReconnectingFactory`'s reconnect loop awaits this
    /// before attempting the next connect, per spec.md §4.4's "any heartbeat
    /// task associated with the Protocol is stopped before the Factory
    /// begins reconnect".
    pub async fn connection_lost(&self) {
        self.0.ready_for_publish.store(false, Ordering::SeqCst);
        *self.0.state.lock().unwrap() = ProtocolState::Closed;

        if let Err(err) = self.0.connection.close(200, "connection lost").await {
            tracing::debug!(%err, "closing already-lost connection, heartbeat task stops regardless");
        }

        let registrations = self.0.consume_state.lock().unwrap().drain();
        for registration in &registrations {
            cleanup_delayed_rejects(&self.0.delayed_reject, &registration.consumer_tag, false).await;
        }
        self.0.delayed_reject.drain_all();
        self.0.confirm_table.fail_all_connection_lost();
        metrics::pending_confirms(&self.0.conn_name).set(0);
    }

    fn spawn_consume_loop(
        &self,
        mut consumer: lapin::Consumer,
        channel: Channel,
        callback: ConsumeCallback,
        no_ack: bool,
        parallel: i64,
        consumer_tag: String,
        local_cancel: Arc<AtomicBool>,
    ) {
        let inner = self.0.clone();
        let registry = self.0.registry.clone();
        let conn_name = self.0.conn_name.clone();

        tokio::spawn(async move {
            use futures_lite::StreamExt;

            metrics::consumer_started(&conn_name, &consumer_tag);
            let gate = ConcurrencyGate::new(parallel);
            let mut exit_reason = LoopExit::Terminator;

            loop {
                let _permit = gate.acquire().await;

                let next = consumer.next().await;
                let item = match next {
                    Some(Ok(delivery)) => {
                        InboxItem::Delivery(Box::new(delivery_to_message(delivery, &consumer_tag)))
                    }
                    Some(Err(_err)) => {
                        exit_reason = LoopExit::UnexpectedError;
                        break;
                    }
                    None => {
                        exit_reason = LoopExit::Terminator;
                        break;
                    }
                };

                let InboxItem::Delivery(msg) = item else { break };

                let inner2 = inner.clone();
                let channel2 = channel.clone();
                let callback2 = callback.clone();
                let consumer_tag2 = consumer_tag.clone();
                let _registry = registry.clone();

                tokio::spawn(async move {
                    process_delivery(inner2, channel2, callback2, *msg, no_ack, consumer_tag2).await;
                });
            }

            metrics::consumer_stopped(&conn_name, &consumer_tag);
            tracing::debug!(consumer_tag = %consumer_tag, ?exit_reason, "consume loop exited");

            // Auto-reconsume may have already replaced this tag's
            // registration with a fresh channel by the time this loop
            // notices its own channel died; only clean up if we're still
            // the current owner, so we don't drain timers that belong to
            // the replacement consumer.
            let still_current = inner
                .consume_state
                .lock()
                .unwrap()
                .get(&consumer_tag)
                .map(|r| r.channel.id() == channel.id())
                .unwrap_or(true);
            if still_current {
                // Only a local `cancel_consuming` rejects-with-requeue; a
                // broker-initiated close or connection loss does not, per
                // spec.md §4.3.3.
                let do_reject = local_cancel.load(Ordering::SeqCst) && !no_ack;
                cleanup_delayed_rejects(&inner.delayed_reject, &consumer_tag, do_reject).await;
            }
        });
    }
}

async fn process_delivery(
    inner: Arc<ProtocolInner>,
    channel: Channel,
    callback: ConsumeCallback,
    msg: Message,
    no_ack: bool,
    consumer_tag: String,
) {
    let delivery_tag = msg.delivery_tag();
    let redelivered = msg.redelivered();
    let queue = inner
        .consume_state
        .lock()
        .unwrap()
        .get(&consumer_tag)
        .map(|r| r.queue.clone())
        .unwrap_or_default();
    let _duration_timer = metrics::consumer_duration(&inner.conn_name, &queue).start_timer();

    let outcome = callback(msg).await;

    if no_ack {
        if outcome.is_err() {
            tracing::error!(consumer_tag = %consumer_tag, delivery_tag, "callback failed in no-ack mode (ignored)");
        }
        return;
    }

    match outcome {
        Ok(()) => {
            if let Err(err) = channel.basic_ack(delivery_tag, lapin::options::BasicAckOptions::default()).await {
                tracing::error!(%err, delivery_tag, "failed to ack delivery");
            }
        }
        Err(()) => {
            let registration_snapshot = inner.consume_state.lock().unwrap().get(&consumer_tag).map(|r| {
                (r.always_requeue, r.requeue_delay)
            });
            let Some((always_requeue, requeue_delay)) = registration_snapshot else {
                return;
            };

            let scheduled = inner.delayed_reject.pending_count(&consumer_tag);
            let decision = decide_rejection(
                redelivered,
                always_requeue,
                requeue_delay,
                scheduled,
                inner.delayed_rejections_limit,
            );

            apply_reject_decision(&inner, &channel, &consumer_tag, delivery_tag, decision, requeue_delay).await;
        }
    }
}

async fn apply_reject_decision(
    inner: &Arc<ProtocolInner>,
    channel: &Channel,
    consumer_tag: &str,
    delivery_tag: u64,
    decision: RejectDecision,
    requeue_delay: Duration,
) {
    match decision {
        RejectDecision::Hold => {
            tracing::debug!(delivery_tag, "holding redelivered message (always_requeue)");
        }
        RejectDecision::RejectNoRequeue => {
            if let Err(err) = channel
                .basic_reject(delivery_tag, lapin::options::BasicRejectOptions { requeue: false })
                .await
            {
                tracing::error!(%err, delivery_tag, "basic.reject (no requeue) failed");
            }
        }
        RejectDecision::RejectRequeueNow => {
            if let Err(err) = channel
                .basic_reject(delivery_tag, lapin::options::BasicRejectOptions { requeue: true })
                .await
            {
                tracing::error!(%err, delivery_tag, "basic.reject (requeue) failed");
            }
        }
        RejectDecision::ScheduleDelayedRequeue => {
            let channel_clone = channel.clone();
            let inner_clone = inner.clone();
            let consumer_tag_owned = consumer_tag.to_string();
            let fire_channel = channel.clone();
            inner.delayed_reject.schedule(
                consumer_tag,
                delivery_tag,
                channel_clone,
                requeue_delay,
                async move {
                    if let Err(err) = fire_channel
                        .basic_reject(delivery_tag, lapin::options::BasicRejectOptions { requeue: true })
                        .await
                    {
                        tracing::error!(%err, delivery_tag, "delayed basic.reject failed");
                    }
                    inner_clone.delayed_reject.remove_fired(&consumer_tag_owned, delivery_tag);
                },
            );
        }
    }
}

fn delivery_to_message(delivery: lapin::message::Delivery, consumer_tag: &str) -> Message {
    let props = delivery.properties.clone();
    let mut headers = std::collections::BTreeMap::new();
    if let Some(table) = props.headers() {
        for (k, v) in table.inner() {
            headers.insert(k.to_string(), format!("{v:?}"));
        }
    }

    let properties = MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.to_string()),
        content_encoding: props.content_encoding().as_ref().map(|s| s.to_string()),
        headers,
        delivery_mode: *props.delivery_mode(),
        priority: *props.priority(),
        correlation_id: props.correlation_id().as_ref().map(|s| s.to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.to_string()),
        expiration: props.expiration().as_ref().map(|s| s.to_string()),
        message_id: props.message_id().as_ref().map(|s| s.to_string()),
        timestamp: *props.timestamp(),
        type_: props.kind().as_ref().map(|s| s.to_string()),
        user_id: props.user_id().as_ref().map(|s| s.to_string()),
        app_id: props.app_id().as_ref().map(|s| s.to_string()),
    };

    let deliver = DeliveryInfo {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        delivery_tag: delivery.delivery_tag,
        consumer_tag: consumer_tag.to_string(),
        redelivered: delivery.redelivered,
    };

    Message::new(delivery.data, deliver, properties)
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(ct) = &properties.content_type {
        props = props.with_content_type(ct.as_str().into());
    }
    if let Some(ce) = &properties.content_encoding {
        props = props.with_content_encoding(ce.as_str().into());
    }
    if let Some(mode) = properties.delivery_mode {
        props = props.with_delivery_mode(mode);
    }
    if let Some(priority) = properties.priority {
        props = props.with_priority(priority);
    }
    if let Some(cid) = &properties.correlation_id {
        props = props.with_correlation_id(cid.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        props = props.with_reply_to(reply_to.as_str().into());
    }
    if let Some(expiration) = &properties.expiration {
        props = props.with_expiration(expiration.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        props = props.with_message_id(message_id.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        props = props.with_timestamp(timestamp);
    }
    if let Some(type_) = &properties.type_ {
        props = props.with_kind(type_.as_str().into());
    }
    if let Some(user_id) = &properties.user_id {
        props = props.with_user_id(user_id.as_str().into());
    }
    if let Some(app_id) = &properties.app_id {
        props = props.with_app_id(app_id.as_str().into());
    }
    props
}

/// Spec.md §4.3 "Write-channel closed by broker": reopen it, no user-visible
/// effect beyond the brief window where `write_channel` points at a dead
/// channel.
fn install_write_channel_reopen(weak: Weak<ProtocolInner>, channel: Channel) {
    channel.on_error(move |err| {
        let weak = weak.clone();
        let reason = err.to_string();
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            tracing::warn!(err = %reason, "write channel closed by broker, reopening");
            match inner.connection.create_channel().await {
                Ok(new_channel) => {
                    install_write_channel_reopen(Arc::downgrade(&inner), new_channel.clone());
                    *inner.write_channel.write().await = new_channel;
                }
                Err(err) => tracing::error!(%err, "failed to reopen write channel"),
            }
        });
    });
}

/// Spec.md §4.3 "Safe-write-channel closed by broker": reopen it, re-enable
/// confirms, and fail every confirm still pending in the old table.
fn install_safe_write_channel_reopen(weak: Weak<ProtocolInner>, channel: Channel) {
    channel.on_error(move |err| {
        let weak = weak.clone();
        let reason = err.to_string();
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else { return };
            tracing::warn!(err = %reason, "safe-write channel closed by broker, reopening");
            inner.confirm_table.fail_all_channel_closed(reason.clone());
            metrics::pending_confirms(&inner.conn_name).set(0);

            let new_channel = match inner.connection.create_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    tracing::error!(%err, "failed to reopen safe-write channel");
                    *inner.safe_write_channel.write().await = None;
                    return;
                }
            };
            match new_channel.confirm_select(ConfirmSelectOptions::default()).await {
                Ok(()) => {
                    install_safe_write_channel_reopen(Arc::downgrade(&inner), new_channel.clone());
                    *inner.safe_write_channel.write().await = Some(new_channel);
                }
                Err(err) => {
                    tracing::error!(%err, "failed to re-enable confirm.select on reopened safe-write channel");
                    *inner.safe_write_channel.write().await = None;
                }
            }
        });
    });
}

fn classify_connect_error(err: lapin::Error) -> Error {
    let text = err.to_string();
    if text.to_lowercase().contains("access") || text.to_lowercase().contains("auth") {
        Error::AuthenticationFailed(text)
    } else {
        Error::Amqp(err)
    }
}
