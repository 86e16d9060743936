// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriptions
//!
//! This module wires a queue to an application handler. `subscribe` declares and
//! binds the queue on a dedicated channel, applies the prefetch limit, registers a
//! consumer and spawns one task that processes deliveries strictly in order until
//! the delivery stream ends. Subscriptions never share a channel, so a slow
//! handler only throttles its own queue.

use crate::{
    broker::{AmqpChannel, ChannelFactory, DeliveryStream},
    codec::{BinaryCodec, Codec, JsonCodec},
    consumer::{consume, DecodeFailurePolicy},
    errors::AmqpError,
    outcome::Handler,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor, SimpleQueueType},
    topology,
};
use futures_util::StreamExt;
use opentelemetry::global;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Deliveries a subscription channel may hold unacknowledged
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Everything needed to set up one subscription.
#[derive(Debug, Clone)]
pub struct SubscriberDefinition {
    pub(crate) exchange: String,
    pub(crate) queue_name: String,
    pub(crate) routing_key: String,
    pub(crate) queue_type: SimpleQueueType,
    pub(crate) prefetch_count: u16,
    pub(crate) consumer_tag: String,
    pub(crate) on_decode_failure: DecodeFailurePolicy,
}

impl SubscriberDefinition {
    /// Creates a definition for `queue_name` with a prefetch of 10, a
    /// broker-generated consumer tag, and dead-lettering of undecodable payloads.
    pub fn new(queue_name: &str) -> SubscriberDefinition {
        SubscriberDefinition {
            exchange: String::new(),
            queue_name: queue_name.to_owned(),
            routing_key: String::new(),
            queue_type: SimpleQueueType::default(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_tag: String::new(),
            on_decode_failure: DecodeFailurePolicy::default(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_type(mut self, queue_type: SimpleQueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    pub fn on_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.on_decode_failure = policy;
        self
    }
}

/// A running subscription.
///
/// Dropping it does not stop consumption; the loop ends when the connection or
/// channel is closed.
#[derive(Debug)]
pub struct Subscription {
    queue: QueueDescriptor,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the consumption loop to end.
    pub async fn closed(self) -> Result<(), AmqpError> {
        self.handle.await.map_err(|err| {
            error!(error = err.to_string(), "consumption task failed");
            AmqpError::InternalError
        })
    }
}

/// Subscribes `handler` to the queue described by `def`, decoding with `codec`.
///
/// Returns once the consumer is registered; deliveries are processed on a
/// spawned task. Setup failures are returned and not retried.
pub async fn subscribe<T, C, H>(
    conn: &dyn ChannelFactory,
    def: SubscriberDefinition,
    codec: C,
    handler: H,
) -> Result<Subscription, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    let queue_def = QueueDefinition::new(&def.queue_name).queue_type(def.queue_type);
    let binding = QueueBinding::new(&def.queue_name)
        .exchange(&def.exchange)
        .routing_key(&def.routing_key);

    let (channel, queue) = topology::install(conn, &queue_def, &binding).await?;

    let consumer = match start_consumer(channel.as_ref(), &def, &queue).await {
        Ok(consumer) => consumer,
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to close channel");
            }
            return Err(err);
        }
    };

    debug!(queue = queue.name, "subscription started");

    let on_decode_failure = def.on_decode_failure;
    let handle = tokio::spawn(run(consumer, channel, codec, handler, on_decode_failure));

    Ok(Subscription { queue, handle })
}

/// Subscribes a JSON handler.
pub async fn subscribe_json<T, H>(
    conn: &dyn ChannelFactory,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
    handler: H,
) -> Result<Subscription, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let def = SubscriberDefinition::new(queue_name)
        .exchange(exchange)
        .routing_key(routing_key)
        .queue_type(queue_type);

    subscribe(conn, def, JsonCodec, handler).await
}

/// Subscribes a handler for binary-encoded messages.
pub async fn subscribe_binary<T, H>(
    conn: &dyn ChannelFactory,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
    handler: H,
) -> Result<Subscription, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let def = SubscriberDefinition::new(queue_name)
        .exchange(exchange)
        .routing_key(routing_key)
        .queue_type(queue_type);

    subscribe(conn, def, BinaryCodec, handler).await
}

async fn start_consumer(
    channel: &dyn AmqpChannel,
    def: &SubscriberDefinition,
    queue: &QueueDescriptor,
) -> Result<DeliveryStream, AmqpError> {
    if let Err(err) = channel.basic_qos(def.prefetch_count).await {
        error!(error = err.to_string(), "failure to configure qos");
        return Err(err);
    }

    match channel.basic_consume(&queue.name, &def.consumer_tag).await {
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer");
            Err(err)
        }
        Ok(consumer) => Ok(consumer),
    }
}

async fn run<T, C, H>(
    mut consumer: DeliveryStream,
    channel: Arc<dyn AmqpChannel>,
    codec: C,
    handler: H,
    on_decode_failure: DecodeFailurePolicy,
) where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    let tracer = global::tracer("amqp consumer");
    let handler = Arc::new(handler);

    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                match consume(&tracer, delivery, &codec, &handler, on_decode_failure).await {
                    Ok(settlement) => debug!(?settlement, "delivery processed"),
                    Err(err) => error!(error = err.to_string(), "error consume msg"),
                }
            }

            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    debug!("delivery stream closed");

    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "channel already closed");
    }
}
