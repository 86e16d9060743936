// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The topology binder, publisher and subscriber are written against the traits in
//! this module rather than against a concrete client. `channel` implements them on
//! top of lapin and `memory` implements them in-process.
//!
//! - `ChannelFactory`: a connection able to open channels, safe to share between tasks
//! - `AmqpChannel`: the channel operations the pub/sub layer needs
//! - `Acknowledger`: settles one delivery with an ack or a nack

use crate::{
    codec::Envelope,
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{fmt, sync::Arc};

/// Stream of deliveries returned by `basic_consume`. It ends when the channel or
/// its connection is closed.
pub type DeliveryStream = BoxStream<'static, Result<Incoming, AmqpError>>;

/// A connection that hands out dedicated channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Channel operations used by the pub/sub layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares the queue; re-declaring identical properties is a no-op.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Per-channel prefetch limit, no size limit.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Non-mandatory, non-immediate publish without confirms.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A delivery pushed by the broker to a consumer.
pub struct Incoming {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}
