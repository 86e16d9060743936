// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module encodes values and publishes them to an exchange. Messages are
//! tagged with the codec's content type, a random message id, and the current
//! OpenTelemetry context. Publishing is fire-and-forget: no mandatory flag, no
//! confirms, no retries.

use crate::{
    broker::AmqpChannel,
    codec::{BinaryCodec, Codec, JsonCodec},
    errors::AmqpError,
    otel,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes encoded values on one channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQPublisher {
    /// Creates a new publisher on `channel`.
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }

    /// Encodes `value` with `codec` and publishes it to `exchange` under
    /// `routing_key`.
    ///
    /// # Returns
    /// `EncodeError` if the value can't be encoded, `PublishingError` if the
    /// channel refuses the message
    pub async fn publish<T, C>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        codec: &C,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
        C: Codec,
    {
        let mut envelope = codec.encode(value)?;
        envelope.message_id = Some(Uuid::new_v4().to_string());
        otel::inject(&mut envelope);

        match self
            .channel
            .basic_publish(exchange, routing_key, &envelope)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
        }
    }

    /// Publishes `value` as JSON.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(exchange, routing_key, value, &JsonCodec).await
    }

    /// Publishes `value` with the binary codec.
    pub async fn publish_binary<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(exchange, routing_key, value, &BinaryCodec).await
    }
}
