// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! This module declares a subscription's queue and binds it to an exchange. The
//! exchange itself is expected to exist already. Each call opens its own channel,
//! which is handed back to the caller together with what the broker reported for
//! the queue.

use crate::{
    broker::{AmqpChannel, ChannelFactory},
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor, SimpleQueueType},
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Opens a channel, declares `queue_name` with the flags of `queue_type` and the
/// dead letter argument, then binds it to `exchange` with `routing_key`.
///
/// Errors are not retried; on declare or bind failure the channel is closed
/// before returning.
pub async fn declare_and_bind(
    conn: &dyn ChannelFactory,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    queue_type: SimpleQueueType,
) -> Result<(Arc<dyn AmqpChannel>, QueueDescriptor), AmqpError> {
    let def = QueueDefinition::new(queue_name).queue_type(queue_type);
    let binding = QueueBinding::new(queue_name)
        .exchange(exchange)
        .routing_key(routing_key);

    install(conn, &def, &binding).await
}

/// Same as `declare_and_bind`, from prebuilt definitions.
pub async fn install(
    conn: &dyn ChannelFactory,
    def: &QueueDefinition,
    binding: &QueueBinding,
) -> Result<(Arc<dyn AmqpChannel>, QueueDescriptor), AmqpError> {
    let channel = conn.open_channel().await?;

    match declare_queue(channel.as_ref(), def, binding).await {
        Ok(queue) => Ok((channel, queue)),
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(
                    error = close_err.to_string(),
                    "failure to close channel after topology error"
                );
            }
            Err(err)
        }
    }
}

async fn declare_queue(
    channel: &dyn AmqpChannel,
    def: &QueueDefinition,
    binding: &QueueBinding,
) -> Result<QueueDescriptor, AmqpError> {
    debug!(
        queue = def.name(),
        durable = def.flags.durable,
        auto_delete = def.flags.auto_delete,
        exclusive = def.flags.exclusive,
        "creating queue"
    );

    let queue = match channel.queue_declare(def).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = def.name(),
                "error to declare the queue"
            );
            Err(err)
        }
        Ok(queue) => Ok(queue),
    }?;

    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel.queue_bind(binding).await {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(err)
        }
        _ => Ok(()),
    }?;

    debug!("queue: {} was created and bound", queue.name);

    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockAmqpChannel, MockChannelFactory},
        queue::{QueueFlags, AMQP_HEADERS_DEAD_LETTER_EXCHANGE},
        routing::EXCHANGE_PERIL_DLX,
    };

    fn factory_for(channel: MockAmqpChannel) -> MockChannelFactory {
        let mut factory = MockChannelFactory::new();
        factory
            .expect_open_channel()
            .times(1)
            .return_once(move || Ok(Arc::new(channel) as Arc<dyn AmqpChannel>));
        factory
    }

    #[tokio::test]
    async fn declares_durable_queue_with_dead_letter_and_binds() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_queue_declare()
            .withf(|def| {
                def.name() == "game_logs"
                    && def.flags()
                        == QueueFlags {
                            durable: true,
                            auto_delete: false,
                            exclusive: false,
                        }
                    && def.arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                        == Some(&EXCHANGE_PERIL_DLX.to_owned())
            })
            .times(1)
            .returning(|def| {
                Ok(QueueDescriptor {
                    name: def.name().to_owned(),
                    ..Default::default()
                })
            });
        channel
            .expect_queue_bind()
            .withf(|b| {
                b.queue_name() == "game_logs"
                    && b.exchange_name() == "peril_topic"
                    && b.key() == "game_logs.*"
            })
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_close().never();

        let factory = factory_for(channel);
        let (_, queue) = declare_and_bind(
            &factory,
            "peril_topic",
            "game_logs",
            "game_logs.*",
            SimpleQueueType::Durable,
        )
        .await
        .unwrap();

        assert_eq!(queue.name, "game_logs");
    }

    #[tokio::test]
    async fn transient_queue_is_exclusive_and_auto_deleted() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_queue_declare()
            .withf(|def| {
                def.flags()
                    == QueueFlags {
                        durable: false,
                        auto_delete: true,
                        exclusive: true,
                    }
            })
            .times(1)
            .returning(|def| {
                Ok(QueueDescriptor {
                    name: def.name().to_owned(),
                    ..Default::default()
                })
            });
        channel.expect_queue_bind().times(1).returning(|_| Ok(()));

        let factory = factory_for(channel);
        declare_and_bind(
            &factory,
            "peril_direct",
            "pause.alice",
            "pause",
            SimpleQueueType::Transient,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn channel_open_failure_is_returned() {
        let mut factory = MockChannelFactory::new();
        factory
            .expect_open_channel()
            .returning(|| Err(AmqpError::ChannelOpenError("connection closed".into())));

        let err = declare_and_bind(&factory, "x", "q", "k", SimpleQueueType::Durable)
            .await
            .err();

        assert_eq!(
            err,
            Some(AmqpError::ChannelOpenError("connection closed".into()))
        );
    }

    #[tokio::test]
    async fn declare_conflict_closes_channel_and_skips_bind() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_queue_declare()
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));
        channel.expect_queue_bind().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let factory = factory_for(channel);
        let err = declare_and_bind(&factory, "x", "q", "k", SimpleQueueType::Durable)
            .await
            .err();

        assert_eq!(err, Some(AmqpError::DeclareQueueError("q".into())));
    }

    #[tokio::test]
    async fn bind_failure_closes_channel() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_queue_declare().returning(|def| {
            Ok(QueueDescriptor {
                name: def.name().to_owned(),
                ..Default::default()
            })
        });
        channel.expect_queue_bind().returning(|b| {
            Err(AmqpError::BindingExchangeToQueueError(
                b.exchange_name().to_owned(),
                b.queue_name().to_owned(),
            ))
        });
        channel.expect_close().times(1).returning(|| Ok(()));

        let factory = factory_for(channel);
        let err = declare_and_bind(&factory, "missing", "q", "k", SimpleQueueType::Transient)
            .await
            .err();

        assert_eq!(
            err,
            Some(AmqpError::BindingExchangeToQueueError(
                "missing".into(),
                "q".into()
            ))
        );
    }
}
