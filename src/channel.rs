// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module binds the broker abstractions to lapin. `LapinConnection` opens
//! one connection to RabbitMQ and hands out a fresh channel per request;
//! `LapinChannel` performs queue declaration, binding, QoS, consuming and
//! publishing on one of those channels.

use crate::{
    broker::{Acknowledger, AmqpChannel, ChannelFactory, DeliveryStream, Incoming},
    codec::Envelope,
    configs::Configs,
    errors::AmqpError,
    queue::{QueueBinding, QueueDefinition, QueueDescriptor},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// A RabbitMQ connection able to open channels concurrently.
#[derive(Clone)]
pub struct LapinConnection {
    conn: Arc<Connection>,
}

impl LapinConnection {
    /// Connects using the RabbitMQ section of `cfg`, naming the connection after
    /// the application.
    pub async fn connect(cfg: &Configs) -> Result<LapinConnection, AmqpError> {
        LapinConnection::connect_uri(&cfg.rabbitmq.uri(), &cfg.app.name).await
    }

    /// Connects to `uri`, used verbatim.
    pub async fn connect_uri(
        uri: &str,
        connection_name: &str,
    ) -> Result<LapinConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(LapinConnection {
            conn: Arc::new(conn),
        })
    }

    /// Closes the connection, which ends every subscription opened on it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        match self.conn.close(200, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close connection");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ChannelFactory for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelOpenError(err.to_string()))
            }
        }
    }
}

/// A lapin channel owned by one subscription or publisher.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let args: BTreeMap<ShortString, AMQPValue> = def
            .arguments()
            .into_iter()
            .map(|(k, v)| {
                (
                    ShortString::from(k),
                    AMQPValue::LongString(LongString::from(v)),
                )
            })
            .collect();

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.flags.durable,
                    exclusive: def.flags.exclusive,
                    auto_delete: def.flags.auto_delete,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = %def.name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(QueueDescriptor {
                name: queue.name().as_str().to_owned(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => Err(AmqpError::QoSDeclarationError(err.to_string())),
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => Err(AmqpError::ConsumerDeclarationError(err.to_string())),
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(incoming(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.clone()))
            .with_headers(to_field_table(&envelope.headers));

        if let Some(id) = &envelope.message_id {
            props = props.with_message_id(ShortString::from(id.clone()));
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.body,
                props,
            )
            .await
        {
            Err(err) => Err(AmqpError::PublishingError(err.to_string())),
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.channel.close(200, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close channel");
                Err(AmqpError::ChannelCloseError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

fn incoming(delivery: Delivery) -> Incoming {
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_owned())
        .unwrap_or_default();

    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_owned());

    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    Incoming {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        envelope: Envelope {
            body: delivery.data,
            content_type,
            message_id,
            headers,
        },
        acker: Box::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    FieldTable::from(btree)
}

/// Keeps the string-valued headers; other AMQP value types are dropped.
fn from_field_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8(v.as_bytes().to_vec()).ok(),
                AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
                _ => None,
            }?;
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}
