// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing `ChannelFactory`, used to exercise the
//! pub/sub layer without RabbitMQ. It reproduces the parts of AMQP the layer
//! depends on:
//!
//! - pre-provisioned direct, topic and fanout exchanges
//! - idempotent queue declaration, refusing conflicting redeclarations
//! - bindings and routing-key matching
//! - per-channel prefetch and manual acknowledgments
//! - requeue (flagged as redelivered) and dead-lettering through the
//!   `x-dead-letter-exchange` argument
//! - auto-delete queues removed when their last consumer goes away
//! - closing a channel requeues its unacknowledged deliveries and ends its
//!   consumers; closing the broker closes every channel
//!
//! Exchange-to-exchange bindings, TTLs and persistence are not modelled.

use crate::{
    broker::{Acknowledger, AmqpChannel, ChannelFactory, DeliveryStream, Incoming},
    codec::Envelope,
    errors::AmqpError,
    exchange::ExchangeKind,
    queue::{
        QueueBinding, QueueDefinition, QueueDescriptor, QueueFlags,
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    envelope: Envelope,
    redelivered: bool,
}

struct MemConsumer {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Result<Incoming, AmqpError>>,
}

struct MemQueue {
    flags: QueueFlags,
    arguments: BTreeMap<String, String>,
    ready: VecDeque<Message>,
    consumers: Vec<MemConsumer>,
    next_consumer: usize,
}

#[derive(Default)]
struct MemChannel {
    prefetch: u16,
    unacked: HashMap<u64, (String, Message)>,
}

#[derive(Default)]
struct State {
    closed: bool,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<QueueBinding>,
    channels: HashMap<u64, MemChannel>,
    next_channel: u64,
    next_tag: u64,
}

/// In-process AMQP broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Provisions an exchange.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.state
            .lock()
            .await
            .exchanges
            .insert(name.to_owned(), kind);
    }

    /// Closes every channel; consumption loops end and new channels are refused.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;

        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id, &self.state);
        }
        debug!("memory broker closed");
    }

    /// Flags of a declared queue.
    pub async fn queue_flags(&self, queue: &str) -> Option<QueueFlags> {
        self.state.lock().await.queues.get(queue).map(|q| q.flags)
    }

    /// Declaration arguments of a declared queue.
    pub async fn queue_arguments(&self, queue: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    /// Messages waiting in `queue` that were not yet delivered.
    pub async fn ready_count(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len())
    }

    /// Deliveries from `queue` that are awaiting an ack or nack.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|(name, _)| name == queue)
            .count()
    }

    /// Removes and returns every ready message of `queue`.
    pub async fn drain(&self, queue: &str) -> Vec<Envelope> {
        let mut state = self.state.lock().await;
        match state.queues.get_mut(queue) {
            Some(q) => q.ready.drain(..).map(|m| m.envelope).collect(),
            None => vec![],
        }
    }
}

#[async_trait]
impl ChannelFactory for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AmqpError::ChannelOpenError("connection closed".to_owned()));
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(id, MemChannel::default());

        Ok(Arc::new(MemoryChannel {
            id,
            state: self.state.clone(),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    fn check_open(&self, state: &State) -> Result<(), AmqpError> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(AmqpError::ChannelOpenError("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueDescriptor, AmqpError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)
            .map_err(|_| AmqpError::DeclareQueueError(def.name.clone()))?;

        let arguments = def.arguments();
        let queue = state
            .queues
            .entry(def.name.clone())
            .or_insert_with(|| MemQueue {
                flags: def.flags,
                arguments: arguments.clone(),
                ready: VecDeque::new(),
                consumers: vec![],
                next_consumer: 0,
            });

        if queue.flags != def.flags || queue.arguments != arguments {
            warn!(queue = %def.name, "queue redeclared with different properties");
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        Ok(QueueDescriptor {
            name: def.name.clone(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        let bind_error = || {
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        };

        self.check_open(&state).map_err(|_| bind_error())?;
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(bind_error());
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        match state.channels.get_mut(&self.id) {
            Some(channel) => {
                channel.prefetch = prefetch_count;
                Ok(())
            }
            None => Err(AmqpError::QoSDeclarationError("channel closed".to_owned())),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)
            .map_err(|err| AmqpError::ConsumerDeclarationError(err.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(MemConsumer {
                channel_id: self.id,
                tx,
            }),
            None => {
                return Err(AmqpError::ConsumerDeclarationError(format!(
                    "no queue `{}`",
                    queue
                )))
            }
        }

        state.dispatch(queue, &self.state);

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        if !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{}`",
                exchange
            )));
        }

        state.route(
            Message {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                envelope: envelope.clone(),
                redelivered: false,
            },
            &self.state,
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        self.check_open(&state)
            .map_err(|_| AmqpError::ChannelCloseError("channel closed".to_owned()))?;
        state.close_channel(self.id, &self.state);
        Ok(())
    }
}

struct MemoryAcker {
    channel_id: u64,
    delivery_tag: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryAcker {
    async fn settle(&self, requeue: Option<bool>) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;

        let settled = state
            .channels
            .get_mut(&self.channel_id)
            .and_then(|ch| ch.unacked.remove(&self.delivery_tag));

        let Some((queue, mut message)) = settled else {
            return Err(match requeue {
                None => AmqpError::AckMessageError,
                Some(_) => AmqpError::NackMessageError,
            });
        };

        match requeue {
            None => {}
            Some(true) => {
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push_front(message);
                }
            }
            Some(false) => state.dead_letter(&queue, message, &self.state),
        }

        state.dispatch(&queue, &self.state);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(None).await
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(Some(requeue)).await
    }
}

impl State {
    fn route(&mut self, message: Message, shared: &Arc<Mutex<State>>) {
        let Some(kind) = self.exchanges.get(&message.exchange).copied() else {
            return;
        };

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == message.exchange)
            .filter(|b| kind.matches(&b.routing_key, &message.routing_key))
            .map(|b| b.queue_name.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in targets {
            if let Some(q) = self.queues.get_mut(&name) {
                q.ready.push_back(message.clone());
            }
            self.dispatch(&name, shared);
        }
    }

    fn dead_letter(&mut self, queue: &str, message: Message, shared: &Arc<Mutex<State>>) {
        let dlx = self
            .queues
            .get(queue)
            .and_then(|q| q.arguments.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).cloned());

        match dlx {
            Some(dlx) => {
                debug!(queue, dlx = %dlx, "dead-lettering message");
                self.route(
                    Message {
                        exchange: dlx,
                        redelivered: false,
                        ..message
                    },
                    shared,
                );
            }
            None => debug!(queue, "discarding message"),
        }
    }

    /// Pushes ready messages of `queue` to consumers whose channel has room.
    fn dispatch(&mut self, queue: &str, shared: &Arc<Mutex<State>>) {
        if self.closed {
            return;
        }

        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }

            let count = q.consumers.len();
            let mut picked = None;
            for offset in 0..count {
                let idx = (q.next_consumer + offset) % count;
                let room = self
                    .channels
                    .get(&q.consumers[idx].channel_id)
                    .map(|ch| ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize)
                    .unwrap_or(false);
                if room {
                    picked = Some(idx);
                    break;
                }
            }

            let Some(idx) = picked else {
                return;
            };
            q.next_consumer = (idx + 1) % count;

            let Some(message) = q.ready.pop_front() else {
                return;
            };
            let channel_id = q.consumers[idx].channel_id;
            let tx = q.consumers[idx].tx.clone();

            self.next_tag += 1;
            let delivery_tag = self.next_tag;

            let incoming = Incoming {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                envelope: message.envelope.clone(),
                acker: Box::new(MemoryAcker {
                    channel_id,
                    delivery_tag,
                    state: shared.clone(),
                }),
            };

            if tx.send(Ok(incoming)).is_err() {
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                continue;
            }

            if let Some(ch) = self.channels.get_mut(&channel_id) {
                ch.unacked.insert(delivery_tag, (queue.to_owned(), message));
            }
        }
    }

    fn close_channel(&mut self, id: u64, shared: &Arc<Mutex<State>>) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };

        let mut touched: Vec<String> = vec![];
        let mut unacked: Vec<(u64, (String, Message))> = channel.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, mut message)) in unacked {
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
            touched.push(queue);
        }

        for (name, q) in self.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| c.channel_id != id);
            if q.consumers.len() != before {
                touched.push(name.clone());
            }
        }

        touched.sort();
        touched.dedup();
        for name in touched {
            let remove = self
                .queues
                .get(&name)
                .map(|q| q.flags.auto_delete && q.consumers.is_empty())
                .unwrap_or(false);

            if remove {
                debug!(queue = %name, "auto-deleting queue");
                self.queues.remove(&name);
                self.bindings.retain(|b| b.queue_name != name);
            } else {
                self.dispatch(&name, shared);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SimpleQueueType;

    async fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange("peril_direct", ExchangeKind::Direct)
            .await;
        broker
            .declare_exchange("peril_dlx", ExchangeKind::Fanout)
            .await;
        broker
    }

    async fn declare(
        channel: &dyn AmqpChannel,
        name: &str,
        queue_type: SimpleQueueType,
    ) -> Result<QueueDescriptor, AmqpError> {
        channel
            .queue_declare(&QueueDefinition::new(name).queue_type(queue_type))
            .await
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_but_conflicts_fail() {
        let broker = broker().await;
        let channel = broker.open_channel().await.unwrap();

        declare(channel.as_ref(), "q", SimpleQueueType::Durable)
            .await
            .unwrap();
        declare(channel.as_ref(), "q", SimpleQueueType::Durable)
            .await
            .unwrap();

        let err = declare(channel.as_ref(), "q", SimpleQueueType::Transient)
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::DeclareQueueError("q".into()));
    }

    #[tokio::test]
    async fn binding_to_unknown_exchange_fails() {
        let broker = broker().await;
        let channel = broker.open_channel().await.unwrap();
        declare(channel.as_ref(), "q", SimpleQueueType::Durable)
            .await
            .unwrap();

        let err = channel
            .queue_bind(&QueueBinding::new("q").exchange("nope").routing_key("k"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AmqpError::BindingExchangeToQueueError("nope".into(), "q".into())
        );
    }

    #[tokio::test]
    async fn requeue_redelivers_and_closing_returns_unacked() {
        let broker = broker().await;
        let channel = broker.open_channel().await.unwrap();
        declare(channel.as_ref(), "q", SimpleQueueType::Durable)
            .await
            .unwrap();
        channel
            .queue_bind(
                &QueueBinding::new("q")
                    .exchange("peril_direct")
                    .routing_key("k"),
            )
            .await
            .unwrap();
        channel
            .basic_publish("peril_direct", "k", &Envelope::new(b"1".to_vec(), ""))
            .await
            .unwrap();

        let mut stream = channel.basic_consume("q", "").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.acker.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(broker.unacked_count("q").await, 1);

        channel.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.ready_count("q").await, Some(1));
        assert_eq!(second.acker.ack().await, Err(AmqpError::AckMessageError));
    }

    #[tokio::test]
    async fn closing_twice_is_a_close_error() {
        let broker = broker().await;
        let channel = broker.open_channel().await.unwrap();

        channel.close().await.unwrap();
        assert_eq!(
            channel.close().await,
            Err(AmqpError::ChannelCloseError("channel closed".into()))
        );
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_with_its_last_consumer() {
        let broker = broker().await;
        let channel = broker.open_channel().await.unwrap();
        declare(channel.as_ref(), "pause.alice", SimpleQueueType::Transient)
            .await
            .unwrap();
        let _stream = channel.basic_consume("pause.alice", "").await.unwrap();

        channel.close().await.unwrap();
        assert_eq!(broker.queue_flags("pause.alice").await, None);
    }

    #[tokio::test]
    async fn closed_broker_refuses_channels() {
        let broker = broker().await;
        broker.close().await;

        let err = broker.open_channel().await.err();
        assert_eq!(
            err,
            Some(AmqpError::ChannelOpenError("connection closed".into()))
        );
    }
}
