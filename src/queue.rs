// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! This module provides types for defining queues and their bindings. A queue's
//! durability flags are derived once from its `SimpleQueueType` when the definition
//! is built, and every queue is dead-lettered to a well-known exchange.

use crate::routing::EXCHANGE_PERIL_DLX;
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Durability class of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimpleQueueType {
    /// No durability policy: every flag is off.
    #[default]
    NoQueue,
    /// Survives broker restarts and consumer disconnects.
    Durable,
    /// Private to one connection and removed when its last consumer leaves.
    Transient,
}

/// Declaration flags derived from a `SimpleQueueType`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl From<SimpleQueueType> for QueueFlags {
    fn from(queue_type: SimpleQueueType) -> QueueFlags {
        match queue_type {
            SimpleQueueType::NoQueue => QueueFlags::default(),
            SimpleQueueType::Durable => QueueFlags {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            SimpleQueueType::Transient => QueueFlags {
                durable: false,
                auto_delete: true,
                exclusive: true,
            },
        }
    }
}

/// Definition of a queue with its declaration parameters.
///
/// Built with the builder pattern. Every queue dead-letters to `peril_dlx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) flags: QueueFlags,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue has no durability policy.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            flags: QueueFlags::default(),
        }
    }

    /// Applies the flags of a durability class.
    pub fn queue_type(mut self, queue_type: SimpleQueueType) -> Self {
        self.flags = queue_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    /// Declaration arguments sent along with the queue.
    pub fn arguments(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        args.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            EXCHANGE_PERIL_DLX.to_owned(),
        );
        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// `exchange` and `routing_key`.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Exact key for direct exchanges, wildcard pattern for topic exchanges.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// What the broker reported back for a declared queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
