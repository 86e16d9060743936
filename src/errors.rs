// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Pub/Sub Layer
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! Setup-time errors (channel, queue, binding, QoS, consumer) stop the subscription
//! or publish being established. Publish-time errors (encode, publish) are returned
//! to the caller. Consume-time errors (decode, ack, nack) are logged by the
//! consumption loop and never end it.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant carries enough context to identify the failing operation; the
/// underlying broker error is logged where it is converted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelOpenError(String),

    /// Error closing a channel
    #[error("failure to close the channel `{0}`")]
    ChannelCloseError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error encoding a value into a message payload
    #[error("failure to encode payload `{0}`")]
    EncodeError(String),

    /// Error decoding a message payload
    #[error("failure to decode payload `{0}`")]
    DecodeError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error receiving a delivery from the broker
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error happened while establishing a subscription or publisher.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelOpenError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_error_names_both_ends() {
        let err = AmqpError::BindingExchangeToQueueError("peril_topic".into(), "moves".into());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `peril_topic` to queue `moves`"
        );
    }

    #[test]
    fn setup_errors_are_classified() {
        assert!(AmqpError::ChannelOpenError("closed".into()).is_setup());
        assert!(AmqpError::DeclareQueueError("q".into()).is_setup());
        assert!(!AmqpError::DecodeError("eof".into()).is_setup());
        assert!(!AmqpError::PublishingError("closed".into()).is_setup());
        assert!(!AmqpError::ChannelCloseError("closed".into()).is_setup());
    }
}
