// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module handles one delivery at a time for a subscription:
//! 1. Opens a consumer span from the trace context in the headers
//! 2. Decodes the payload with the subscription's codec
//! 3. Invokes the handler and waits for its `AckType`
//! 4. Acks or nacks the delivery accordingly
//!
//! Decode failures are settled according to the subscription's
//! `DecodeFailurePolicy`.

use crate::{
    broker::Incoming,
    codec::Codec,
    errors::AmqpError,
    outcome::{AckType, Handler},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// What to do with a delivery whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Nack without requeue so the broker dead-letters it.
    #[default]
    DeadLetter,
    /// Leave it unacknowledged; the broker redelivers it once the channel closes.
    LeaveUnacked,
}

/// How a delivery ended up being settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Settled(AckType),
    Unsettled,
}

/// Processes a single delivery and settles it.
pub(crate) async fn consume<T, C, H>(
    tracer: &BoxedTracer,
    incoming: Incoming,
    codec: &C,
    handler: &Arc<H>,
    on_decode_failure: DecodeFailurePolicy,
) -> Result<Settlement, AmqpError>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
    H: Handler<T>,
{
    let (_ctx, mut span) = crate::otel::new_span(&incoming.envelope, tracer, &incoming.routing_key);

    debug!(
        "received: {} - exchange: {} - redelivered: {}",
        incoming.routing_key, incoming.exchange, incoming.redelivered,
    );

    let message: T = match codec.decode(&incoming.envelope.body, &incoming.envelope.content_type) {
        Ok(message) => message,
        Err(err) => {
            error!(
                error = err.to_string(),
                routing_key = %incoming.routing_key,
                "failure to decode delivery"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to decode delivery"),
            });

            return match on_decode_failure {
                DecodeFailurePolicy::DeadLetter => {
                    settle(&incoming, AckType::NackDiscard, &mut span).await?;
                    Ok(Settlement::Settled(AckType::NackDiscard))
                }
                DecodeFailurePolicy::LeaveUnacked => Ok(Settlement::Unsettled),
            };
        }
    };

    let outcome = <H as Handler<T>>::dispatch(Arc::clone(handler), message).await;
    settle(&incoming, outcome, &mut span).await?;

    Ok(Settlement::Settled(outcome))
}

async fn settle<S: Span>(
    incoming: &Incoming,
    outcome: AckType,
    span: &mut S,
) -> Result<(), AmqpError> {
    let result = match outcome {
        AckType::Ack => {
            debug!("message successfully processed");
            incoming.acker.ack().await
        }
        AckType::NackRequeue => {
            warn!(routing_key = %incoming.routing_key, "nack: requeuing message");
            incoming.acker.nack(true).await
        }
        AckType::NackDiscard => {
            warn!(routing_key = %incoming.routing_key, "nack: discarding message to dlx");
            incoming.acker.nack(false).await
        }
    };

    match result {
        Err(err) => {
            error!(error = err.to_string(), "error whiling settling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            Err(err)
        }
        Ok(_) => {
            if outcome == AckType::Ack {
                span.set_status(Status::Ok);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Acknowledger, MockAcknowledger},
        codec::{BinaryCodec, Envelope, JsonCodec},
        routing::PlayingState,
    };
    use opentelemetry::global;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn incoming(envelope: Envelope, acker: MockAcknowledger) -> Incoming {
        Incoming {
            delivery_tag: 1,
            exchange: "peril_direct".to_owned(),
            routing_key: "pause".to_owned(),
            redelivered: false,
            envelope,
            acker: Box::new(acker) as Box<dyn Acknowledger>,
        }
    }

    fn paused() -> Envelope {
        JsonCodec.encode(&PlayingState { is_paused: true }).unwrap()
    }

    async fn run(
        envelope: Envelope,
        acker: MockAcknowledger,
        outcome: AckType,
        policy: DecodeFailurePolicy,
    ) -> Result<Settlement, AmqpError> {
        let tracer = global::tracer("test");
        let handler = Arc::new(move |_: PlayingState| outcome);
        consume(
            &tracer,
            incoming(envelope, acker),
            &JsonCodec,
            &handler,
            policy,
        )
        .await
    }

    #[tokio::test]
    async fn ack_outcome_acks_once() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let settled = run(
            paused(),
            acker,
            AckType::Ack,
            DecodeFailurePolicy::default(),
        )
        .await;
        assert_eq!(settled, Ok(Settlement::Settled(AckType::Ack)));
    }

    #[tokio::test]
    async fn requeue_outcome_nacks_with_requeue() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Ok(()));

        let settled = run(
            paused(),
            acker,
            AckType::NackRequeue,
            DecodeFailurePolicy::default(),
        )
        .await;
        assert_eq!(settled, Ok(Settlement::Settled(AckType::NackRequeue)));
    }

    #[tokio::test]
    async fn discard_outcome_nacks_without_requeue() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let settled = run(
            paused(),
            acker,
            AckType::NackDiscard,
            DecodeFailurePolicy::default(),
        )
        .await;
        assert_eq!(settled, Ok(Settlement::Settled(AckType::NackDiscard)));
    }

    #[tokio::test]
    async fn decode_failure_dead_letters_without_calling_handler() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Arc::new(move |_: PlayingState| {
            counter.fetch_add(1, Ordering::SeqCst);
            AckType::Ack
        });

        let tracer = global::tracer("test");
        let envelope = Envelope::new(b"{broken".to_vec(), "application/json");
        let settled = consume(
            &tracer,
            incoming(envelope, acker),
            &JsonCodec,
            &handler,
            DecodeFailurePolicy::DeadLetter,
        )
        .await;

        assert_eq!(settled, Ok(Settlement::Settled(AckType::NackDiscard)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn decode_failure_can_be_left_unacked() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker.expect_nack().never();

        let envelope = BinaryCodec.encode(&PlayingState { is_paused: true }).unwrap();
        let settled = run(
            envelope,
            acker,
            AckType::Ack,
            DecodeFailurePolicy::LeaveUnacked,
        )
        .await;
        assert_eq!(settled, Ok(Settlement::Unsettled));
    }

    #[tokio::test]
    async fn ack_failure_is_reported() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError));

        let settled = run(
            paused(),
            acker,
            AckType::Ack,
            DecodeFailurePolicy::default(),
        )
        .await;
        assert_eq!(settled, Err(AmqpError::AckMessageError));
    }
}
