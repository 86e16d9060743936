// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Outcomes
//!
//! Handlers never fail with an error: they return an `AckType` and the subscriber
//! turns it into the matching broker acknowledgment. `NackRequeue` is the way to
//! ask for a retry, `NackDiscard` sends the message to the dead letter exchange.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::task;
use tracing::error;

/// The decision a handler makes about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// Processed; acknowledge it.
    Ack,
    /// Transient failure; put it back on the queue.
    NackRequeue,
    /// Permanent failure; dead-letter it.
    NackDiscard,
}

impl AckType {
    /// The `requeue` flag of the nack this outcome maps to, `None` for an ack.
    pub fn requeue(&self) -> Option<bool> {
        match self {
            AckType::Ack => None,
            AckType::NackRequeue => Some(true),
            AckType::NackDiscard => Some(false),
        }
    }
}

/// Application callback invoked once per decoded delivery.
///
/// Any `Fn(T) -> AckType` closure is a handler; closures run on tokio's blocking
/// pool, so they may block without holding up other subscriptions. Implement the
/// trait directly for handlers that need to await.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle(&self, message: T) -> AckType;

    /// Runs the handler on behalf of a subscription task.
    fn dispatch(self: Arc<Self>, message: T) -> BoxFuture<'static, AckType> {
        Box::pin(async move { self.handle(message).await })
    }
}

#[async_trait]
impl<T, F> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> AckType + Send + Sync + 'static,
{
    async fn handle(&self, message: T) -> AckType {
        (self)(message)
    }

    fn dispatch(self: Arc<Self>, message: T) -> BoxFuture<'static, AckType> {
        Box::pin(async move {
            match task::spawn_blocking(move || (*self)(message)).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(error = err.to_string(), "handler panicked");
                    AckType::NackDiscard
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_flags() {
        assert_eq!(AckType::Ack.requeue(), None);
        assert_eq!(AckType::NackRequeue.requeue(), Some(true));
        assert_eq!(AckType::NackDiscard.requeue(), Some(false));
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |paused: bool| {
            if paused {
                AckType::Ack
            } else {
                AckType::NackDiscard
            }
        };

        assert_eq!(handler.handle(true).await, AckType::Ack);
        assert_eq!(Handler::handle(&handler, false).await, AckType::NackDiscard);
    }

    #[tokio::test]
    async fn closures_run_on_the_blocking_pool() {
        let caller = std::thread::current().id();
        let handler = Arc::new(move |_: ()| {
            if std::thread::current().id() == caller {
                AckType::NackRequeue
            } else {
                AckType::Ack
            }
        });

        assert_eq!(handler.dispatch(()).await, AckType::Ack);
    }

    #[tokio::test]
    async fn panicking_closure_discards_the_message() {
        let handler = Arc::new(|fail: bool| {
            if fail {
                panic!("bad move");
            }
            AckType::Ack
        });

        assert_eq!(handler.clone().dispatch(false).await, AckType::Ack);
        assert_eq!(handler.dispatch(true).await, AckType::NackDiscard);
    }

    struct Echo;

    #[async_trait]
    impl Handler<AckType> for Echo {
        async fn handle(&self, message: AckType) -> AckType {
            message
        }
    }

    #[tokio::test]
    async fn async_handlers_dispatch_to_handle() {
        let handler = Arc::new(Echo);
        assert_eq!(
            handler.dispatch(AckType::NackRequeue).await,
            AckType::NackRequeue
        );
    }
}
