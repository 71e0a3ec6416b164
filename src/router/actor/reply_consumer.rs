//! Reply consumer for the shared reply channel.
//!
//! This module provides the background task that drains the shared reply
//! channel and routes each reply to the call waiting for it.
//!
//! The consumer task:
//! - Runs in a spawned tokio task for the lifetime of the router
//! - Is the only reader of the reply channel
//! - Completes slots in the CorrelationRegistry by correlation id
//! - Acks every delivery it processes, matched or not, so nothing is redelivered
//! - On exit closes the registry, abandoning every pending call

use std::sync::Arc;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Completion, CorrelationRegistry};
use crate::router::protocol::reply_correlation_id;
use crate::transport::{Delivery, Subscription, Transport, TransportError};

/// Why the consumer loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// Shutdown was requested through the handle.
    Shutdown,
    /// The transport ended the subscription.
    SubscriptionEnded,
    /// Receiving or acknowledging failed.
    TransportFailed(TransportError),
    /// The task panicked or was aborted.
    Aborted,
}

impl ConsumerExit {
    fn reason(&self) -> String {
        match self {
            ConsumerExit::Shutdown => "reply consumer shut down".to_string(),
            ConsumerExit::SubscriptionEnded => "reply subscription ended".to_string(),
            ConsumerExit::TransportFailed(e) => format!("reply transport failed: {}", e),
            ConsumerExit::Aborted => "reply consumer aborted".to_string(),
        }
    }
}

/// How a single delivery was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Completed(Completion),
    MissingCorrelationId,
    Undecodable,
}

/// Handle to a running reply consumer.
///
/// Dropping the handle cancels the task.
pub struct ReplyConsumerHandle {
    join_handle: Option<JoinHandle<ConsumerExit>>,
    cancel_token: CancellationToken,
}

impl ReplyConsumerHandle {
    /// Stop the consumer and wait for it to finish.
    pub async fn shutdown(mut self) -> ConsumerExit {
        self.cancel_token.cancel();
        match self.join_handle.take() {
            Some(handle) => handle.await.unwrap_or(ConsumerExit::Aborted),
            None => ConsumerExit::Aborted,
        }
    }

    /// Wait for the consumer to stop on its own.
    pub async fn join(mut self) -> ConsumerExit {
        match self.join_handle.take() {
            Some(handle) => handle.await.unwrap_or(ConsumerExit::Aborted),
            None => ConsumerExit::Aborted,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }
}

impl Drop for ReplyConsumerHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn the consumer loop for `subscription`.
pub fn spawn_reply_consumer<T, R>(
    transport: Arc<T>,
    subscription: Subscription,
    registry: Arc<CorrelationRegistry<R>>,
) -> ReplyConsumerHandle
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    let cancel_token = CancellationToken::new();
    let token_clone = cancel_token.clone();

    let join_handle = tokio::spawn(consumer_loop(transport, subscription, registry, token_clone));

    ReplyConsumerHandle {
        join_handle: Some(join_handle),
        cancel_token,
    }
}

async fn consumer_loop<T, R>(
    transport: Arc<T>,
    mut subscription: Subscription,
    registry: Arc<CorrelationRegistry<R>>,
    cancel_token: CancellationToken,
) -> ConsumerExit
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    debug!(
        target: "reply_router::consumer",
        "Consuming replies on {}",
        subscription.queue()
    );

    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!(
                    target: "reply_router::consumer",
                    "Reply consumer cancelled, shutting down"
                );
                break ConsumerExit::Shutdown;
            }

            next = subscription.next() => {
                match next {
                    Some(Ok(delivery)) => {
                        handle_delivery(&delivery, &registry);
                        if let Err(e) = transport.ack(&delivery).await {
                            warn!(
                                target: "reply_router::consumer",
                                "Failed to ack reply {}: {}",
                                delivery.tag,
                                e
                            );
                            break ConsumerExit::TransportFailed(e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(
                            target: "reply_router::consumer",
                            "Reply subscription failed: {}",
                            e
                        );
                        break ConsumerExit::TransportFailed(e);
                    }
                    None => break ConsumerExit::SubscriptionEnded,
                }
            }
        }
    };

    let abandoned = registry.close(&exit.reason());
    if abandoned > 0 {
        warn!(
            target: "reply_router::consumer",
            "Abandoned {} pending calls: {}",
            abandoned,
            exit.reason()
        );
    }
    exit
}

/// Route one delivery to its slot.
pub(crate) fn handle_delivery<R: DeserializeOwned>(
    delivery: &Delivery,
    registry: &CorrelationRegistry<R>,
) -> Routed {
    let Some(id) = reply_correlation_id(&delivery.message) else {
        warn!(
            target: "reply_router::consumer",
            "Reply {} carries no correlation id, dropping",
            delivery.tag
        );
        return Routed::MissingCorrelationId;
    };

    let reply: R = match serde_json::from_slice(&delivery.message.body) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(
                target: "reply_router::consumer",
                "Error decoding reply for {}: {}",
                id,
                e
            );
            return Routed::Undecodable;
        }
    };

    let completion = registry.complete(&id, reply);
    match completion {
        Completion::Delivered => {
            debug!(target: "reply_router::consumer", "Delivered reply for {}", id);
        }
        Completion::UnknownId => {
            warn!(
                target: "reply_router::consumer",
                "Received reply with unknown correlation id: {}",
                id
            );
        }
        Completion::AlreadySettled => {
            warn!(
                target: "reply_router::consumer",
                "Duplicate reply for {}, dropping",
                id
            );
        }
        Completion::WaiterGone => {
            debug!(
                target: "reply_router::consumer",
                "Caller for {} already gone, dropping reply",
                id
            );
        }
    }
    Routed::Completed(completion)
}
