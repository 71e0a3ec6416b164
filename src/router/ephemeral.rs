//! Per-call reply channel strategy.
//!
//! Each call declares its own reply channel, consumes it, and deletes it when
//! the call ends. No registry is needed because the channel only ever carries
//! replies for one correlation id; anything else that shows up is acked and
//! dropped. The receive loop is bounded by the call deadline, not by a message
//! count, and never requeues.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{CorrelationId, ReplyAddress, RequestEnvelope, reply_correlation_id};
use super::{Call, CallOutcome};
use crate::transport::{Subscription, Transport};

/// Dispatcher that declares a fresh reply channel for every call.
pub struct EphemeralDispatcher<T, R> {
    transport: Arc<T>,
    destination: String,
    _reply: PhantomData<fn() -> R>,
}

impl<T, R> Clone for EphemeralDispatcher<T, R> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            destination: self.destination.clone(),
            _reply: PhantomData,
        }
    }
}

/// Deletes the call's reply channel, even when the call future is dropped.
struct ChannelLease<T: Transport> {
    transport: Arc<T>,
    address: Option<ReplyAddress>,
}

impl<T: Transport> ChannelLease<T> {
    async fn release(mut self) {
        if let Some(address) = self.address.take() {
            delete_channel(self.transport.as_ref(), &address).await;
        }
    }
}

impl<T: Transport> Drop for ChannelLease<T> {
    fn drop(&mut self) {
        let Some(address) = self.address.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            runtime.spawn(async move {
                delete_channel(transport.as_ref(), &address).await;
            });
        }
    }
}

async fn delete_channel<T: Transport>(transport: &T, address: &ReplyAddress) {
    if let Err(e) = transport.delete_channel(address.as_str()).await {
        debug!(
            target: "reply_router::dispatcher",
            "Failed to delete reply channel {}: {}",
            address,
            e
        );
    }
}

impl<T, R> EphemeralDispatcher<T, R>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    pub fn new(transport: Arc<T>, destination: impl Into<String>) -> Self {
        Self {
            transport,
            destination: destination.into(),
            _reply: PhantomData,
        }
    }

    /// Publish `payload` and wait at most `timeout` for the matching reply on
    /// a channel declared for this call alone.
    pub async fn call<P>(
        &self,
        payload: &P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CallOutcome<R>
    where
        P: Serialize + Sync,
    {
        let deadline = Instant::now() + timeout;
        let id = CorrelationId::generate();

        let exchange = async {
            let address = match self.transport.declare_reply_channel().await {
                Ok(address) => address,
                Err(e) => return CallOutcome::PublishFailed(e.to_string()),
            };
            let lease = ChannelLease {
                transport: Arc::clone(&self.transport),
                address: Some(address.clone()),
            };

            let outcome = self.publish_and_receive(&id, address, payload).await;
            lease.release().await;
            outcome
        };

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => CallOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => CallOutcome::TimedOut,
            outcome = exchange => outcome,
        };

        debug!(
            target: "reply_router::dispatcher",
            "Ephemeral call {} finished: {}",
            id,
            outcome.label()
        );
        outcome
    }

    async fn publish_and_receive<P>(
        &self,
        id: &CorrelationId,
        address: ReplyAddress,
        payload: &P,
    ) -> CallOutcome<R>
    where
        P: Serialize + Sync,
    {
        let mut subscription = match self.transport.consume(address.as_str()).await {
            Ok(subscription) => subscription,
            Err(e) => return CallOutcome::PublishFailed(e.to_string()),
        };

        let envelope = RequestEnvelope {
            correlation_id: id.clone(),
            reply_to: address,
            payload,
        };
        let message = match envelope.to_message() {
            Ok(message) => message,
            Err(e) => return CallOutcome::PublishFailed(e.to_string()),
        };
        if let Err(e) = self.transport.publish(&self.destination, message).await {
            warn!(
                target: "reply_router::dispatcher",
                "Failed to publish request {} to {}: {}",
                id,
                self.destination,
                e
            );
            return CallOutcome::PublishFailed(e.to_string());
        }

        self.receive_matching(id, &mut subscription).await
    }

    async fn receive_matching(
        &self,
        id: &CorrelationId,
        subscription: &mut Subscription,
    ) -> CallOutcome<R> {
        loop {
            let delivery = match subscription.next().await {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return CallOutcome::TransportAbandoned(e.to_string()),
                None => {
                    return CallOutcome::TransportAbandoned("reply channel closed".to_string());
                }
            };

            if let Err(e) = self.transport.ack(&delivery).await {
                return CallOutcome::TransportAbandoned(e.to_string());
            }

            if reply_correlation_id(&delivery.message).as_ref() != Some(id) {
                warn!(
                    target: "reply_router::dispatcher",
                    "Dropping reply for another call on reply channel of {}",
                    id
                );
                continue;
            }

            match serde_json::from_slice(&delivery.message.body) {
                Ok(reply) => return CallOutcome::Replied(reply),
                Err(e) => {
                    warn!(
                        target: "reply_router::dispatcher",
                        "Error decoding reply for {}: {}",
                        id,
                        e
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<T, P, R> Call<P, R> for EphemeralDispatcher<T, R>
where
    T: Transport,
    P: Serialize + Sync,
    R: DeserializeOwned + Send + 'static,
{
    async fn call(&self, payload: &P, timeout: Duration, cancel: &CancellationToken) -> CallOutcome<R> {
        EphemeralDispatcher::call(self, payload, timeout, cancel).await
    }
}
