//! Request dispatcher for the shared reply channel.
//!
//! Turns publish-then-wait into a single bounded call:
//!
//! 1. Generate a correlation id and register its slot
//! 2. Publish the request envelope carrying the id and the shared reply address
//! 3. Race the slot against the deadline and the caller's cancellation token
//! 4. Deregister the slot, whichever branch won
//!
//! Step 4 is tied to a drop guard, so a call future dropped mid-wait (for
//! example when an HTTP client disconnects) deregisters as well.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::actor::{CorrelationRegistry, ReplySlot, SlotOutcome};
use super::protocol::{CorrelationId, ReplyAddress, RequestEnvelope};
use super::{Call, CallOutcome};
use crate::error::RouterError;
use crate::transport::Transport;

/// Fresh ids to try before giving up on a call. A collision at all means the
/// id generator is broken.
const MAX_ID_ATTEMPTS: usize = 3;

/// Per-call entry point sharing one reply channel and one reply consumer.
pub struct RequestDispatcher<T, R> {
    transport: Arc<T>,
    registry: Arc<CorrelationRegistry<R>>,
    reply_address: ReplyAddress,
    destination: String,
}

impl<T, R> Clone for RequestDispatcher<T, R> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            reply_address: self.reply_address.clone(),
            destination: self.destination.clone(),
        }
    }
}

/// Removes the slot when the call ends, however it ends.
struct PendingCall<'a, R> {
    registry: &'a CorrelationRegistry<R>,
    id: CorrelationId,
}

impl<R> Drop for PendingCall<'_, R> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

impl<T, R> RequestDispatcher<T, R>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    /// Create a dispatcher publishing to `destination` and expecting replies on
    /// `reply_address`, which must be consumed into `registry`.
    pub fn new(
        transport: Arc<T>,
        registry: Arc<CorrelationRegistry<R>>,
        reply_address: ReplyAddress,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            reply_address,
            destination: destination.into(),
        }
    }

    pub fn reply_address(&self) -> &ReplyAddress {
        &self.reply_address
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry<R>> {
        &self.registry
    }

    /// Publish `payload` and wait at most `timeout` for the matching reply.
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

        let mut slot = match self.register_fresh() {
            Ok(slot) => slot,
            Err(outcome) => return outcome,
        };
        let id = slot.id().clone();
        let _pending = PendingCall {
            registry: &self.registry,
            id: id.clone(),
        };

        let envelope = RequestEnvelope {
            correlation_id: id.clone(),
            reply_to: self.reply_address.clone(),
            payload,
        };
        let message = match envelope.to_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    target: "reply_router::dispatcher",
                    "Failed to encode request {}: {}",
                    id,
                    e
                );
                return CallOutcome::PublishFailed(e.to_string());
            }
        };

        let exchange = async {
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
            match slot.wait().await {
                SlotOutcome::Fulfilled(reply) => CallOutcome::Replied(reply),
                SlotOutcome::Abandoned(reason) => CallOutcome::TransportAbandoned(reason),
            }
        };

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => CallOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => CallOutcome::TimedOut,
            outcome = exchange => outcome,
        };

        debug!(
            target: "reply_router::dispatcher",
            "Call {} finished: {}",
            id,
            outcome.label()
        );
        outcome
    }

    fn register_fresh(&self) -> Result<ReplySlot<R>, CallOutcome<R>> {
        for _ in 0..MAX_ID_ATTEMPTS {
            match self.registry.register(CorrelationId::generate()) {
                Ok(slot) => return Ok(slot),
                Err(RouterError::DuplicateCorrelationId { id }) => {
                    error!(
                        target: "reply_router::dispatcher",
                        "Generated correlation id {} is already live",
                        id
                    );
                    debug_assert!(false, "correlation id collision: {}", id);
                }
                Err(e) => return Err(CallOutcome::TransportAbandoned(e.to_string())),
            }
        }
        Err(CallOutcome::PublishFailed(
            "could not allocate a unique correlation id".to_string(),
        ))
    }
}

#[async_trait]
impl<T, P, R> Call<P, R> for RequestDispatcher<T, R>
where
    T: Transport,
    P: Serialize + Sync,
    R: DeserializeOwned + Send + 'static,
{
    async fn call(&self, payload: &P, timeout: Duration, cancel: &CancellationToken) -> CallOutcome<R> {
        RequestDispatcher::call(self, payload, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::actor::{ReplyConsumerHandle, spawn_reply_consumer};
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{Delivery, Message, Subscription, TransportError};
    use serde::Deserialize;
    use serde_json::json;

    const REQUESTS: &str = "requests";

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    struct Reply {
        correlation_id: String,
        value: u32,
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        dispatcher: RequestDispatcher<MemoryBroker, Reply>,
        requests: Subscription,
        _consumer: ReplyConsumerHandle,
    }

    async fn harness() -> Harness {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue(REQUESTS).unwrap();
        let requests = broker.consume(REQUESTS).await.unwrap();
        let reply_address = broker.declare_reply_channel().await.unwrap();
        let replies = broker.consume(reply_address.as_str()).await.unwrap();
        let registry = Arc::new(CorrelationRegistry::new());
        let consumer = spawn_reply_consumer(Arc::clone(&broker), replies, Arc::clone(&registry));
        let dispatcher =
            RequestDispatcher::new(Arc::clone(&broker), registry, reply_address, REQUESTS);
        Harness {
            broker,
            dispatcher,
            requests,
            _consumer: consumer,
        }
    }

    async fn answer(broker: &MemoryBroker, request: &Delivery, value: u32) {
        let envelope: RequestEnvelope<serde_json::Value> =
            RequestEnvelope::from_message(&request.message).unwrap();
        let body = json!({
            "correlation_id": envelope.correlation_id,
            "value": value,
        });
        broker
            .publish(
                envelope.reply_to.as_str(),
                Message::json(
                    serde_json::to_vec(&body).unwrap(),
                    Some(envelope.correlation_id.clone()),
                    None,
                ),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn call_returns_matching_reply_and_deregisters() {
        let h = harness().await;
        let (broker, dispatcher, mut requests) = (h.broker, h.dispatcher, h.requests);

        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let request = requests.next().await.unwrap().unwrap();
                answer(&broker, &request, 7).await;
                request
            })
        };

        let outcome = dispatcher
            .call(&json!({"n": 1}), Duration::from_secs(1), &CancellationToken::new())
            .await;
        let request = responder.await.unwrap();

        let CallOutcome::Replied(reply) = outcome else {
            panic!("expected reply, got {:?}", outcome);
        };
        assert_eq!(reply.value, 7);
        assert_eq!(
            request.message.correlation_id.as_ref().map(|id| id.as_str()),
            Some(reply.correlation_id.as_str())
        );
        assert_eq!(
            request.message.reply_to.as_ref(),
            Some(dispatcher.reply_address())
        );
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_without_leaking_slot() {
        let h = harness().await;
        let (dispatcher, mut requests) = (h.dispatcher, h.requests);

        let started = Instant::now();
        let outcome = dispatcher
            .call(&json!({}), Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert_eq!(outcome, CallOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));

        let request = requests.next().await.unwrap().unwrap();
        let id = request.message.correlation_id.unwrap();
        assert_eq!(dispatcher.registry().lookup(&id), None);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let h = harness().await;
        let (broker, dispatcher, mut requests) = (h.broker, h.dispatcher, h.requests);

        let outcome = dispatcher
            .call(&json!({}), Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert_eq!(outcome, CallOutcome::TimedOut);

        let request = requests.next().await.unwrap().unwrap();
        answer(&broker, &request, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Consumer is still serving later calls
        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let request = requests.next().await.unwrap().unwrap();
                answer(&broker, &request, 2).await;
            })
        };
        let outcome = dispatcher
            .call(&json!({}), Duration::from_secs(1), &CancellationToken::new())
            .await;
        responder.await.unwrap();

        assert!(matches!(outcome, CallOutcome::Replied(Reply { value: 2, .. })));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn cancelled_call_returns_cancelled_and_deregisters() {
        let h = harness().await;
        let dispatcher = &h.dispatcher;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let outcome = dispatcher.call(&json!({}), Duration::from_secs(5), &cancel).await;
        canceller.await.unwrap();

        assert_eq!(outcome, CallOutcome::Cancelled);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn dropped_call_future_deregisters() {
        let h = harness().await;
        let dispatcher = &h.dispatcher;

        let payload = json!({});
        let cancel = CancellationToken::new();
        let mut call = Box::pin(dispatcher.call(&payload, Duration::from_secs(5), &cancel));

        // Poll until the request is out and the call is parked on its slot
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut call)
                .await
                .is_err()
        );
        assert_eq!(dispatcher.registry().len(), 1);

        drop(call);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_returns_without_waiting() {
        let broker = Arc::new(MemoryBroker::new());
        let reply_address = broker.declare_reply_channel().await.unwrap();
        let registry = Arc::new(CorrelationRegistry::<Reply>::new());
        let dispatcher =
            RequestDispatcher::new(Arc::clone(&broker), registry, reply_address, "missing");

        let started = Instant::now();
        let outcome = dispatcher
            .call(&json!({}), Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            CallOutcome::PublishFailed(
                TransportError::UnknownDestination("missing".to_string()).to_string()
            )
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn closed_registry_abandons_new_calls() {
        let h = harness().await;
        let dispatcher = &h.dispatcher;
        dispatcher.registry().close("consumer stopped");

        let outcome = dispatcher
            .call(&json!({}), Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, CallOutcome::TransportAbandoned(_)));
    }

    #[tokio::test]
    async fn broker_shutdown_abandons_in_flight_call() {
        let h = harness().await;
        let (broker, dispatcher) = (&h.broker, &h.dispatcher);

        let call = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .call(&json!({}), Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.shutdown();

        let outcome = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call must not hang")
            .unwrap();
        assert!(matches!(outcome, CallOutcome::TransportAbandoned(_)));
        assert!(dispatcher.registry().is_empty());
    }
}
